//! Peer session: one call attempt's negotiation and media state

use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, trace, warn};

use super::candidates::{Admission, CandidateBuffer};
use super::engine::{EngineEvent, EngineFactory, NegotiationEngine};
use super::ConnectionState;
use crate::media::{LocalStream, RemoteStream};
use crate::session::CallRole;
use crate::signaling::{IceCandidate, SdpType, SessionDescription};
use crate::{Error, Result};

/// Notifications for the owner of a `PeerSession`
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A local candidate to relay to the remote participant
    LocalCandidate(IceCandidate),

    StateChanged(ConnectionState),

    /// A remote track was merged into the session's remote stream
    RemoteStream(RemoteStream),
}

#[derive(Default)]
struct Negotiation {
    role: Option<CallRole>,
    local: Option<SessionDescription>,
    remote_applied: bool,
    candidates: CandidateBuffer,
}

impl Negotiation {
    fn started(&self) -> bool {
        self.role.is_some()
    }
}

struct Inner {
    id: String,
    state: RwLock<ConnectionState>,
    events: mpsc::UnboundedSender<PeerEvent>,
    engine: Arc<dyn NegotiationEngine>,
    /// Serializes offer/answer/candidate operations
    negotiation: tokio::sync::Mutex<Negotiation>,
    role: RwLock<Option<CallRole>>,
    local_stream: Mutex<Option<LocalStream>>,
    remote_stream: RemoteStream,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    fn is_closed(&self) -> bool {
        self.state().is_closed()
    }

    /// Apply a transition if the state machine allows it
    fn transition(&self, next: ConnectionState) -> bool {
        let mut state = self.state.write();
        let current = *state;
        if current == next || !current.can_transition_to(next) {
            trace!("Session {} ignoring {} -> {}", self.id, current, next);
            return false;
        }
        debug!("Session {} state {} -> {}", self.id, current, next);
        *state = next;
        // Sent under the lock so observers see transitions in order
        let _ = self.events.send(PeerEvent::StateChanged(next));
        true
    }

    fn on_engine_event(&self, event: EngineEvent) {
        if self.is_closed() {
            return;
        }
        match event {
            EngineEvent::LocalCandidate(candidate) => {
                trace!("Session {} gathered {}", self.id, candidate.candidate);
                let _ = self.events.send(PeerEvent::LocalCandidate(candidate));
            }
            EngineEvent::StateChanged(state) => {
                self.transition(state);
            }
            EngineEvent::RemoteTrack(track) => {
                let kind = track.kind;
                if self.remote_stream.add_track(track) {
                    info!("Session {} received remote {} track", self.id, kind);
                    let _ = self
                        .events
                        .send(PeerEvent::RemoteStream(self.remote_stream.clone()));
                }
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
    }
}

async fn pump_engine_events(session: Weak<Inner>, mut events: mpsc::UnboundedReceiver<EngineEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = session.upgrade() else { break };
        inner.on_engine_event(event);
    }
}

/// One call attempt
///
/// Constructed fresh for every attempt and discarded once closed. Handles are
/// cheap to clone and share the same session.
#[derive(Clone)]
pub struct PeerSession {
    inner: Arc<Inner>,
}

impl PeerSession {
    /// Create a session with a new negotiation engine
    ///
    /// Returns the session and the stream of its events.
    #[instrument(skip(engines), fields(session_id = %id))]
    pub async fn new(
        id: String,
        engines: &dyn EngineFactory,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PeerEvent>)> {
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let engine = engines.create(engine_tx).await?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            id,
            state: RwLock::new(ConnectionState::New),
            events: events_tx,
            engine,
            negotiation: tokio::sync::Mutex::new(Negotiation::default()),
            role: RwLock::new(None),
            local_stream: Mutex::new(None),
            remote_stream: RemoteStream::new(),
            pump: Mutex::new(None),
        });

        let pump = tokio::spawn(pump_engine_events(Arc::downgrade(&inner), engine_rx));
        *inner.pump.lock() = Some(pump);

        info!("Created peer session {}", inner.id);
        Ok((Self { inner }, events_rx))
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Role taken by the first offer/answer operation
    pub fn role(&self) -> Option<CallRole> {
        *self.inner.role.read()
    }

    pub fn local_stream(&self) -> Option<LocalStream> {
        self.inner.local_stream.lock().clone()
    }

    pub fn remote_stream(&self) -> RemoteStream {
        self.inner.remote_stream.clone()
    }

    /// Whether both handles refer to the same session
    pub fn same_session(&self, other: &PeerSession) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn closed_error(&self, operation: &str) -> Error {
        Error::NegotiationError(format!(
            "cannot {} on closed session {}",
            operation, self.inner.id
        ))
    }

    /// Attach captured media; must happen before the offer or answer
    ///
    /// On a closed session the stream is released and an error returned.
    pub async fn attach_local_stream(&self, stream: LocalStream) -> Result<()> {
        let negotiation = self.inner.negotiation.lock().await;
        if self.is_closed() {
            stream.release();
            return Err(Error::InvalidState(format!(
                "session {} is closed",
                self.inner.id
            )));
        }
        if negotiation.started() {
            return Err(Error::UnsupportedOperation(
                "local media cannot change after negotiation started (renegotiation)".to_string(),
            ));
        }
        if let Some(existing) = self.local_stream() {
            if existing.same_stream(&stream) {
                return Ok(());
            }
            return Err(Error::UnsupportedOperation(
                "a local stream is already attached".to_string(),
            ));
        }

        for track in stream.tracks() {
            self.inner.engine.add_local_track(&track).await?;
        }
        debug!(
            "Session {} attached local stream {} ({} tracks)",
            self.inner.id,
            stream.id(),
            stream.track_count()
        );
        *self.inner.local_stream.lock() = Some(stream);

        // close() may have run while tracks were being added
        if self.is_closed() {
            self.release_local_stream();
            return Err(self.closed_error("attach media"));
        }
        Ok(())
    }

    /// Caller side: create the offer and set it as local description
    pub async fn create_offer(&self) -> Result<SessionDescription> {
        let mut negotiation = self.inner.negotiation.lock().await;
        if self.is_closed() {
            return Err(self.closed_error("create offer"));
        }
        if negotiation.started() {
            return Err(Error::UnsupportedOperation(
                "renegotiation is not supported".to_string(),
            ));
        }
        negotiation.role = Some(CallRole::Caller);
        *self.inner.role.write() = Some(CallRole::Caller);
        self.inner.transition(ConnectionState::Connecting);

        let offer = self.inner.engine.create_offer().await?;
        if self.is_closed() {
            return Err(self.closed_error("create offer"));
        }

        negotiation.local = Some(offer.clone());
        info!("Session {} created offer", self.inner.id);
        Ok(offer)
    }

    /// Callee side: apply the remote offer and produce the answer
    pub async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription> {
        let mut negotiation = self.inner.negotiation.lock().await;
        if self.is_closed() {
            return Err(self.closed_error("accept offer"));
        }
        if offer.sdp_type != SdpType::Offer {
            return Err(Error::NegotiationError(
                "accept_offer called with an answer".to_string(),
            ));
        }
        if negotiation.started() {
            return Err(Error::UnsupportedOperation(
                "renegotiation is not supported".to_string(),
            ));
        }
        negotiation.role = Some(CallRole::Callee);
        *self.inner.role.write() = Some(CallRole::Callee);
        self.inner.transition(ConnectionState::Connecting);

        self.inner.engine.set_remote_description(offer).await?;
        if self.is_closed() {
            return Err(self.closed_error("accept offer"));
        }
        negotiation.remote_applied = true;
        self.flush_candidates(&mut negotiation).await;

        let answer = self.inner.engine.create_answer().await?;
        if self.is_closed() {
            return Err(self.closed_error("accept offer"));
        }

        negotiation.local = Some(answer.clone());
        info!("Session {} accepted offer", self.inner.id);
        Ok(answer)
    }

    /// Caller side: apply the remote answer
    ///
    /// Ignored once the session is closed.
    pub async fn accept_answer(&self, answer: SessionDescription) -> Result<()> {
        let mut negotiation = self.inner.negotiation.lock().await;
        if self.is_closed() {
            debug!("Session {} closed, ignoring answer", self.inner.id);
            return Ok(());
        }
        if negotiation.role != Some(CallRole::Caller) || negotiation.local.is_none() {
            return Err(Error::NegotiationError(format!(
                "no offer was created on session {}",
                self.inner.id
            )));
        }
        if negotiation.remote_applied {
            return Err(Error::ProtocolError(format!(
                "session {} already has an answer",
                self.inner.id
            )));
        }
        if answer.sdp_type != SdpType::Answer {
            return Err(Error::NegotiationError(
                "accept_answer called with an offer".to_string(),
            ));
        }

        self.inner.engine.set_remote_description(answer).await?;
        if self.is_closed() {
            return Ok(());
        }
        negotiation.remote_applied = true;
        self.flush_candidates(&mut negotiation).await;
        info!("Session {} applied answer", self.inner.id);
        Ok(())
    }

    /// Apply a remote candidate, or buffer it until the remote description
    /// is set
    ///
    /// Duplicates and malformed candidates are dropped; engine failures are
    /// logged. Ignored once the session is closed.
    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut negotiation = self.inner.negotiation.lock().await;
        if self.is_closed() {
            return Ok(());
        }
        if !candidate.is_well_formed() {
            warn!(
                "Session {} dropping malformed candidate {:?}",
                self.inner.id, candidate.candidate
            );
            return Ok(());
        }

        match negotiation.candidates.admit(candidate) {
            Admission::Duplicate => trace!("Session {} dropping duplicate candidate", self.inner.id),
            Admission::Buffered => debug!(
                "Session {} buffered candidate ({} pending)",
                self.inner.id,
                negotiation.candidates.pending_len()
            ),
            Admission::Apply(candidate) => self.apply_candidate(candidate).await,
        }
        Ok(())
    }

    async fn flush_candidates(&self, negotiation: &mut Negotiation) {
        let buffered = negotiation.candidates.release();
        if !buffered.is_empty() {
            debug!(
                "Session {} applying {} buffered candidate(s)",
                self.inner.id,
                buffered.len()
            );
        }
        for candidate in buffered {
            self.apply_candidate(candidate).await;
        }
    }

    async fn apply_candidate(&self, candidate: IceCandidate) {
        if let Err(e) = self.inner.engine.add_ice_candidate(candidate).await {
            warn!("Session {} failed to apply candidate: {}", self.inner.id, e);
        }
    }

    /// The remote participant hung up
    pub fn mark_remote_closed(&self) -> bool {
        let state = self.state();
        if matches!(state, ConnectionState::Connecting | ConnectionState::Connected) {
            self.inner.transition(ConnectionState::Disconnected)
        } else {
            false
        }
    }

    fn release_local_stream(&self) {
        if let Some(stream) = self.inner.local_stream.lock().take() {
            stream.release();
        }
    }

    /// Tear the session down; further calls are no-ops
    ///
    /// Does not wait for an in-flight negotiation step, whose result is
    /// discarded.
    pub async fn close(&self) {
        {
            let mut state = self.inner.state.write();
            if state.is_closed() {
                return;
            }
            debug!("Session {} state {} -> closed", self.inner.id, *state);
            *state = ConnectionState::Closed;
            let _ = self
                .inner
                .events
                .send(PeerEvent::StateChanged(ConnectionState::Closed));
        }

        if let Some(pump) = self.inner.pump.lock().take() {
            pump.abort();
        }
        self.release_local_stream();
        if let Err(e) = self.inner.engine.close().await {
            error!("Session {} failed to close engine: {}", self.inner.id, e);
        }
        info!("Closed peer session {}", self.inner.id);
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("role", &self.role())
            .finish()
    }
}
