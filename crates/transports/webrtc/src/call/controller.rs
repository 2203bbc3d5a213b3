//! Call controller: one participant's view of a consultation call
//!
//! The controller owns at most one `PeerSession`. Signaling messages are
//! handled one at a time on a pump task; each session's events are relayed
//! by a second task that holds local candidates back until the offer or
//! answer has been sent.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::events::{reason, CallEvent};
use crate::config::CallConfig;
use crate::media::{MediaAcquisition, TrackKind};
use crate::peer::{ConnectionState, EngineFactory, PeerEvent, PeerSession};
use crate::session::{CallRole, ParticipantId};
use crate::signaling::{
    IceCandidate, SessionDescription, SignalingEvent, SignalingMessage, SignalingPayload,
    SignalingTransport,
};
use crate::{Error, Result};

/// Snapshot of the active call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallInfo {
    pub call_id: String,
    pub role: CallRole,
    pub remote: ParticipantId,
    pub connection: ConnectionState,
}

struct ActiveCall {
    call_id: String,
    role: CallRole,
    remote: ParticipantId,
    session: PeerSession,
    relay: JoinHandle<()>,
}

impl Drop for ActiveCall {
    fn drop(&mut self) {
        self.relay.abort();
    }
}

struct Inner {
    local: ParticipantId,
    config: CallConfig,
    media: MediaAcquisition,
    signaling: Arc<dyn SignalingTransport>,
    engines: Arc<dyn EngineFactory>,
    events: mpsc::UnboundedSender<CallEvent>,
    call: Mutex<Option<ActiveCall>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    consecutive_failures: AtomicU32,
    /// Bumped by every `end_call`; a `start_call` that sees it change is
    /// discarded
    generation: AtomicU64,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            listener.abort();
        }
    }
}

impl Inner {
    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }

    fn is_active(&self) -> bool {
        self.call.lock().is_some()
    }

    /// Session of the active call if it is `call_id`
    fn session_for(&self, call_id: &str) -> Option<(CallRole, PeerSession)> {
        self.call
            .lock()
            .as_ref()
            .filter(|call| call.call_id == call_id)
            .map(|call| (call.role, call.session.clone()))
    }

    /// Remove the active call, only if it is `call_id` when one is given
    fn take_call(&self, call_id: Option<&str>) -> Option<ActiveCall> {
        let mut slot = self.call.lock();
        let matches = match (slot.as_ref(), call_id) {
            (Some(call), Some(id)) => call.call_id == id,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if matches {
            slot.take()
        } else {
            None
        }
    }

    /// Remove the active call if its session can no longer carry media
    fn take_finished_call(&self) -> Option<ActiveCall> {
        let mut slot = self.call.lock();
        if slot
            .as_ref()
            .is_some_and(|call| call.session.state().is_terminal())
        {
            slot.take()
        } else {
            None
        }
    }

    /// Make `session` the active call and start relaying its events
    ///
    /// Returns `false` if another call is already active.
    fn install(
        self: &Arc<Self>,
        call_id: &str,
        role: CallRole,
        remote: &ParticipantId,
        session: &PeerSession,
        session_events: mpsc::UnboundedReceiver<PeerEvent>,
        ready: watch::Receiver<bool>,
    ) -> bool {
        let mut slot = self.call.lock();
        if slot.is_some() {
            return false;
        }
        let relay = tokio::spawn(relay_session_events(
            Arc::downgrade(self),
            call_id.to_string(),
            remote.clone(),
            session_events,
            ready,
        ));
        *slot = Some(ActiveCall {
            call_id: call_id.to_string(),
            role,
            remote: remote.clone(),
            session: session.clone(),
            relay,
        });
        true
    }

    /// Close the call's session and tell the UI it is over
    async fn teardown(&self, call: ActiveCall, why: &str, notify_remote: bool) {
        call.relay.abort();
        let was_closed = call.session.is_closed();
        call.session.close().await;
        if !was_closed {
            self.emit(CallEvent::ConnectionStateChanged(ConnectionState::Closed));
        }
        if notify_remote {
            self.send_hangup(&call.call_id, &call.remote, why).await;
        }
        info!("Call {} with {} ended ({})", call.call_id, call.remote, why);
        self.emit(CallEvent::CallEnded {
            call_id: call.call_id.clone(),
            reason: Some(why.to_string()),
        });
    }

    /// Abandon a call attempt after `err`
    ///
    /// If the call was already ended by someone else the attempt's result
    /// is discarded and `InvalidState` returned instead.
    async fn abandon(&self, call_id: &str, err: Error, notify_remote: bool) -> Error {
        match self.take_call(Some(call_id)) {
            Some(call) => {
                warn!("Call {} failed: {}", call_id, err);
                let why = match &err {
                    Error::DeviceError(_) => reason::DEVICE_UNAVAILABLE,
                    Error::SignalingError(_) => reason::SIGNALING_UNAVAILABLE,
                    _ => reason::NEGOTIATION_FAILED,
                };
                self.teardown(call, why, notify_remote).await;
                err
            }
            None => {
                debug!("Call {} ended while in flight, discarding: {}", call_id, err);
                Error::InvalidState(format!(
                    "call {} ended before it was established",
                    call_id
                ))
            }
        }
    }

    async fn send(&self, message: SignalingMessage) -> Result<()> {
        debug!(
            "Sending {} for call {} to {}",
            message.kind(),
            message.call_id,
            message.recipient
        );
        self.signaling.send(message).await?;
        self.consecutive_failures.store(0, Ordering::Release);
        Ok(())
    }

    async fn send_hangup(&self, call_id: &str, remote: &ParticipantId, why: &str) {
        let message = SignalingMessage::new(
            call_id,
            self.local.clone(),
            remote.clone(),
            SignalingPayload::Hangup {
                reason: Some(why.to_string()),
            },
        );
        if let Err(e) = self.signaling.send(message).await {
            warn!("Failed to send hangup for call {}: {}", call_id, e);
        }
    }

    /// Count a signaling failure and surface it
    ///
    /// Returns `true` when the failure threshold has been reached.
    fn record_signaling_failure(&self, err: &Error) -> bool {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        warn!("Signaling failure {} in a row: {}", failures, err);
        self.emit(CallEvent::error(err));

        let limit = self.config.signaling.max_consecutive_failures;
        limit > 0 && failures >= limit
    }

    async fn end_after_signaling_failures(&self) {
        if let Some(call) = self.take_call(None) {
            error!(
                "Ending call {} after {} consecutive signaling failures",
                call.call_id,
                self.consecutive_failures.load(Ordering::Acquire)
            );
            self.teardown(call, reason::SIGNALING_UNAVAILABLE, false).await;
        }
    }

    async fn handle_signaling_event(self: &Arc<Self>, event: SignalingEvent) {
        match event {
            SignalingEvent::Messages(batch) => {
                self.consecutive_failures.store(0, Ordering::Release);
                for message in batch {
                    self.handle_message(message).await;
                }
            }
            SignalingEvent::Error { detail } => {
                if self.record_signaling_failure(&Error::SignalingError(detail)) {
                    self.end_after_signaling_failures().await;
                }
            }
        }
    }

    async fn handle_message(self: &Arc<Self>, message: SignalingMessage) {
        if message.recipient != self.local {
            warn!(
                "Ignoring {} addressed to {} (we are {})",
                message.kind(),
                message.recipient,
                self.local
            );
            return;
        }
        debug!(
            "Received {} for call {} from {}",
            message.kind(),
            message.call_id,
            message.sender
        );

        let SignalingMessage {
            call_id,
            sender,
            body,
            ..
        } = message;
        match body {
            SignalingPayload::Offer(offer) => self.on_offer(call_id, sender, offer).await,
            SignalingPayload::Answer(answer) => self.on_answer(&call_id, answer).await,
            SignalingPayload::IceCandidate(candidate) => self.on_candidate(&call_id, candidate).await,
            SignalingPayload::Hangup { reason } => self.on_hangup(&call_id, &sender, reason).await,
        }
    }

    async fn on_offer(self: &Arc<Self>, call_id: String, from: ParticipantId, offer: SessionDescription) {
        if self.session_for(&call_id).is_some() {
            debug!("Ignoring duplicate offer for call {}", call_id);
            return;
        }
        if let Some(finished) = self.take_finished_call() {
            self.teardown(finished, reason::SUPERSEDED, false).await;
        }
        if self.is_active() {
            info!("Busy, refusing call {} from {}", call_id, from);
            self.send_hangup(&call_id, &from, reason::BUSY).await;
            return;
        }

        let (session, session_events) =
            match PeerSession::new(call_id.clone(), self.engines.as_ref()).await {
                Ok(created) => created,
                Err(e) => {
                    error!("Failed to create session for call {}: {}", call_id, e);
                    self.emit(CallEvent::error(&e));
                    self.send_hangup(&call_id, &from, reason::NEGOTIATION_FAILED).await;
                    return;
                }
            };
        let (ready_tx, ready_rx) = watch::channel(false);
        if !self.install(&call_id, CallRole::Callee, &from, &session, session_events, ready_rx) {
            session.close().await;
            self.send_hangup(&call_id, &from, reason::BUSY).await;
            return;
        }

        info!("Incoming call {} from {}", call_id, from);
        self.emit(CallEvent::IncomingCall {
            from: from.clone(),
            call_id: call_id.clone(),
        });

        match self.answer(&call_id, &from, &session, offer).await {
            Ok(()) => {
                let _ = ready_tx.send(true);
            }
            Err(e) => {
                let err = self.abandon(&call_id, e, true).await;
                if !matches!(err, Error::InvalidState(_)) {
                    self.emit(CallEvent::error(&err));
                }
            }
        }
    }

    async fn answer(
        &self,
        call_id: &str,
        caller: &ParticipantId,
        session: &PeerSession,
        offer: SessionDescription,
    ) -> Result<()> {
        let media = self.config.media;
        let stream = self.media.acquire(media.video, media.audio).await?;
        self.emit(CallEvent::LocalStream(stream.clone()));
        session.attach_local_stream(stream).await?;

        let answer = session.accept_offer(offer).await?;
        if self.session_for(call_id).is_none() {
            return Err(Error::InvalidState(format!("call {} ended", call_id)));
        }
        self.send(SignalingMessage::new(
            call_id,
            self.local.clone(),
            caller.clone(),
            SignalingPayload::Answer(answer),
        ))
        .await
    }

    async fn on_answer(&self, call_id: &str, answer: SessionDescription) {
        let session = match self.session_for(call_id) {
            Some((CallRole::Caller, session)) => session,
            _ => {
                let err = Error::ProtocolError(format!(
                    "no session awaiting an answer for call {}",
                    call_id
                ));
                warn!("{}", err);
                return;
            }
        };

        match session.accept_answer(answer).await {
            Ok(()) => {}
            Err(Error::ProtocolError(detail)) => warn!("Ignoring answer: {}", detail),
            Err(e) => {
                let err = self.abandon(call_id, e, true).await;
                if !matches!(err, Error::InvalidState(_)) {
                    self.emit(CallEvent::error(&err));
                }
            }
        }
    }

    async fn on_candidate(&self, call_id: &str, candidate: IceCandidate) {
        match self.session_for(call_id) {
            Some((_, session)) => {
                if let Err(e) = session.add_remote_candidate(candidate).await {
                    warn!("Call {} candidate rejected: {}", call_id, e);
                }
            }
            None => warn!("Ignoring candidate for inactive call {}", call_id),
        }
    }

    async fn on_hangup(&self, call_id: &str, from: &ParticipantId, why: Option<String>) {
        let Some(call) = self.take_call(Some(call_id)) else {
            debug!("Ignoring hangup for inactive call {}", call_id);
            return;
        };
        if &call.remote != from {
            warn!("Hangup for call {} came from {}, not {}", call_id, from, call.remote);
        }

        call.relay.abort();
        if call.session.mark_remote_closed() {
            self.emit(CallEvent::ConnectionStateChanged(ConnectionState::Disconnected));
        }
        call.session.close().await;
        self.emit(CallEvent::ConnectionStateChanged(ConnectionState::Closed));

        info!(
            "Remote {} hung up call {} ({})",
            from,
            call_id,
            why.as_deref().unwrap_or("no reason")
        );
        self.emit(CallEvent::CallEnded {
            call_id: call_id.to_string(),
            reason: why,
        });
    }
}

async fn pump_signaling(controller: Weak<Inner>, mut events: mpsc::UnboundedReceiver<SignalingEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = controller.upgrade() else { break };
        inner.handle_signaling_event(event).await;
    }
}

async fn relay_session_events(
    controller: Weak<Inner>,
    call_id: String,
    remote: ParticipantId,
    mut events: mpsc::UnboundedReceiver<PeerEvent>,
    mut ready: watch::Receiver<bool>,
) {
    let mut held: Vec<IceCandidate> = Vec::new();
    let mut released = *ready.borrow();
    let mut gate_alive = true;

    loop {
        tokio::select! {
            changed = ready.changed(), if !released && gate_alive => {
                if changed.is_err() {
                    // The attempt was abandoned before its description went out
                    gate_alive = false;
                    continue;
                }
                if !*ready.borrow_and_update() {
                    continue;
                }
                released = true;
                let Some(inner) = controller.upgrade() else { break };
                if !held.is_empty() {
                    debug!("Relaying {} held candidate(s) for call {}", held.len(), call_id);
                }
                for candidate in held.drain(..) {
                    relay_candidate(&inner, &call_id, &remote, candidate).await;
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                let Some(inner) = controller.upgrade() else { break };
                match event {
                    PeerEvent::LocalCandidate(candidate) if released => {
                        relay_candidate(&inner, &call_id, &remote, candidate).await;
                    }
                    PeerEvent::LocalCandidate(candidate) => held.push(candidate),
                    PeerEvent::StateChanged(state) => {
                        inner.emit(CallEvent::ConnectionStateChanged(state));
                    }
                    PeerEvent::RemoteStream(stream) => {
                        inner.emit(CallEvent::RemoteStream(stream));
                    }
                }
            }
        }
    }
}

async fn relay_candidate(inner: &Arc<Inner>, call_id: &str, remote: &ParticipantId, candidate: IceCandidate) {
    let message = SignalingMessage::new(
        call_id,
        inner.local.clone(),
        remote.clone(),
        SignalingPayload::IceCandidate(candidate),
    );
    if let Err(e) = inner.send(message).await {
        if inner.record_signaling_failure(&e) {
            // Teardown aborts this relay task, so it runs elsewhere
            let inner = Arc::clone(inner);
            tokio::spawn(async move { inner.end_after_signaling_failures().await });
        }
    }
}

/// Orchestrates media, peer session and signaling for one participant
///
/// Cloning yields another handle to the same controller.
#[derive(Clone)]
pub struct CallController {
    inner: Arc<Inner>,
}

impl CallController {
    /// Create an idle controller for `local`
    ///
    /// Returns the controller and the stream of UI events.
    #[instrument(skip_all, fields(participant = %local))]
    pub fn new(
        local: ParticipantId,
        config: CallConfig,
        media: MediaAcquisition,
        signaling: Arc<dyn SignalingTransport>,
        engines: Arc<dyn EngineFactory>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<CallEvent>)> {
        if local.is_empty() {
            return Err(Error::InvalidConfig("participant id is empty".to_string()));
        }
        config.validate()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            local,
            config,
            media,
            signaling,
            engines,
            events: events_tx,
            call: Mutex::new(None),
            listener: Mutex::new(None),
            consecutive_failures: AtomicU32::new(0),
            generation: AtomicU64::new(0),
        });
        info!("Call controller ready for {}", inner.local);
        Ok((Self { inner }, events_rx))
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.inner.local
    }

    pub fn is_active(&self) -> bool {
        self.inner.is_active()
    }

    pub fn is_listening(&self) -> bool {
        self.inner
            .listener
            .lock()
            .as_ref()
            .is_some_and(|pump| !pump.is_finished())
    }

    /// The active call, if any
    pub fn state(&self) -> Option<CallInfo> {
        self.inner.call.lock().as_ref().map(|call| CallInfo {
            call_id: call.call_id.clone(),
            role: call.role,
            remote: call.remote.clone(),
            connection: call.session.state(),
        })
    }

    /// Peer session of the active call
    pub fn session(&self) -> Option<PeerSession> {
        self.inner.call.lock().as_ref().map(|call| call.session.clone())
    }

    /// Subscribe to signaling so incoming offers are answered
    pub async fn listen(&self) -> Result<()> {
        if self.is_listening() {
            return Ok(());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .signaling
            .subscribe(self.inner.local.clone(), tx)
            .await?;
        let pump = tokio::spawn(pump_signaling(Arc::downgrade(&self.inner), rx));
        if let Some(previous) = self.inner.listener.lock().replace(pump) {
            previous.abort();
        }
        debug!("{} listening for signaling", self.inner.local);
        Ok(())
    }

    async fn stop_listening(&self) {
        if let Some(pump) = self.inner.listener.lock().take() {
            pump.abort();
        }
        self.inner.signaling.unsubscribe(&self.inner.local).await;
    }

    /// Call `remote`
    ///
    /// Returns once the offer has been sent. A previous attempt whose session
    /// failed or disconnected is torn down first.
    pub async fn start_call(&self, remote: impl Into<ParticipantId>) -> Result<String> {
        let inner = &self.inner;
        let remote = remote.into();
        if remote.is_empty() || remote == inner.local {
            return Err(Error::InvalidConfig(format!(
                "cannot call participant '{}'",
                remote
            )));
        }

        if let Some(finished) = inner.take_finished_call() {
            inner.teardown(finished, reason::ENDED, false).await;
        }
        if inner.is_active() {
            return Err(Error::InvalidState("a call is already active".to_string()));
        }
        let generation = inner.generation.load(Ordering::Acquire);
        self.listen().await?;

        let call_id = Uuid::new_v4().to_string();
        let (session, session_events) = PeerSession::new(call_id.clone(), inner.engines.as_ref()).await?;
        if inner.generation.load(Ordering::Acquire) != generation {
            debug!("Call {} ended before its session was installed", call_id);
            session.close().await;
            self.stop_listening().await;
            return Err(Error::InvalidState(format!(
                "call {} ended before it was established",
                call_id
            )));
        }
        let (ready_tx, ready_rx) = watch::channel(false);
        if !inner.install(&call_id, CallRole::Caller, &remote, &session, session_events, ready_rx) {
            session.close().await;
            return Err(Error::InvalidState("a call is already active".to_string()));
        }
        info!("Calling {} (call {})", remote, call_id);

        match self.offer(&call_id, &remote, &session).await {
            Ok(()) => {
                let _ = ready_tx.send(true);
                Ok(call_id)
            }
            Err(e) => Err(inner.abandon(&call_id, e, false).await),
        }
    }

    async fn offer(&self, call_id: &str, remote: &ParticipantId, session: &PeerSession) -> Result<()> {
        let inner = &self.inner;
        let media = inner.config.media;
        let stream = inner.media.acquire(media.video, media.audio).await?;
        inner.emit(CallEvent::LocalStream(stream.clone()));
        session.attach_local_stream(stream).await?;

        let offer = session.create_offer().await?;
        if inner.session_for(call_id).is_none() {
            return Err(Error::InvalidState(format!("call {} ended", call_id)));
        }
        inner
            .send(SignalingMessage::new(
                call_id,
                inner.local.clone(),
                remote.clone(),
                SignalingPayload::Offer(offer),
            ))
            .await
    }

    /// Hang up, stop listening and return to idle
    ///
    /// Also discards a `start_call` still in flight. Safe to call when idle.
    pub async fn end_call(&self) -> Result<()> {
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        self.stop_listening().await;
        if let Some(call) = self.inner.take_call(None) {
            self.inner.teardown(call, reason::ENDED, true).await;
        }
        Ok(())
    }

    /// Mute or unmute local tracks of `kind` without renegotiating
    pub fn set_track_enabled(&self, kind: TrackKind, enabled: bool) -> Result<()> {
        let stream = self
            .session()
            .and_then(|session| session.local_stream())
            .ok_or_else(|| Error::InvalidState("no local media".to_string()))?;
        self.inner.media.set_track_enabled(&stream, kind, enabled)
    }

    pub fn toggle_audio(&self, enabled: bool) -> Result<()> {
        self.set_track_enabled(TrackKind::Audio, enabled)
    }

    pub fn toggle_video(&self, enabled: bool) -> Result<()> {
        self.set_track_enabled(TrackKind::Video, enabled)
    }
}

impl std::fmt::Debug for CallController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallController")
            .field("participant", &self.inner.local)
            .field("call", &self.state())
            .finish()
    }
}
