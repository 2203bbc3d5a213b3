//! In-process test doubles
//!
//! [`SimulatedEngine`] negotiates without sockets: it writes deterministic
//! SDP, gathers fake host candidates on a timer and reports `connected` once
//! a remote candidate has been applied on top of both descriptions.
//! [`FlakyMailbox`] injects relay outages into any mailbox.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::media::{LocalTrack, RemoteTrack, TrackKind};
use crate::peer::{ConnectionState, EngineEvent, EngineFactory, NegotiationEngine};
use crate::session::ParticipantId;
use crate::signaling::{IceCandidate, Mailbox, SdpType, SessionDescription, SignalingMessage};
use crate::{Error, Result};

/// How ICE ends for a simulated engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceOutcome {
    Connect,
    Fail,
}

#[derive(Debug, Clone)]
pub struct SimulatedOptions {
    /// Local candidates gathered after each local description
    pub candidates: usize,
    pub candidate_interval: Duration,
    /// Delay between connectivity being possible and it being reported
    pub connect_delay: Duration,
    /// Time taken by create_offer/create_answer
    pub description_delay: Duration,
    /// Time taken by the factory to build an engine
    pub create_delay: Duration,
    pub outcome: IceOutcome,
}

impl Default for SimulatedOptions {
    fn default() -> Self {
        Self {
            candidates: 2,
            candidate_interval: Duration::from_millis(5),
            connect_delay: Duration::from_millis(10),
            description_delay: Duration::ZERO,
            create_delay: Duration::ZERO,
            outcome: IceOutcome::Connect,
        }
    }
}

/// Creates [`SimulatedEngine`]s and keeps them for inspection
#[derive(Default)]
pub struct SimulatedEngineFactory {
    options: SimulatedOptions,
    next_id: AtomicUsize,
    engines: Mutex<Vec<Arc<SimulatedEngine>>>,
}

impl SimulatedEngineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: SimulatedOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    /// Engines whose ICE always fails
    pub fn failing() -> Self {
        Self::with_options(SimulatedOptions {
            outcome: IceOutcome::Fail,
            ..SimulatedOptions::default()
        })
    }

    pub fn with_candidates(mut self, candidates: usize) -> Self {
        self.options.candidates = candidates;
        self
    }

    pub fn with_description_delay(mut self, delay: Duration) -> Self {
        self.options.description_delay = delay;
        self
    }

    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.options.create_delay = delay;
        self
    }

    /// Every engine created so far, oldest first
    pub fn engines(&self) -> Vec<Arc<SimulatedEngine>> {
        self.engines.lock().clone()
    }

    pub fn created(&self) -> usize {
        self.engines.lock().len()
    }
}

#[async_trait]
impl EngineFactory for SimulatedEngineFactory {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<Arc<dyn NegotiationEngine>> {
        if !self.options.create_delay.is_zero() {
            tokio::time::sleep(self.options.create_delay).await;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let engine = Arc::new(SimulatedEngine {
            id,
            options: self.options.clone(),
            events,
            state: Mutex::new(SimState::default()),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        self.engines.lock().push(Arc::clone(&engine));
        Ok(engine)
    }
}

#[derive(Default)]
struct SimState {
    local_tracks: Vec<(TrackKind, String)>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied: Vec<IceCandidate>,
    outcome_scheduled: bool,
}

pub struct SimulatedEngine {
    id: usize,
    options: SimulatedOptions,
    events: mpsc::UnboundedSender<EngineEvent>,
    state: Mutex<SimState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SimulatedEngine {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Remote candidates applied, in order
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn local_track_count(&self) -> usize {
        self.state.lock().local_tracks.len()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::NegotiationError(format!(
                "simulated engine {} is closed",
                self.id
            )));
        }
        Ok(())
    }

    fn render_sdp(&self, tracks: &[(TrackKind, String)]) -> String {
        let mut sdp = format!(
            "v=0\r\no=- {id} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\na=x-sim-engine:{id}\r\n",
            id = self.id
        );
        for (mid, (kind, track_id)) in tracks.iter().enumerate() {
            let payload = match kind {
                TrackKind::Audio => 111,
                TrackKind::Video => 96,
            };
            sdp.push_str(&format!(
                "m={kind} 9 UDP/TLS/RTP/SAVPF {payload}\r\na=mid:{mid}\r\na=msid:sim-stream-{id} {track_id}\r\n",
                id = self.id
            ));
        }
        sdp
    }

    fn spawn(&self, task: impl std::future::Future<Output = ()> + Send + 'static) {
        let handle = tokio::spawn(task);
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    fn start_gathering(&self) {
        let events = self.events.clone();
        let count = self.options.candidates;
        let interval = self.options.candidate_interval;
        let id = self.id;
        self.spawn(async move {
            for i in 0..count {
                tokio::time::sleep(interval).await;
                let candidate = IceCandidate::new(
                    format!(
                        "candidate:{} 1 udp {} 127.0.0.1 {} typ host",
                        id * 100 + i,
                        2_130_706_431u32 - i as u32,
                        40_000 + (id % 2000) * 10 + i
                    ),
                    Some("0".to_string()),
                    Some(0),
                );
                if events.send(EngineEvent::LocalCandidate(candidate)).is_err() {
                    break;
                }
            }
        });
    }

    fn maybe_report_outcome(&self, state: &mut SimState) {
        if state.outcome_scheduled
            || state.local.is_none()
            || state.remote.is_none()
            || state.applied.is_empty()
        {
            return;
        }
        state.outcome_scheduled = true;

        let events = self.events.clone();
        let delay = self.options.connect_delay;
        let final_state = match self.options.outcome {
            IceOutcome::Connect => ConnectionState::Connected,
            IceOutcome::Fail => ConnectionState::Failed,
        };
        debug!("Simulated engine {} will report {}", self.id, final_state);
        self.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(EngineEvent::StateChanged(final_state));
        });
    }

    async fn describe(&self, sdp_type: SdpType) -> Result<SessionDescription> {
        if !self.options.description_delay.is_zero() {
            tokio::time::sleep(self.options.description_delay).await;
        }
        self.ensure_open()?;

        let description = {
            let mut state = self.state.lock();
            if sdp_type == SdpType::Answer
                && state.remote.as_ref().map(|r| r.sdp_type) != Some(SdpType::Offer)
            {
                return Err(Error::NegotiationError(
                    "cannot answer without a remote offer".to_string(),
                ));
            }
            let sdp = self.render_sdp(&state.local_tracks);
            let description = SessionDescription { sdp_type, sdp };
            state.local = Some(description.clone());
            self.maybe_report_outcome(&mut state);
            description
        };

        self.start_gathering();
        Ok(description)
    }
}

/// Remote tracks announced by `a=msid:<stream> <track>` lines
fn remote_tracks(sdp: &str) -> Vec<RemoteTrack> {
    let mut kind = None;
    let mut tracks = Vec::new();
    for line in sdp.lines() {
        if let Some(media) = line.strip_prefix("m=") {
            kind = match media.split_whitespace().next() {
                Some("audio") => Some(TrackKind::Audio),
                Some("video") => Some(TrackKind::Video),
                _ => None,
            };
        } else if let (Some(msid), Some(kind)) = (line.strip_prefix("a=msid:"), kind) {
            let mut parts = msid.split_whitespace();
            if let (Some(stream_id), Some(id)) = (parts.next(), parts.next()) {
                tracks.push(RemoteTrack {
                    id: id.to_string(),
                    kind,
                    stream_id: stream_id.to_string(),
                });
            }
        }
    }
    tracks
}

#[async_trait]
impl NegotiationEngine for SimulatedEngine {
    async fn add_local_track(&self, track: &LocalTrack) -> Result<()> {
        self.ensure_open()?;
        self.state
            .lock()
            .local_tracks
            .push((track.kind(), track.id().to_string()));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.describe(SdpType::Offer).await
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.describe(SdpType::Answer).await
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.ensure_open()?;
        if !description.sdp.starts_with("v=0") {
            return Err(Error::NegotiationError("malformed SDP".to_string()));
        }

        let tracks = {
            let mut state = self.state.lock();
            let local_type = state.local.as_ref().map(|l| l.sdp_type);
            match (description.sdp_type, local_type) {
                (SdpType::Offer, Some(SdpType::Offer)) => {
                    return Err(Error::NegotiationError(
                        "remote offer while a local offer is pending".to_string(),
                    ))
                }
                (SdpType::Answer, Some(SdpType::Offer)) => {}
                (SdpType::Answer, _) => {
                    return Err(Error::NegotiationError(
                        "remote answer without a local offer".to_string(),
                    ))
                }
                _ => {}
            }
            let tracks = remote_tracks(&description.sdp);
            state.remote = Some(description);
            self.maybe_report_outcome(&mut state);
            tracks
        };

        for track in tracks {
            let _ = self.events.send(EngineEvent::RemoteTrack(track));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        if state.remote.is_none() {
            return Err(Error::IceCandidateError(
                "remote description not set".to_string(),
            ));
        }
        state.applied.push(candidate);
        self.maybe_report_outcome(&mut state);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        Ok(())
    }
}

/// Mailbox wrapper that fails on demand
pub struct FlakyMailbox {
    inner: Arc<dyn Mailbox>,
    failing: AtomicBool,
}

impl FlakyMailbox {
    pub fn new(inner: Arc<dyn Mailbox>) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(false),
        }
    }

    /// While set, every push and drain fails with `SignalingError`
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::Acquire) {
            return Err(Error::SignalingError("simulated relay outage".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Mailbox for FlakyMailbox {
    async fn push(&self, message: SignalingMessage) -> Result<()> {
        self.check()?;
        self.inner.push(message).await
    }

    async fn drain(&self, recipient: &ParticipantId, limit: usize) -> Result<Vec<SignalingMessage>> {
        self.check()?;
        self.inner.drain(recipient, limit).await
    }
}
