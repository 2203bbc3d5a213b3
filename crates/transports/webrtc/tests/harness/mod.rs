//! In-process call test harness
//!
//! Wires participants to one shared in-memory mailbox with fast polling and
//! simulated negotiation engines, and records every message pushed through
//! the relay so tests can count offers and answers.
//!
//! Basic usage pattern:
//!
//! 1. Create a `CallHarness`
//! 2. Add participants with `harness.participant()`
//! 3. Drive calls through each participant's `controller`
//! 4. Wait on each participant's event stream with `wait_for()`

#![allow(dead_code)]

use async_trait::async_trait;
use campuscare_webrtc::signaling::Mailbox;
use campuscare_webrtc::testing::SimulatedEngineFactory;
use campuscare_webrtc::{
    CallConfig, CallController, CallEvent, ConnectionState, MediaAcquisition, MemoryMailbox,
    ParticipantId, PollingChannel, Result, SignalingMessage,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Default time allowed for a call to reach a state
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

pub type HarnessResult<T> = std::result::Result<T, HarnessError>;

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Event stream closed while waiting for {0}")]
    Closed(String),

    #[error("Call error: {0}")]
    Call(#[from] campuscare_webrtc::Error),
}

/// Initialize tracing for tests (call once per test)
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,campuscare_webrtc=debug,webrtc=warn")
        .with_test_writer()
        .try_init();
}

/// Memory mailbox that remembers every message pushed through it
#[derive(Default)]
pub struct RecordingMailbox {
    inner: MemoryMailbox,
    pushed: Mutex<Vec<SignalingMessage>>,
}

impl RecordingMailbox {
    pub fn pushed(&self) -> Vec<SignalingMessage> {
        self.pushed.lock().clone()
    }

    /// Messages of `kind` ("offer", "answer", ...) pushed so far
    pub fn count(&self, kind: &str) -> usize {
        self.pushed.lock().iter().filter(|m| m.kind() == kind).count()
    }

    pub fn pending(&self, recipient: &str) -> usize {
        self.inner.pending(&ParticipantId::new(recipient))
    }
}

#[async_trait]
impl Mailbox for RecordingMailbox {
    async fn push(&self, message: SignalingMessage) -> Result<()> {
        self.inner.push(message.clone()).await?;
        self.pushed.lock().push(message);
        Ok(())
    }

    async fn drain(&self, recipient: &ParticipantId, limit: usize) -> Result<Vec<SignalingMessage>> {
        self.inner.drain(recipient, limit).await
    }
}

pub struct CallHarness {
    pub relay: Arc<RecordingMailbox>,
    poll_interval: Duration,
}

impl CallHarness {
    pub fn new() -> Self {
        init_test_tracing();
        Self {
            relay: Arc::new(RecordingMailbox::default()),
            poll_interval: Duration::from_millis(10),
        }
    }

    pub fn config(&self) -> CallConfig {
        CallConfig::local_loopback().with_poll_interval_ms(self.poll_interval.as_millis() as u64)
    }

    /// Participant with its own devices and simulated engines
    pub fn participant(&self, id: &str) -> TestParticipant {
        self.participant_with(
            id,
            MediaAcquisition::synthetic(),
            SimulatedEngineFactory::new(),
            self.relay.clone(),
        )
    }

    pub fn participant_with(
        &self,
        id: &str,
        media: MediaAcquisition,
        engines: SimulatedEngineFactory,
        mailbox: Arc<dyn Mailbox>,
    ) -> TestParticipant {
        let engines = Arc::new(engines);
        let signaling = Arc::new(PollingChannel::new(mailbox, self.poll_interval, 50));
        let (controller, events) = CallController::new(
            ParticipantId::new(id),
            self.config(),
            media.clone(),
            signaling,
            engines.clone(),
        )
        .expect("valid participant");
        TestParticipant {
            controller,
            engines,
            media,
            events,
            seen: Vec::new(),
        }
    }
}

pub struct TestParticipant {
    pub controller: CallController,
    pub engines: Arc<SimulatedEngineFactory>,
    pub media: MediaAcquisition,
    events: mpsc::UnboundedReceiver<CallEvent>,
    /// Every event received so far, in order
    pub seen: Vec<CallEvent>,
}

impl TestParticipant {
    /// Wait for the first new event matching `predicate`
    pub async fn wait_for<F>(&mut self, what: &str, timeout: Duration, predicate: F) -> HarnessResult<CallEvent>
    where
        F: Fn(&CallEvent) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let event = tokio::time::timeout_at(deadline, self.events.recv())
                .await
                .map_err(|_| HarnessError::Timeout(what.to_string()))?
                .ok_or_else(|| HarnessError::Closed(what.to_string()))?;
            self.seen.push(event.clone());
            if predicate(&event) {
                return Ok(event);
            }
        }
    }

    pub async fn wait_for_state(&mut self, state: ConnectionState) -> HarnessResult<()> {
        self.wait_for(&format!("state {}", state), STEP_TIMEOUT, |e| {
            matches!(e, CallEvent::ConnectionStateChanged(s) if *s == state)
        })
        .await
        .map(|_| ())
    }

    pub async fn wait_for_call_ended(&mut self) -> HarnessResult<Option<String>> {
        match self
            .wait_for("call ended", STEP_TIMEOUT, |e| matches!(e, CallEvent::CallEnded { .. }))
            .await?
        {
            CallEvent::CallEnded { reason, .. } => Ok(reason),
            _ => unreachable!(),
        }
    }

    /// Collect events that arrive within `window` without waiting for any
    pub async fn settle(&mut self, window: Duration) {
        tokio::time::sleep(window).await;
        while let Ok(event) = self.events.try_recv() {
            self.seen.push(event);
        }
    }

    pub fn count_seen<F>(&self, predicate: F) -> usize
    where
        F: Fn(&CallEvent) -> bool,
    {
        self.seen.iter().filter(|e| predicate(e)).count()
    }

    pub fn connection(&self) -> Option<ConnectionState> {
        self.controller.state().map(|info| info.connection)
    }
}
