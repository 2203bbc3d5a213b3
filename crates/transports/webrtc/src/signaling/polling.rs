//! Poll-based delivery over any mailbox

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::{Mailbox, SignalingEvent, SignalingMessage, SignalingTransport};
use crate::config::{SignalingConfig, MAX_POLL_INTERVAL_MS};
use crate::session::ParticipantId;
use crate::Result;

/// A running poll loop
///
/// Stopping is cooperative: a drain in progress completes and its batch is
/// still delivered before the loop exits.
struct Subscription {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Subscription {
    fn stop(self) -> JoinHandle<()> {
        self.stop.send_replace(true);
        self.task
    }
}

/// Signaling transport that drains a mailbox on a fixed interval
pub struct PollingChannel {
    mailbox: Arc<dyn Mailbox>,
    interval: Duration,
    batch_limit: usize,
    subscriptions: Mutex<HashMap<ParticipantId, Subscription>>,
}

impl PollingChannel {
    /// The interval is capped at one second
    pub fn new(mailbox: Arc<dyn Mailbox>, interval: Duration, batch_limit: usize) -> Self {
        Self {
            mailbox,
            interval: interval
                .min(Duration::from_millis(MAX_POLL_INTERVAL_MS))
                .max(Duration::from_millis(1)),
            batch_limit: batch_limit.max(1),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(mailbox: Arc<dyn Mailbox>, config: &SignalingConfig) -> Self {
        Self::new(mailbox, config.poll_interval(), config.batch_limit)
    }

    pub fn mailbox(&self) -> &Arc<dyn Mailbox> {
        &self.mailbox
    }

    pub fn is_subscribed(&self, participant: &ParticipantId) -> bool {
        self.subscriptions
            .lock()
            .get(participant)
            .is_some_and(|sub| !sub.task.is_finished())
    }
}

async fn poll_loop(
    mailbox: Arc<dyn Mailbox>,
    participant: ParticipantId,
    interval: Duration,
    batch_limit: usize,
    events: mpsc::UnboundedSender<SignalingEvent>,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => {}
        }
        // A dropped sender means the channel itself went away
        if *stop.borrow() || stop.has_changed().is_err() {
            debug!("Poll loop for {} stopped", participant);
            break;
        }
        if events.is_closed() {
            debug!("Subscriber for {} went away, stopping poll loop", participant);
            break;
        }

        let event = match mailbox.drain(&participant, batch_limit).await {
            Ok(batch) if batch.is_empty() => continue,
            Ok(batch) => {
                debug!("Delivering {} message(s) to {}", batch.len(), participant);
                SignalingEvent::Messages(batch)
            }
            Err(e) => {
                warn!("Polling mailbox for {} failed: {}", participant, e);
                SignalingEvent::Error {
                    detail: e.to_string(),
                }
            }
        };

        if events.send(event).is_err() {
            break;
        }
    }
}

#[async_trait]
impl SignalingTransport for PollingChannel {
    async fn send(&self, message: SignalingMessage) -> Result<()> {
        message.validate()?;
        self.mailbox.push(message).await
    }

    async fn subscribe(
        &self,
        participant: ParticipantId,
        events: mpsc::UnboundedSender<SignalingEvent>,
    ) -> Result<()> {
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(poll_loop(
            Arc::clone(&self.mailbox),
            participant.clone(),
            self.interval,
            self.batch_limit,
            events,
            stop_rx,
        ));

        let replaced = self
            .subscriptions
            .lock()
            .insert(participant.clone(), Subscription { stop, task });
        if let Some(previous) = replaced {
            previous.stop();
            debug!("Replaced existing subscription for {}", participant);
        }
        info!(
            "Subscribed {} (poll every {}ms)",
            participant,
            self.interval.as_millis()
        );
        Ok(())
    }

    async fn unsubscribe(&self, participant: &ParticipantId) {
        let removed = self.subscriptions.lock().remove(participant);
        if let Some(sub) = removed {
            sub.stop();
            info!("Unsubscribed {}", participant);
        }
    }
}

impl Drop for PollingChannel {
    fn drop(&mut self) {
        for (_, sub) in self.subscriptions.lock().drain() {
            sub.stop();
        }
    }
}
