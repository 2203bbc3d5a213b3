//! Per-recipient message queues

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tracing::{trace, warn};

use super::SignalingMessage;
use crate::session::ParticipantId;
use crate::{Error, Result};

/// Default number of undelivered messages kept per recipient
pub const DEFAULT_MAX_PER_RECIPIENT: usize = 500;

/// Storage for undelivered signaling messages
///
/// A message stays queued until drained, so a recipient that subscribes late
/// still receives everything sent to it.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Append to the recipient's queue
    ///
    /// Fails with `SignalingError` when the queue is full.
    async fn push(&self, message: SignalingMessage) -> Result<()>;

    /// Remove and return up to `limit` of the oldest queued messages
    async fn drain(&self, recipient: &ParticipantId, limit: usize) -> Result<Vec<SignalingMessage>>;
}

/// In-process mailbox
pub struct MemoryMailbox {
    queues: Mutex<HashMap<ParticipantId, VecDeque<SignalingMessage>>>,
    max_per_recipient: usize,
}

impl Default for MemoryMailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMailbox {
    pub fn new() -> Self {
        Self::with_max_per_recipient(DEFAULT_MAX_PER_RECIPIENT)
    }

    pub fn with_max_per_recipient(max_per_recipient: usize) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            max_per_recipient: max_per_recipient.max(1),
        }
    }

    /// Number of messages waiting for `recipient`
    pub fn pending(&self, recipient: &ParticipantId) -> usize {
        self.queues.lock().get(recipient).map_or(0, VecDeque::len)
    }
}

#[async_trait]
impl Mailbox for MemoryMailbox {
    async fn push(&self, message: SignalingMessage) -> Result<()> {
        let mut queues = self.queues.lock();
        let queue = queues.entry(message.recipient.clone()).or_default();
        if queue.len() >= self.max_per_recipient {
            warn!(
                "Mailbox for {} is full ({} messages), rejecting {}",
                message.recipient,
                queue.len(),
                message.id
            );
            return Err(Error::SignalingError(format!(
                "mailbox for {} is full",
                message.recipient
            )));
        }
        trace!("Queued {} {} for {}", message.kind(), message.id, message.recipient);
        queue.push_back(message);
        Ok(())
    }

    async fn drain(&self, recipient: &ParticipantId, limit: usize) -> Result<Vec<SignalingMessage>> {
        let mut queues = self.queues.lock();
        let Some(queue) = queues.get_mut(recipient) else {
            return Ok(Vec::new());
        };
        let take = limit.min(queue.len());
        let batch: Vec<_> = queue.drain(..take).collect();
        if queue.is_empty() {
            queues.remove(recipient);
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::SignalingPayload;
    use std::sync::Arc;

    fn hangup(call_id: &str, to: &str) -> SignalingMessage {
        SignalingMessage::new(
            call_id,
            "alice".into(),
            to.into(),
            SignalingPayload::Hangup { reason: None },
        )
    }

    #[tokio::test]
    async fn test_fifo_per_recipient() {
        let mailbox = MemoryMailbox::new();
        mailbox.push(hangup("1", "bob")).await.unwrap();
        mailbox.push(hangup("2", "carol")).await.unwrap();
        mailbox.push(hangup("3", "bob")).await.unwrap();

        let bob = ParticipantId::from("bob");
        let batch = mailbox.drain(&bob, 10).await.unwrap();
        let ids: Vec<_> = batch.iter().map(|m| m.call_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3"]);

        assert!(mailbox.drain(&bob, 10).await.unwrap().is_empty());
        assert_eq!(mailbox.pending(&"carol".into()), 1);
    }

    #[tokio::test]
    async fn test_drain_respects_limit() {
        let mailbox = MemoryMailbox::new();
        for i in 0..5 {
            mailbox.push(hangup(&i.to_string(), "bob")).await.unwrap();
        }
        let bob = ParticipantId::from("bob");
        assert_eq!(mailbox.drain(&bob, 2).await.unwrap().len(), 2);
        assert_eq!(mailbox.pending(&bob), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_senders_each_delivered_once_in_order() {
        let mailbox = Arc::new(MemoryMailbox::new());
        let senders = 8;
        let per_sender = 25;

        let mut tasks = tokio::task::JoinSet::new();
        for s in 0..senders {
            let mailbox = Arc::clone(&mailbox);
            tasks.spawn(async move {
                for n in 0..per_sender {
                    let message = SignalingMessage::new(
                        format!("{}-{}", s, n),
                        format!("sender-{}", s).into(),
                        "bob".into(),
                        SignalingPayload::Hangup { reason: None },
                    );
                    mailbox.push(message).await.unwrap();
                }
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }

        let bob = ParticipantId::from("bob");
        let drained = mailbox.drain(&bob, usize::MAX).await.unwrap();
        assert_eq!(drained.len(), senders * per_sender);
        assert_eq!(mailbox.pending(&bob), 0);

        for s in 0..senders {
            let sender = format!("sender-{}", s);
            let seqs: Vec<_> = drained
                .iter()
                .filter(|m| m.sender.as_str() == sender)
                .map(|m| m.call_id.clone())
                .collect();
            let expected: Vec<_> = (0..per_sender).map(|n| format!("{}-{}", s, n)).collect();
            assert_eq!(seqs, expected);
        }
    }

    #[tokio::test]
    async fn test_full_mailbox_rejects() {
        let mailbox = MemoryMailbox::with_max_per_recipient(2);
        mailbox.push(hangup("1", "bob")).await.unwrap();
        mailbox.push(hangup("2", "bob")).await.unwrap();

        let err = mailbox.push(hangup("3", "bob")).await.unwrap_err();
        assert!(matches!(err, Error::SignalingError(_)));

        // Other recipients are unaffected
        assert!(mailbox.push(hangup("4", "carol")).await.is_ok());
    }
}
