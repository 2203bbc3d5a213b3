//! Signaling channel between two call participants
//!
//! Messages are queued per recipient in a [`Mailbox`] and delivered to the
//! subscriber in batches. Three mailboxes are provided:
//! - [`MemoryMailbox`] for participants in one process
//! - [`SqliteMailbox`], a durable queue backing the relay server
//! - [`HttpMailbox`], a client of the relay server
//!
//! [`PollingChannel`] turns any of them into a [`SignalingTransport`].

pub mod http;
pub mod mailbox;
pub mod polling;
pub mod protocol;
pub mod sqlite;

pub use http::HttpMailbox;
pub use mailbox::{Mailbox, MemoryMailbox};
pub use polling::PollingChannel;
pub use protocol::{
    IceCandidate, SdpType, SessionDescription, SignalingMessage, SignalingPayload,
};
pub use sqlite::SqliteMailbox;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::session::ParticipantId;
use crate::Result;

/// What a subscriber receives
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// Newly queued messages, oldest first
    Messages(Vec<SignalingMessage>),

    /// The transport failed to deliver; the subscription stays active
    Error { detail: String },
}

/// At-least-once message relay between identified participants
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Queue a message for its recipient
    async fn send(&self, message: SignalingMessage) -> Result<()>;

    /// Start delivering `participant`'s messages to `events`
    ///
    /// Subscribing again replaces the previous subscription.
    async fn subscribe(
        &self,
        participant: ParticipantId,
        events: mpsc::UnboundedSender<SignalingEvent>,
    ) -> Result<()>;

    /// Stop delivery; a no-op if `participant` is not subscribed
    async fn unsubscribe(&self, participant: &ParticipantId);
}
