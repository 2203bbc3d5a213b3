//! Events surfaced to the call page

use crate::error::ErrorKind;
use crate::media::{LocalStream, RemoteStream};
use crate::peer::ConnectionState;
use crate::session::ParticipantId;

/// Hangup reasons carried in `hangup` messages and `CallEnded` events
pub mod reason {
    /// The local participant ended the call
    pub const ENDED: &str = "ended";
    /// The callee already has an active call
    pub const BUSY: &str = "busy";
    /// Camera or microphone could not be acquired
    pub const DEVICE_UNAVAILABLE: &str = "device-unavailable";
    /// Offer/answer could not be completed
    pub const NEGOTIATION_FAILED: &str = "negotiation-failed";
    /// Too many consecutive signaling failures
    pub const SIGNALING_UNAVAILABLE: &str = "signaling-unavailable";
    /// A new incoming call replaced a finished attempt
    pub const SUPERSEDED: &str = "superseded";
}

#[derive(Debug, Clone)]
pub enum CallEvent {
    /// Local capture started; render the self view
    LocalStream(LocalStream),

    /// The remote stream gained a track
    RemoteStream(RemoteStream),

    ConnectionStateChanged(ConnectionState),

    Error { kind: ErrorKind, detail: String },

    /// An offer was accepted from `from`
    IncomingCall { from: ParticipantId, call_id: String },

    /// The call attempt `call_id` is over
    CallEnded {
        call_id: String,
        reason: Option<String>,
    },
}

impl CallEvent {
    pub(crate) fn error(err: &crate::Error) -> Self {
        CallEvent::Error {
            kind: err.kind(),
            detail: err.to_string(),
        }
    }
}
