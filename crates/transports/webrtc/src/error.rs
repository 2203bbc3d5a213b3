//! Error types for the call signaling and session layer

use crate::media::TrackKind;
use serde::{Deserialize, Serialize};

/// Result type alias using the call layer Error
pub type Result<T> = std::result::Result<T, Error>;

/// Capture device failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceFailure {
    /// The user (or platform policy) refused access to the devices
    #[error("permission denied")]
    PermissionDenied,

    /// No capture device of the requested kind exists
    #[error("no {0} device available")]
    NotFound(TrackKind),

    /// Another call in this process still holds the capture devices
    #[error("capture devices are held by another call")]
    Busy,
}

/// Errors that can occur in call operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Camera or microphone unavailable
    #[error("Device error: {0}")]
    DeviceError(#[from] DeviceFailure),

    /// Malformed or out-of-order SDP operation
    #[error("Negotiation error: {0}")]
    NegotiationError(String),

    /// Unexpected or stale signaling message
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Signaling transport failure
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// Renegotiation and other operations this layer does not support
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// ICE candidate could not be parsed or applied
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// Operation not valid in the current controller state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Mailbox storage error
    #[error("Storage error: {0}")]
    StorageError(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Error categories surfaced to the UI layer through `CallEvent::Error`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Device,
    Negotiation,
    Protocol,
    Signaling,
    Unsupported,
    Config,
    Internal,
}

impl Error {
    /// UI-facing category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::DeviceError(_) => ErrorKind::Device,
            Error::NegotiationError(_) | Error::IceCandidateError(_) | Error::WebRtcError(_) => {
                ErrorKind::Negotiation
            }
            Error::ProtocolError(_) | Error::InvalidState(_) => ErrorKind::Protocol,
            Error::SignalingError(_) | Error::StorageError(_) => ErrorKind::Signaling,
            Error::UnsupportedOperation(_) => ErrorKind::Unsupported,
            Error::InvalidConfig(_) => ErrorKind::Config,
            Error::SerializationError(_) | Error::IoError(_) | Error::Other(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Check if retrying the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SignalingError(_)
                | Error::StorageError(_)
                | Error::IoError(_)
                | Error::DeviceError(DeviceFailure::Busy)
                | Error::DeviceError(DeviceFailure::PermissionDenied)
        )
    }

    /// Check if this error is a capture device error
    pub fn is_device_error(&self) -> bool {
        matches!(self, Error::DeviceError(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::StorageError(err.to_string())
    }
}

impl From<webrtc::Error> for Error {
    fn from(err: webrtc::Error) -> Self {
        Error::WebRtcError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::NegotiationError("no offer pending".to_string());
        assert_eq!(err.to_string(), "Negotiation error: no offer pending");

        let err = Error::from(DeviceFailure::NotFound(TrackKind::Video));
        assert_eq!(err.to_string(), "Device error: no video device available");
    }

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(
            Error::from(DeviceFailure::PermissionDenied).kind(),
            ErrorKind::Device
        );
        assert_eq!(
            Error::IceCandidateError("bad".into()).kind(),
            ErrorKind::Negotiation
        );
        assert_eq!(Error::StorageError("down".into()).kind(), ErrorKind::Signaling);
        assert_eq!(
            Error::UnsupportedOperation("renegotiation".into()).kind(),
            ErrorKind::Unsupported
        );
    }

    #[test]
    fn test_error_is_retryable() {
        assert!(Error::SignalingError("test".to_string()).is_retryable());
        assert!(Error::from(DeviceFailure::Busy).is_retryable());
        assert!(!Error::NegotiationError("test".to_string()).is_retryable());
        assert!(!Error::InvalidConfig("test".to_string()).is_retryable());
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = Error::from(json_err);
        assert!(matches!(err, Error::SerializationError(_)));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::from(io_err);
        assert!(matches!(err, Error::IoError(_)));
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
