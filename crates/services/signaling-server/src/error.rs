//! Error types for the signaling relay

/// Result type alias using the relay Error
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Server failed to bind or stopped unexpectedly
    #[error("Server error: {0}")]
    ServerError(String),

    /// Mailbox store could not be opened
    #[error("Store error: {0}")]
    StoreError(#[from] campuscare_webrtc::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
