//! Peer-to-peer video consultations for CampusCare
//!
//! This crate carries the signaling and session layer behind the
//! student/counsellor call page: local media acquisition, offer/answer
//! negotiation over WebRTC, and relay of signaling messages through a
//! polled mailbox.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Call page (UI)                                          │
//! │  ↑ CallEvent stream                                      │
//! │  CallController                                          │
//! │  ├─ MediaAcquisition (camera/microphone, one lease)      │
//! │  ├─ PeerSession (negotiation, candidate buffering)       │
//! │  │   └─ NegotiationEngine (webrtc-rs RTCPeerConnection)  │
//! │  └─ SignalingTransport                                   │
//! │      └─ PollingChannel → Mailbox (memory/SQLite/HTTP)    │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use campuscare_webrtc::CallConfig;
//!
//! let config = CallConfig::audio_only("http://relay.campus.example:8080");
//! assert!(config.validate().is_ok());
//! assert!(!config.media.video);
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use campuscare_webrtc::{
//!     CallConfig, CallController, HttpMailbox, MediaAcquisition, PollingChannel,
//!     RtcEngineFactory,
//! };
//!
//! # async fn example() -> campuscare_webrtc::Result<()> {
//! let config = CallConfig::default();
//! let mailbox = Arc::new(HttpMailbox::new(&config.signaling.relay_url)?);
//! let signaling = Arc::new(PollingChannel::from_config(mailbox, &config.signaling));
//! let engines = Arc::new(RtcEngineFactory::new(&config)?);
//!
//! let (controller, mut events) = CallController::new(
//!     "student-42".into(),
//!     config,
//!     MediaAcquisition::synthetic(),
//!     signaling,
//!     engines,
//! )?;
//! controller.start_call("counsellor-7").await?;
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod call;
pub mod config;
pub mod error;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use call::{CallController, CallEvent, CallInfo};
pub use config::{CallConfig, MediaConstraints, SignalingConfig, TurnServerConfig};
pub use error::{DeviceFailure, Error, ErrorKind, Result};
pub use media::{LocalStream, MediaAcquisition, RemoteStream, SyntheticDevices, TrackKind};
pub use peer::{ConnectionState, PeerEvent, PeerSession, RtcEngineFactory};
pub use session::{CallRole, Participant, ParticipantId, SessionBootstrap};
pub use signaling::{
    HttpMailbox, Mailbox, MemoryMailbox, PollingChannel, SignalingMessage, SignalingPayload,
    SignalingTransport, SqliteMailbox,
};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
