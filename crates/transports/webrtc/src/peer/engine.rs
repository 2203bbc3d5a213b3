//! Negotiation engine seam
//!
//! A `PeerSession` drives exactly one engine. The engine owns the media
//! negotiation object (a webrtc-rs peer connection in production) and reports
//! what it discovers through `EngineEvent`s.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::media::{LocalTrack, RemoteTrack};
use crate::peer::ConnectionState;
use crate::signaling::{IceCandidate, SessionDescription};
use crate::Result;

/// Asynchronous notifications from an engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A local ICE candidate was gathered
    LocalCandidate(IceCandidate),

    /// ICE/DTLS state changed
    StateChanged(ConnectionState),

    /// The remote side started sending a track
    RemoteTrack(RemoteTrack),
}

/// One media negotiation object
#[async_trait]
pub trait NegotiationEngine: Send + Sync {
    /// Offer a local track to the remote side
    async fn add_local_track(&self, track: &LocalTrack) -> Result<()>;

    /// Create an offer and set it as the local description
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Create an answer to the applied remote offer and set it as the local
    /// description
    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Stop the engine; further calls may fail
    async fn close(&self) -> Result<()>;
}

/// Builds one engine per peer session
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<Arc<dyn NegotiationEngine>>;
}
