//! Signaling relay for CampusCare calls
//!
//! A small HTTP service that queues signaling messages per recipient until
//! the recipient polls for them. Participants never talk to each other
//! directly before their peer connection is up; everything goes through
//! this mailbox.
//!
//! # Endpoints
//!
//! - **POST /v1/messages**: queue one message, `202` with its id
//! - **POST /v1/participants/:participant/poll?limit=N**: drain queued messages
//! - **GET /health**: liveness and version
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use campuscare_signaling_server::RelayServer;
//! use campuscare_webrtc::MemoryMailbox;
//!
//! # async fn example() -> campuscare_signaling_server::Result<()> {
//! let server = RelayServer::new("127.0.0.1:8080", Arc::new(MemoryMailbox::new()));
//! server.serve(async { let _ = tokio::signal::ctrl_c().await; }).await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod server;

pub use error::{Error, Result};
pub use server::{build_router, HealthResponse, RelayServer};
