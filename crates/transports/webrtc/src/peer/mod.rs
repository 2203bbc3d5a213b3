//! Peer sessions and the negotiation engines behind them
//!
//! A [`PeerSession`] is one call attempt. It serializes offer/answer/candidate
//! operations, buffers early remote candidates, merges remote tracks and
//! owns the local stream until it is closed.

pub mod candidates;
pub mod engine;
pub mod rtc;
pub mod session;
pub mod state;

pub use candidates::CandidateBuffer;
pub use engine::{EngineEvent, EngineFactory, NegotiationEngine};
pub use rtc::{RtcEngine, RtcEngineFactory};
pub use session::{PeerEvent, PeerSession};
pub use state::ConnectionState;
