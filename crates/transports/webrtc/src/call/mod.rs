//! Call orchestration for the consultation page

pub mod controller;
pub mod events;

pub use controller::{CallController, CallInfo};
pub use events::{reason, CallEvent};
