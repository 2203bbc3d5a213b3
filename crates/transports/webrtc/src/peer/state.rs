//! Connection state machine

use serde::{Deserialize, Serialize};
use std::fmt;

/// Peer session connection state
///
/// ```text
/// new ──offer/answer──▶ connecting ──ICE──▶ connected
///                            │                  │
///                            └──▶ disconnected ◀┘──▶ failed
/// any ──close──▶ closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Session constructed, negotiation not started
    New,
    /// Offer or answer created, ICE in progress
    Connecting,
    /// Media path established
    Connected,
    /// Remote side went away
    Disconnected,
    /// ICE could not establish a path
    Failed,
    /// Session torn down; no further transitions
    Closed,
}

impl ConnectionState {
    /// Whether `next` is reachable from this state in one step
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (New, Connecting) | (New, Failed) => true,
            (Connecting, Connected) | (Connecting, Disconnected) | (Connecting, Failed) => true,
            (Connected, Disconnected) | (Connected, Failed) => true,
            (Disconnected, Failed) => true,
            _ => false,
        }
    }

    /// No transition is possible any more
    pub fn is_closed(self) -> bool {
        self == ConnectionState::Closed
    }

    /// The session can no longer carry media and should be discarded
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionState::*;
    use super::*;

    const ALL: [ConnectionState; 6] = [New, Connecting, Connected, Disconnected, Failed, Closed];

    #[test]
    fn test_closed_is_final() {
        for next in ALL {
            assert!(!Closed.can_transition_to(next));
        }
    }

    #[test]
    fn test_any_state_can_close() {
        for state in ALL.into_iter().filter(|s| *s != Closed) {
            assert!(state.can_transition_to(Closed), "{} -> closed", state);
        }
    }

    #[test]
    fn test_happy_path() {
        assert!(New.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Disconnected));
    }

    #[test]
    fn test_no_recovery_after_disconnect() {
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Disconnected.can_transition_to(Connecting));
        assert!(!Failed.can_transition_to(Connected));
        assert!(!New.can_transition_to(Connected));
    }

    #[test]
    fn test_terminal_states() {
        assert!(!Connecting.is_terminal());
        assert!(Disconnected.is_terminal());
        assert!(Failed.is_terminal());
        assert!(Closed.is_terminal() && Closed.is_closed());
    }
}
