//! Connection state machine.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
    /// Sticky until the next connect.
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Events that move a connection between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The transport is established.
    Established,
    /// Connect, read, write or framing failed.
    Failed,
    /// Explicit teardown.
    Closed,
}

impl ConnectionState {
    /// State after `transition`.
    ///
    /// `Error` is only left through a new connection; teardown keeps it.
    pub fn apply(self, transition: Transition) -> ConnectionState {
        match (self, transition) {
            (_, Transition::Established) => ConnectionState::Connected,
            (_, Transition::Failed) => ConnectionState::Error,
            (ConnectionState::Error, Transition::Closed) => ConnectionState::Error,
            (_, Transition::Closed) => ConnectionState::Disconnected,
        }
    }

    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_connect_then_close() {
        let state = ConnectionState::default().apply(Transition::Established);
        assert!(state.is_connected());
        assert_eq!(state.apply(Transition::Closed), ConnectionState::Disconnected);
    }

    #[test]
    fn test_error_is_sticky_across_teardown() {
        let state = ConnectionState::Connected.apply(Transition::Failed);
        assert_eq!(state, ConnectionState::Error);
        assert_eq!(state.apply(Transition::Closed), ConnectionState::Error);
        assert_eq!(
            state.apply(Transition::Established),
            ConnectionState::Connected
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(ConnectionState::Error.to_string(), "error");
    }
}
