//! Observable connection state.
//!
//! [`ConnectionState`] is the value the UI renders as a status banner. It is
//! only ever written by [`crate::ChatConnectionManager`]; everything else
//! reads snapshots of it.

use std::fmt;

/// Connection state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No transport and no intent to connect.
    #[default]
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// Transport open and usable.
    Connected,
    /// Transport dropped; waiting for or running a reconnect attempt.
    Reconnecting {
        /// 1-based reconnect attempt number.
        attempt: u32,
        /// Error that caused the most recent drop or failed attempt.
        last_error: String,
    },
    /// Terminal failure. Only a fresh `open` leaves this state.
    Failed {
        /// Human-readable failure reason.
        error: String,
    },
}

impl ConnectionState {
    /// Transport is open.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Connecting for the first time or reconnecting.
    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting { .. })
    }

    /// The manager holds (or is trying to obtain) a transport.
    pub fn is_active(&self) -> bool {
        self.is_connected() || self.is_connecting()
    }

    /// Terminal failure state.
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Error text to show in a banner. `None` for healthy states.
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Reconnecting { last_error, .. } => Some(last_error),
            Self::Failed { error } => Some(error),
            Self::Disconnected | Self::Connecting | Self::Connected => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting { attempt, last_error } => {
                write!(f, "reconnecting (attempt {attempt}): {last_error}")
            },
            Self::Failed { error } => write!(f, "failed: {error}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnecting_counts_as_connecting() {
        let state = ConnectionState::Reconnecting { attempt: 2, last_error: "reset".into() };
        assert!(state.is_connecting());
        assert!(state.is_active());
        assert!(!state.is_connected());
        assert_eq!(state.error(), Some("reset"));
    }

    #[test]
    fn failed_is_not_active() {
        let state = ConnectionState::Failed { error: "401".into() };
        assert!(!state.is_active());
        assert!(state.is_failed());
        assert_eq!(state.to_string(), "failed: 401");
    }

    #[test]
    fn default_is_disconnected() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
        assert_eq!(ConnectionState::default().error(), None);
    }
}
