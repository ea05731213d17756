//! Error types for the chat connection core.
//!
//! One strongly-typed error covers the whole connection lifecycle: credential
//! problems, transport failures, hub rejections, invocation failures and
//! exhausted reconnection. The classification in [`ChatError::is_transient`]
//! is what the manager uses to decide between retrying and failing.

use std::time::Duration;

use thiserror::Error;

use crate::RoomId;

/// Errors that can occur while connecting to or talking with the chat hub.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    /// No usable bearer credential was supplied.
    #[error("missing credential: a non-empty bearer token is required")]
    MissingCredential,

    /// The hub refused the credential (expired or invalid token).
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Connecting or waiting on the hub took too long.
    #[error("timeout after {elapsed:?}")]
    Timeout {
        /// How long we waited
        elapsed: Duration,
    },

    /// Underlying network failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The hub closed the connection but allows the client to come back.
    #[error("connection closed: {0}")]
    Closed(String),

    /// The hub closed the connection and asked the client not to reconnect.
    #[error("rejected by hub: {0}")]
    Rejected(String),

    /// The hub sent something we could not understand.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A hub method invocation (join/leave) completed with an error.
    #[error("invocation {target} failed: {reason}")]
    Invocation {
        /// Hub method name
        target: String,
        /// Error reported by the hub
        reason: String,
    },

    /// Every reconnect attempt allowed by the backoff policy failed.
    #[error("reconnect attempts exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Number of reconnect attempts made
        attempts: u32,
        /// Error observed on the final attempt
        last_error: String,
    },

    /// The requested room stopped being the active room before it was joined.
    #[error("room {room_id} was superseded before the join completed")]
    Superseded {
        /// Room that is no longer wanted
        room_id: RoomId,
    },

    /// The connection runtime has shut down.
    #[error("connection runtime stopped")]
    Stopped,
}

impl ChatError {
    /// Returns true if this error may succeed on retry.
    ///
    /// Network drops, timeouts and reconnect-allowed closes are transient.
    /// Authentication failures, hub rejections and protocol violations are
    /// never transient: retrying with the same credential and peer cannot
    /// help.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Transport(_) | Self::Closed(_))
    }
}

/// Convert `io::Error` to `ChatError` (for transport errors)
impl From<std::io::Error> for ChatError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
