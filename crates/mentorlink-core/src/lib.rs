//! Core
//!
//! Sans-IO connection manager for the mentorship chat hub. Owns the
//! connection lifecycle, reconnect backoff, and which conversation is joined
//! on the single shared hub connection.
//!
//! # Architecture
//!
//! [`ChatConnectionManager`] is a pure state machine. The caller feeds it
//! [`ManagerEvent`]s (consumer intents, transport outcomes, timer expiry,
//! invocation completions, inbound messages) and executes the returned
//! [`ManagerAction`]s. No I/O, no clocks, no tasks: the async runtime lives in
//! `mentorlink-client`, and the simulation harness drives the same code
//! synchronously.
//!
//! # Components
//!
//! - [`ChatConnectionManager`]: connection lifecycle and reconnect policy
//! - [`RoomSession`]: join/leave multiplexing for the active room
//! - [`ConnectionState`]: observable connection status
//! - [`BackoffPolicy`]: attempt number to reconnect delay
//! - [`Environment`]: time abstraction for runtimes

#![forbid(unsafe_code)]

mod backoff;
pub mod env;
mod error;
mod event;
mod manager;
mod room;
mod state;

pub use backoff::{
    BackoffError, BackoffPolicy, DEFAULT_RECONNECT_DELAYS, ExponentialBackoff, TieredBackoff,
};
pub use env::Environment;
pub use error::ChatError;
pub use event::{InboundMessage, ManagerAction, ManagerEvent};
pub use manager::{ChatConnectionManager, ManagerConfig};
pub use room::{
    DEFAULT_MAX_JOIN_ATTEMPTS, InvocationId, LeavePolicy, PendingInvocation, RoomCommand,
    RoomSession,
};
pub use state::ConnectionState;

/// Conversation ("assignment") identifier.
pub type RoomId = u64;

/// Identifier of one transport start. Events tagged with an older id are
/// stale and ignored.
pub type ConnectionId = u64;

/// Identifier of one scheduled reconnect timer.
pub type TimerId = u64;
