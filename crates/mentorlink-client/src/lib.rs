//! Client
//!
//! Async runtime around the sans-IO [`mentorlink_core::ChatConnectionManager`].
//! Executes manager actions with tokio, owns the hub transport and reconnect
//! timers, and publishes connection state to subscribers.
//!
//! # Architecture
//!
//! ```text
//!   ChatHandle ──commands──> ChatRuntime ──StartTransport──> Connector
//!        ^                       │  ^                            │
//!        │ watch / broadcast     │  └──── HubEvent pump <────────┘
//!        └───────────────────────┤
//!                                └──invalidate──> MessageStore
//! ```
//!
//! # Components
//!
//! - [`ChatRuntime`]: single-task event loop driving the manager
//! - [`ChatHandle`]: cloneable consumer handle (open, close, room selection)
//! - [`Connector`] / [`HubConnection`]: transport seam
//! - [`MessageStore`]: invalidation-only store collaborator
//! - [`HistoryCache`]: in-memory [`MessageStore`] with de-duplication
//! - [`CredentialSource`]: bearer token supplier
//!
//! # Transport (optional)
//!
//! With the `websocket` feature enabled, this crate also provides:
//! - [`websocket::WebSocketConnector`]: JSON hub protocol over WebSocket

#![forbid(unsafe_code)]

mod auth;
mod cache;
mod handle;
mod runtime;
mod store;
mod system_env;
mod transport;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use auth::{CredentialSource, StaticCredential};
pub use cache::{CachedMessage, HistoryCache};
pub use handle::{ChatHandle, RoomNotice};
pub use mentorlink_core::{
    BackoffError, BackoffPolicy, ChatError, ConnectionState, Environment, ExponentialBackoff,
    InboundMessage, LeavePolicy, ManagerConfig, RoomId, TieredBackoff,
};
pub use runtime::{ChatRuntime, DEFAULT_NOTICE_BUFFER, RuntimeConfig};
pub use store::{InvalidationChannel, MessageStore};
pub use system_env::SystemEnv;
pub use transport::{Connector, HUB_EVENT_BUFFER, HubConnection, HubEvent, HubRequest};
