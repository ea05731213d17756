//! Hub transport seam.
//!
//! A [`Connector`] turns a bearer credential into a [`HubConnection`]: a pair
//! of channels plus a stop handle. Protocol details (framing, handshake,
//! keepalive) stay inside the connector's own task; the runtime only sees
//! [`HubRequest`]s going out and [`HubEvent`]s coming back.

use std::future::Future;

use mentorlink_core::{ChatError, InboundMessage, InvocationId, RoomId};
use tokio::{sync::mpsc, task::AbortHandle};

/// Capacity of the hub-to-runtime event channel.
pub const HUB_EVENT_BUFFER: usize = 64;

/// Request sent to the hub over a live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubRequest {
    /// Invoke the hub's join method for `room_id`.
    Join {
        /// Correlates the completion.
        invocation_id: InvocationId,
        /// Room to join.
        room_id: RoomId,
    },
    /// Invoke the hub's leave method for `room_id`.
    Leave {
        /// Correlates the completion.
        invocation_id: InvocationId,
        /// Room to leave.
        room_id: RoomId,
    },
}

/// Event delivered by a live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubEvent {
    /// A join or leave invocation completed.
    Completion {
        /// Invocation that completed.
        invocation_id: InvocationId,
        /// Hub result.
        result: Result<(), ChatError>,
    },
    /// Hub pushed a chat message.
    Message(InboundMessage),
    /// Connection ended. Always the last event.
    Closed {
        /// Close reason. `None` for a clean close.
        error: Option<ChatError>,
    },
}

/// Handle to a live hub connection.
///
/// Requests are sent via `to_hub` and events received via `from_hub`; an
/// internal task owned by the connector does the actual I/O. Dropping
/// `to_hub` or calling [`HubConnection::stop`] ends that task.
#[derive(Debug)]
pub struct HubConnection {
    /// Send requests to the hub.
    pub to_hub: mpsc::UnboundedSender<HubRequest>,
    /// Receive events from the hub.
    pub from_hub: mpsc::Receiver<HubEvent>,
    abort_handle: Option<AbortHandle>,
}

impl HubConnection {
    /// Wrap channels and the I/O task driving them.
    pub fn new(
        to_hub: mpsc::UnboundedSender<HubRequest>,
        from_hub: mpsc::Receiver<HubEvent>,
        abort_handle: Option<AbortHandle>,
    ) -> Self {
        Self { to_hub, from_hub, abort_handle }
    }

    /// Stop the connection.
    pub fn stop(&self) {
        if let Some(handle) = &self.abort_handle {
            handle.abort();
        }
    }

    pub(crate) fn into_parts(
        self,
    ) -> (mpsc::UnboundedSender<HubRequest>, mpsc::Receiver<HubEvent>, Option<AbortHandle>) {
        (self.to_hub, self.from_hub, self.abort_handle)
    }
}

/// Opens authenticated hub connections.
pub trait Connector: Send + Sync + 'static {
    /// Connect and complete the hub handshake.
    ///
    /// Resolves once the hub accepted the session, so the caller can treat
    /// `Ok` as "connected".
    ///
    /// # Errors
    ///
    /// - `ChatError::Unauthorized` if the hub rejects the credential
    /// - `ChatError::Timeout` if the connect timeout elapses
    /// - `ChatError::Transport` on network failure
    /// - `ChatError::Rejected` / `ChatError::Protocol` on a failed handshake
    fn connect(
        &self,
        credential: String,
    ) -> impl Future<Output = Result<HubConnection, ChatError>> + Send;
}
