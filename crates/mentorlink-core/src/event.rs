//! Manager events and actions.
//!
//! [`ManagerEvent`] is everything that can happen to the manager;
//! [`ManagerAction`] is everything the manager asks its driver to do.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::{ChatError, ConnectionId, ConnectionState, InvocationId, RoomId, TimerId};

/// A `ReceiveMessage` push from the hub.
///
/// The manager never stores messages; a delivery only tells the message
/// store that a conversation's history changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Sender's user id.
    pub sender_id: String,
    /// Message body.
    pub text: String,
    /// Server timestamp, if the hub supplied a parseable one.
    pub sent_at: Option<DateTime<Utc>>,
}

/// Events the driver feeds into the manager.
///
/// The driver is responsible for:
/// - Forwarding consumer intents (open, close, room selection)
/// - Reporting transport outcomes tagged with the connection they belong to
/// - Firing reconnect timers it was asked to schedule
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    /// Consumer wants a connection authenticated with `credential`.
    Open {
        /// Bearer token.
        credential: String,
    },

    /// Consumer wants the connection torn down.
    Close,

    /// Consumer selected a conversation, or cleared the selection.
    SetActiveRoom {
        /// Conversation to make active.
        room_id: Option<RoomId>,
    },

    /// Transport finished connecting and the hub accepted the session.
    TransportOpened {
        /// Transport that opened.
        connection_id: ConnectionId,
    },

    /// Transport could not be started.
    TransportFailed {
        /// Transport that failed.
        connection_id: ConnectionId,
        /// Why it failed.
        error: ChatError,
    },

    /// Live transport closed without being asked to.
    TransportClosed {
        /// Transport that closed.
        connection_id: ConnectionId,
        /// Close reason, if the transport reported one.
        error: Option<ChatError>,
    },

    /// A reconnect timer elapsed.
    ReconnectDue {
        /// Timer that fired.
        timer_id: TimerId,
    },

    /// A join or leave invocation completed.
    InvocationCompleted {
        /// Invocation that completed.
        invocation_id: InvocationId,
        /// Hub result.
        result: Result<(), ChatError>,
    },

    /// Hub pushed a chat message.
    MessageReceived {
        /// Transport the message arrived on.
        connection_id: ConnectionId,
        /// The message.
        message: InboundMessage,
    },
}

/// Actions the manager produces for the driver to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerAction {
    /// Start a transport authenticated with `credential`.
    ///
    /// The driver reports the outcome with `TransportOpened` or
    /// `TransportFailed` carrying the same `connection_id`.
    StartTransport {
        /// Tag for every event from this transport.
        connection_id: ConnectionId,
        /// Bearer token.
        credential: String,
    },

    /// Stop a transport and release its listeners. No further events from
    /// it are expected (any that arrive are ignored).
    StopTransport {
        /// Transport to stop.
        connection_id: ConnectionId,
    },

    /// Fire `ReconnectDue { timer_id }` after `delay`.
    ScheduleReconnect {
        /// Timer identifier.
        timer_id: TimerId,
        /// Delay before firing.
        delay: Duration,
    },

    /// Cancel a previously scheduled reconnect.
    CancelReconnect {
        /// Timer to cancel.
        timer_id: TimerId,
    },

    /// Invoke `JoinChat(room_id)` on the given transport.
    InvokeJoin {
        /// Transport to invoke on.
        connection_id: ConnectionId,
        /// Correlates the completion.
        invocation_id: InvocationId,
        /// Room to join.
        room_id: RoomId,
    },

    /// Invoke `LeaveChat(room_id)` on the given transport.
    InvokeLeave {
        /// Transport to invoke on.
        connection_id: ConnectionId,
        /// Correlates the completion.
        invocation_id: InvocationId,
        /// Room to leave.
        room_id: RoomId,
    },

    /// Tell the message store that `room_id`'s history changed.
    Invalidate {
        /// Room whose history changed.
        room_id: RoomId,
    },

    /// Connection state changed.
    StateChanged(ConnectionState),

    /// The desired room is joined and receiving messages.
    RoomJoined {
        /// Room joined.
        room_id: RoomId,
    },

    /// Interest in a room was dropped.
    RoomLeft {
        /// Room left.
        room_id: RoomId,
    },

    /// Joining a room failed. The connection stays up.
    JoinFailed {
        /// Room that could not be joined.
        room_id: RoomId,
        /// Failure reason.
        error: ChatError,
        /// Whether the join is retried on the next connect.
        will_retry: bool,
    },
}
