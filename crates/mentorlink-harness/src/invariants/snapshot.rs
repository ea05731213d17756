//! Observable state snapshots for invariant checking.
//!
//! Snapshots capture the manager's observable state at a point in time.
//! Invariants operate on snapshots rather than live state so every check sees
//! one consistent view.

use mentorlink_core::{
    ChatConnectionManager, ConnectionId, ConnectionState, PendingInvocation, RoomId, TimerId,
};

/// Snapshot of one connection manager.
#[derive(Debug, Clone, Default)]
pub struct ManagerSnapshot {
    /// Current connection state.
    pub state: ConnectionState,
    /// Transport being started or live.
    pub connection: Option<ConnectionId>,
    /// Reconnect timer waiting to fire.
    pub timer: Option<TimerId>,
    /// Reconnect attempt counter.
    pub attempt: u32,
    /// Room the consumer selected.
    pub desired_room: Option<RoomId>,
    /// Room the hub has us in.
    pub joined_room: Option<RoomId>,
    /// Settled active room.
    pub active_room: Option<RoomId>,
    /// Join or leave awaiting completion.
    pub in_flight: Option<PendingInvocation>,
    /// Every state published so far, oldest first, starting from the
    /// initial state.
    pub transitions: Vec<ConnectionState>,
}

impl ManagerSnapshot {
    /// Snapshot of a freshly created manager.
    pub fn empty() -> Self {
        Self { transitions: vec![ConnectionState::Disconnected], ..Self::default() }
    }

    /// Capture the manager's current state. `transitions` is left holding
    /// only the current state; use [`Self::with_transitions`] to supply the
    /// observed history.
    pub fn from_manager(manager: &ChatConnectionManager) -> Self {
        Self {
            state: manager.state().clone(),
            connection: manager.current_connection(),
            timer: manager.pending_timer(),
            attempt: manager.attempt(),
            desired_room: manager.desired_room(),
            joined_room: manager.joined_room(),
            active_room: manager.active_room(),
            in_flight: manager.in_flight(),
            transitions: vec![manager.state().clone()],
        }
    }

    /// Set the connection state.
    pub fn with_state(mut self, state: ConnectionState) -> Self {
        self.state = state;
        self
    }

    /// Set the live transport.
    pub fn with_connection(mut self, connection: Option<ConnectionId>) -> Self {
        self.connection = connection;
        self
    }

    /// Set the pending reconnect timer.
    pub fn with_timer(mut self, timer: Option<TimerId>) -> Self {
        self.timer = timer;
        self
    }

    /// Set the room fields.
    pub fn with_rooms(mut self, desired: Option<RoomId>, joined: Option<RoomId>) -> Self {
        self.desired_room = desired;
        self.joined_room = joined;
        self.active_room = joined.filter(|room| desired == Some(*room));
        self
    }

    /// Set the in-flight invocation.
    pub fn with_in_flight(mut self, in_flight: Option<PendingInvocation>) -> Self {
        self.in_flight = in_flight;
        self
    }

    /// Replace the observed state history.
    pub fn with_transitions(mut self, transitions: Vec<ConnectionState>) -> Self {
        self.transitions = transitions;
        self
    }
}
