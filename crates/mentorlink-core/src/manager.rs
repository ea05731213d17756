//! Connection lifecycle state machine.
//!
//! The [`ChatConnectionManager`] owns exactly one hub transport per
//! credential. It decides when to start and stop transports, when to retry,
//! when to give up, and which conversation is joined. It performs no I/O.
//!
//! # State Machine
//!
//! ```text
//!                  open                TransportOpened
//!   Disconnected ────────> Connecting ──────────────────> Connected
//!        ^                     │                            │
//!        │ close               │ transient failure          │ drop
//!        │                     v                            v
//!        └──────────────── Reconnecting{n} <────────────────┘
//!                              │    ^  timer fires, restart
//!                              │    └──────────────┘
//!                              │ backoff exhausted / fatal error
//!                              v
//!                           Failed ──open──> Connecting
//! ```
//!
//! Every transport and timer is tagged with a monotonically increasing id.
//! Events carrying an id that is no longer current are ignored, which is how
//! stale connects, late completions and fired-after-cancel timers are
//! discarded.

use crate::{
    ChatError, ConnectionId, ConnectionState, InvocationId, RoomId, TimerId,
    backoff::BackoffPolicy,
    event::{InboundMessage, ManagerAction, ManagerEvent},
    room::{DEFAULT_MAX_JOIN_ATTEMPTS, LeavePolicy, PendingInvocation, RoomCommand, RoomSession},
};

/// Manager configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Whether switching rooms issues an explicit leave.
    pub leave_policy: LeavePolicy,
    /// Join attempts per room selection before giving up on it.
    pub max_join_attempts: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self { leave_policy: LeavePolicy::default(), max_join_attempts: DEFAULT_MAX_JOIN_ATTEMPTS }
    }
}

/// Chat hub connection manager.
#[derive(Debug)]
pub struct ChatConnectionManager {
    backoff: Box<dyn BackoffPolicy>,
    state: ConnectionState,
    credential: Option<String>,
    connection: Option<ConnectionId>,
    next_connection: ConnectionId,
    timer: Option<TimerId>,
    next_timer: TimerId,
    attempt: u32,
    failure: Option<ChatError>,
    room: RoomSession,
}

impl ChatConnectionManager {
    /// Create a disconnected manager.
    pub fn new(config: ManagerConfig, backoff: Box<dyn BackoffPolicy>) -> Self {
        Self {
            backoff,
            state: ConnectionState::Disconnected,
            credential: None,
            connection: None,
            next_connection: 1,
            timer: None,
            next_timer: 1,
            attempt: 0,
            failure: None,
            room: RoomSession::new(config.leave_policy, config.max_join_attempts),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Error that put the manager into `Failed`, while it stays there.
    pub fn failure(&self) -> Option<&ChatError> {
        self.failure.as_ref()
    }

    /// Room the consumer selected.
    pub fn desired_room(&self) -> Option<RoomId> {
        self.room.desired()
    }

    /// Room the hub currently has us in.
    pub fn joined_room(&self) -> Option<RoomId> {
        self.room.joined()
    }

    /// Joined room that is also the desired one.
    pub fn active_room(&self) -> Option<RoomId> {
        self.room.active()
    }

    /// Join or leave awaiting completion.
    pub fn in_flight(&self) -> Option<PendingInvocation> {
        self.room.in_flight()
    }

    /// Transport being started or live.
    pub fn current_connection(&self) -> Option<ConnectionId> {
        self.connection
    }

    /// Reconnect timer waiting to fire.
    pub fn pending_timer(&self) -> Option<TimerId> {
        self.timer
    }

    /// Current reconnect attempt. Zero outside `Reconnecting`.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Room session configuration and state.
    pub fn room_session(&self) -> &RoomSession {
        &self.room
    }

    /// Process an event and return resulting actions.
    ///
    /// # Errors
    ///
    /// - `ChatError::MissingCredential` for `Open` with a blank credential.
    ///   State is left unchanged.
    pub fn handle(&mut self, event: ManagerEvent) -> Result<Vec<ManagerAction>, ChatError> {
        match event {
            ManagerEvent::Open { credential } => self.open(credential),
            ManagerEvent::Close => Ok(self.close()),
            ManagerEvent::SetActiveRoom { room_id } => Ok(self.set_active(room_id)),
            ManagerEvent::TransportOpened { connection_id } => {
                Ok(self.handle_transport_opened(connection_id))
            },
            ManagerEvent::TransportFailed { connection_id, error } => {
                Ok(self.handle_transport_lost(connection_id, error))
            },
            ManagerEvent::TransportClosed { connection_id, error } => {
                let error = error
                    .unwrap_or_else(|| ChatError::Closed("connection closed by hub".to_string()));
                Ok(self.handle_transport_lost(connection_id, error))
            },
            ManagerEvent::ReconnectDue { timer_id } => Ok(self.handle_reconnect_due(timer_id)),
            ManagerEvent::InvocationCompleted { invocation_id, result } => {
                Ok(self.handle_invocation_completed(invocation_id, result))
            },
            ManagerEvent::MessageReceived { connection_id, message } => {
                Ok(self.handle_message(connection_id, &message))
            },
        }
    }

    /// Start a connection authenticated with `credential`.
    ///
    /// Opening with the credential already in use while connecting or
    /// connected does nothing. A different credential replaces the current
    /// transport.
    ///
    /// # Errors
    ///
    /// - `ChatError::MissingCredential` if `credential` is blank
    pub fn open(&mut self, credential: impl Into<String>) -> Result<Vec<ManagerAction>, ChatError> {
        let credential = credential.into();
        if credential.trim().is_empty() {
            tracing::warn!("refusing to open without a credential");
            return Err(ChatError::MissingCredential);
        }

        if self.state.is_active() && self.credential.as_deref() == Some(credential.as_str()) {
            tracing::debug!(state = %self.state, "open with current credential, ignoring");
            return Ok(Vec::new());
        }

        let mut actions = self.release_transport();
        self.credential = Some(credential);
        self.attempt = 0;
        self.failure = None;

        actions.extend(self.start_transport());
        self.transition(ConnectionState::Connecting, &mut actions);

        Ok(actions)
    }

    /// Tear everything down and go to `Disconnected`.
    ///
    /// Safe from any state. The desired room is kept and joined again after
    /// the next successful `open`.
    pub fn close(&mut self) -> Vec<ManagerAction> {
        let mut actions = self.release_transport();
        self.credential = None;
        self.attempt = 0;
        self.failure = None;
        self.transition(ConnectionState::Disconnected, &mut actions);
        actions
    }

    /// Select the active room, or clear the selection with `None`.
    pub fn set_active(&mut self, room_id: Option<RoomId>) -> Vec<ManagerAction> {
        let commands = self.room.set_active(room_id, self.state.is_connected());
        self.room_actions(commands)
    }

    /// Select `room_id` as the active room.
    pub fn join_room(&mut self, room_id: RoomId) -> Vec<ManagerAction> {
        self.set_active(Some(room_id))
    }

    fn handle_transport_opened(&mut self, connection_id: ConnectionId) -> Vec<ManagerAction> {
        if !self.is_current(connection_id) || self.state.is_connected() {
            tracing::debug!(connection_id, "ignoring open from stale transport");
            return Vec::new();
        }

        if self.attempt > 0 {
            tracing::info!(connection_id, attempt = self.attempt, "reconnected");
        }

        let mut actions = Vec::new();
        self.attempt = 0;
        self.transition(ConnectionState::Connected, &mut actions);

        let commands = self.room.on_connected();
        actions.extend(self.room_actions(commands));
        actions
    }

    fn handle_transport_lost(
        &mut self,
        connection_id: ConnectionId,
        error: ChatError,
    ) -> Vec<ManagerAction> {
        if !self.is_current(connection_id) {
            tracing::debug!(connection_id, %error, "ignoring failure from stale transport");
            return Vec::new();
        }

        tracing::warn!(connection_id, %error, state = %self.state, "transport lost");

        self.connection = None;
        self.room.on_disconnected();

        if !error.is_transient() {
            return self.fail(error);
        }

        self.attempt += 1;
        let Some(delay) = self.backoff.delay(self.attempt) else {
            let attempts = self.attempt - 1;
            return self.fail(ChatError::RetriesExhausted { attempts, last_error: error.to_string() });
        };

        let timer_id = self.next_timer;
        self.next_timer += 1;
        self.timer = Some(timer_id);

        tracing::info!(attempt = self.attempt, ?delay, timer_id, "scheduling reconnect");

        let mut actions = Vec::new();
        let state =
            ConnectionState::Reconnecting { attempt: self.attempt, last_error: error.to_string() };
        self.transition(state, &mut actions);
        actions.push(ManagerAction::ScheduleReconnect { timer_id, delay });
        actions
    }

    fn handle_reconnect_due(&mut self, timer_id: TimerId) -> Vec<ManagerAction> {
        if self.timer != Some(timer_id) {
            tracing::debug!(timer_id, "ignoring cancelled reconnect timer");
            return Vec::new();
        }

        self.timer = None;
        tracing::debug!(timer_id, attempt = self.attempt, "reconnect timer fired");
        self.start_transport()
    }

    fn handle_invocation_completed(
        &mut self,
        invocation_id: InvocationId,
        result: Result<(), ChatError>,
    ) -> Vec<ManagerAction> {
        let commands = self.room.on_completed(invocation_id, result, self.state.is_connected());
        self.room_actions(commands)
    }

    fn handle_message(
        &mut self,
        connection_id: ConnectionId,
        message: &InboundMessage,
    ) -> Vec<ManagerAction> {
        if !self.is_current(connection_id) || !self.state.is_connected() {
            tracing::debug!(connection_id, sender = %message.sender_id, "message on stale transport");
            return Vec::new();
        }

        match self.room.active() {
            Some(room_id) => vec![ManagerAction::Invalidate { room_id }],
            None => {
                tracing::debug!(
                    sender = %message.sender_id,
                    desired = ?self.room.desired(),
                    "message with no settled room, dropping"
                );
                Vec::new()
            },
        }
    }

    fn is_current(&self, connection_id: ConnectionId) -> bool {
        self.connection == Some(connection_id)
    }

    fn start_transport(&mut self) -> Vec<ManagerAction> {
        let Some(credential) = self.credential.clone() else {
            tracing::warn!("no credential to start transport with");
            return Vec::new();
        };

        let connection_id = self.next_connection;
        self.next_connection += 1;
        self.connection = Some(connection_id);

        tracing::debug!(connection_id, "starting transport");
        vec![ManagerAction::StartTransport { connection_id, credential }]
    }

    /// Stop the transport and cancel the reconnect timer, whichever exist.
    fn release_transport(&mut self) -> Vec<ManagerAction> {
        let mut actions = Vec::new();

        if let Some(connection_id) = self.connection.take() {
            actions.push(ManagerAction::StopTransport { connection_id });
        }
        if let Some(timer_id) = self.timer.take() {
            actions.push(ManagerAction::CancelReconnect { timer_id });
        }

        self.room.on_disconnected();
        actions
    }

    fn fail(&mut self, error: ChatError) -> Vec<ManagerAction> {
        tracing::error!(%error, "connection failed");

        let mut actions = self.release_transport();
        self.credential = None;
        self.attempt = 0;

        let state = ConnectionState::Failed { error: error.to_string() };
        self.failure = Some(error);
        self.transition(state, &mut actions);
        actions
    }

    fn transition(&mut self, next: ConnectionState, actions: &mut Vec<ManagerAction>) {
        if self.state == next {
            return;
        }

        tracing::info!(from = %self.state, to = %next, "connection state changed");
        self.state = next.clone();
        actions.push(ManagerAction::StateChanged(next));
    }

    fn room_actions(&self, commands: Vec<RoomCommand>) -> Vec<ManagerAction> {
        let mut actions = Vec::with_capacity(commands.len());

        for command in commands {
            match command {
                RoomCommand::Join { invocation_id, room_id } => {
                    if let Some(connection_id) = self.connection {
                        actions.push(ManagerAction::InvokeJoin {
                            connection_id,
                            invocation_id,
                            room_id,
                        });
                    }
                },
                RoomCommand::Leave { invocation_id, room_id } => {
                    if let Some(connection_id) = self.connection {
                        actions.push(ManagerAction::InvokeLeave {
                            connection_id,
                            invocation_id,
                            room_id,
                        });
                    }
                },
                RoomCommand::Joined { room_id } => {
                    tracing::info!(room_id, "room joined");
                    actions.push(ManagerAction::RoomJoined { room_id });
                    actions.push(ManagerAction::Invalidate { room_id });
                },
                RoomCommand::Left { room_id } => {
                    actions.push(ManagerAction::RoomLeft { room_id });
                },
                RoomCommand::JoinFailed { room_id, error, will_retry } => {
                    actions.push(ManagerAction::JoinFailed { room_id, error, will_retry });
                },
            }
        }

        actions
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::TieredBackoff;

    fn manager() -> ChatConnectionManager {
        ChatConnectionManager::new(ManagerConfig::default(), Box::new(TieredBackoff::default()))
    }

    fn started(actions: &[ManagerAction]) -> ConnectionId {
        actions
            .iter()
            .find_map(|a| match a {
                ManagerAction::StartTransport { connection_id, .. } => Some(*connection_id),
                _ => None,
            })
            .unwrap()
    }

    fn scheduled(actions: &[ManagerAction]) -> (TimerId, Duration) {
        actions
            .iter()
            .find_map(|a| match a {
                ManagerAction::ScheduleReconnect { timer_id, delay } => Some((*timer_id, *delay)),
                _ => None,
            })
            .unwrap()
    }

    fn connected(m: &mut ChatConnectionManager) -> ConnectionId {
        let id = started(&m.open("tok1").unwrap());
        m.handle(ManagerEvent::TransportOpened { connection_id: id }).unwrap();
        id
    }

    fn message() -> InboundMessage {
        InboundMessage { sender_id: "mentor".into(), text: "hi".into(), sent_at: None }
    }

    #[test]
    fn open_rejects_blank_credential() {
        let mut m = manager();
        assert_eq!(m.open("   "), Err(ChatError::MissingCredential));
        assert_eq!(m.state(), &ConnectionState::Disconnected);
        assert_eq!(m.current_connection(), None);
    }

    #[test]
    fn open_then_connected() {
        let mut m = manager();
        let actions = m.open("tok1").unwrap();
        assert_eq!(actions[1], ManagerAction::StateChanged(ConnectionState::Connecting));

        let id = started(&actions);
        let actions = m.handle(ManagerEvent::TransportOpened { connection_id: id }).unwrap();
        assert_eq!(actions, vec![ManagerAction::StateChanged(ConnectionState::Connected)]);
    }

    #[test]
    fn open_twice_same_credential_is_noop() {
        let mut m = manager();
        connected(&mut m);
        assert!(m.open("tok1").unwrap().is_empty());
    }

    #[test]
    fn open_with_new_credential_restarts() {
        let mut m = manager();
        let old = connected(&mut m);

        let actions = m.open("tok2").unwrap();
        assert_eq!(actions[0], ManagerAction::StopTransport { connection_id: old });
        assert!(started(&actions) > old);
        assert_eq!(m.state(), &ConnectionState::Connecting);
    }

    #[test]
    fn close_is_idempotent() {
        let mut m = manager();
        let id = connected(&mut m);

        let actions = m.close();
        assert_eq!(actions, vec![
            ManagerAction::StopTransport { connection_id: id },
            ManagerAction::StateChanged(ConnectionState::Disconnected),
        ]);
        assert!(m.close().is_empty());
    }

    #[test]
    fn drop_schedules_reconnect_and_rejoins() {
        let mut m = manager();
        let id = connected(&mut m);
        let join = m.join_room(42);
        let ManagerAction::InvokeJoin { invocation_id, .. } = join[0] else {
            panic!("expected join, got {join:?}");
        };
        m.handle(ManagerEvent::InvocationCompleted { invocation_id, result: Ok(()) }).unwrap();
        assert_eq!(m.active_room(), Some(42));

        let error = Some(ChatError::Transport("reset".into()));
        let actions = m.handle(ManagerEvent::TransportClosed { connection_id: id, error }).unwrap();
        assert!(matches!(m.state(), ConnectionState::Reconnecting { attempt: 1, .. }));
        assert_eq!(m.joined_room(), None);

        let (timer_id, delay) = scheduled(&actions);
        assert_eq!(delay, Duration::ZERO);

        let id = started(&m.handle(ManagerEvent::ReconnectDue { timer_id }).unwrap());
        let actions = m.handle(ManagerEvent::TransportOpened { connection_id: id }).unwrap();
        assert!(actions.iter().any(|a| matches!(a, ManagerAction::InvokeJoin { room_id: 42, .. })));
        assert_eq!(m.attempt(), 0);
    }

    #[test]
    fn backoff_exhaustion_fails() {
        let mut m = manager();
        let mut id = connected(&mut m);
        let mut delays = Vec::new();

        for _ in 0..4 {
            let error = ChatError::Transport("down".into());
            let actions = m.handle(ManagerEvent::TransportFailed { connection_id: id, error });
            let (timer_id, delay) = scheduled(&actions.unwrap());
            delays.push(delay);
            id = started(&m.handle(ManagerEvent::ReconnectDue { timer_id }).unwrap());
        }

        let error = ChatError::Transport("down".into());
        m.handle(ManagerEvent::TransportFailed { connection_id: id, error }).unwrap();

        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(m.state().is_failed());
        assert!(matches!(m.failure(), Some(ChatError::RetriesExhausted { attempts: 4, .. })));
        assert_eq!(m.current_connection(), None);
        assert_eq!(m.pending_timer(), None);
    }

    #[test]
    fn unauthorized_fails_immediately() {
        let mut m = manager();
        let id = started(&m.open("expired").unwrap());
        let error = ChatError::Unauthorized("401".into());
        let actions = m.handle(ManagerEvent::TransportFailed { connection_id: id, error }).unwrap();

        assert!(m.state().is_failed());
        assert!(!actions.iter().any(|a| matches!(a, ManagerAction::ScheduleReconnect { .. })));
    }

    #[test]
    fn failed_can_be_reopened() {
        let mut m = manager();
        let id = started(&m.open("expired").unwrap());
        let error = ChatError::Unauthorized("401".into());
        m.handle(ManagerEvent::TransportFailed { connection_id: id, error }).unwrap();

        let actions = m.open("fresh").unwrap();
        started(&actions);
        assert_eq!(m.state(), &ConnectionState::Connecting);
        assert_eq!(m.failure(), None);
    }

    #[test]
    fn stale_timer_after_close_is_ignored() {
        let mut m = manager();
        let id = connected(&mut m);
        let error = ChatError::Timeout { elapsed: Duration::from_secs(30) };
        let actions = m.handle(ManagerEvent::TransportFailed { connection_id: id, error }).unwrap();
        let (timer_id, _) = scheduled(&actions);

        let actions = m.close();
        assert!(actions.contains(&ManagerAction::CancelReconnect { timer_id }));
        assert!(m.handle(ManagerEvent::ReconnectDue { timer_id }).unwrap().is_empty());
        assert_eq!(m.state(), &ConnectionState::Disconnected);
    }

    #[test]
    fn messages_invalidate_only_settled_room() {
        let mut m = manager();
        let id = connected(&mut m);

        let actions = m.join_room(7);
        let ManagerAction::InvokeJoin { invocation_id, .. } = actions[0] else {
            panic!("expected join");
        };

        let event = ManagerEvent::MessageReceived { connection_id: id, message: message() };
        assert!(m.handle(event).unwrap().is_empty());

        let actions =
            m.handle(ManagerEvent::InvocationCompleted { invocation_id, result: Ok(()) }).unwrap();
        assert_eq!(actions, vec![ManagerAction::RoomJoined { room_id: 7 }, ManagerAction::Invalidate {
            room_id: 7
        },]);

        let event = ManagerEvent::MessageReceived { connection_id: id, message: message() };
        assert_eq!(m.handle(event).unwrap(), vec![ManagerAction::Invalidate { room_id: 7 }]);

        let event = ManagerEvent::MessageReceived { connection_id: id + 1, message: message() };
        assert!(m.handle(event).unwrap().is_empty());
    }

    #[test]
    fn join_failure_keeps_connection() {
        let mut m = manager();
        connected(&mut m);
        let actions = m.join_room(3);
        let ManagerAction::InvokeJoin { invocation_id, .. } = actions[0] else {
            panic!("expected join");
        };

        let error = ChatError::Invocation { target: "JoinChat".into(), reason: "nope".into() };
        let actions =
            m.handle(ManagerEvent::InvocationCompleted { invocation_id, result: Err(error) });
        assert!(matches!(actions.unwrap().as_slice(), [ManagerAction::JoinFailed {
            room_id: 3,
            will_retry: true,
            ..
        }]));
        assert!(m.state().is_connected());
    }
}
