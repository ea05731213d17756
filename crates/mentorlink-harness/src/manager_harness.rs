//! Synchronous driver for the sans-IO manager.
//!
//! [`ManagerHarness`] plays the role of the runtime without any async: it
//! feeds [`ManagerEvent`]s to a [`ChatConnectionManager`], records every
//! [`ManagerAction`], and keeps just enough world state (started transports,
//! scheduled timers, invocations on the wire) for tests to decide what happens
//! next. Everything is deterministic, which makes it the substrate for the
//! property tests.

use std::{collections::VecDeque, time::Duration};

use mentorlink_core::{
    BackoffPolicy, ChatConnectionManager, ChatError, ConnectionId, ConnectionState,
    InboundMessage, InvocationId, ManagerAction, ManagerConfig, ManagerEvent, RoomId,
    TieredBackoff, TimerId,
};

use crate::invariants::ManagerSnapshot;

/// Invocation the manager sent that the hub has not answered yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireInvocation {
    /// Connection it was sent on.
    pub connection_id: ConnectionId,
    /// Invocation id.
    pub invocation_id: InvocationId,
    /// Room argument.
    pub room_id: RoomId,
    /// `true` for `JoinChat`, `false` for `LeaveChat`.
    pub join: bool,
}

/// Everything the manager asked for, in order.
#[derive(Debug, Clone, Default)]
pub struct ActionLog {
    actions: Vec<ManagerAction>,
}

impl ActionLog {
    /// All actions.
    pub fn actions(&self) -> &[ManagerAction] {
        &self.actions
    }

    /// Published states, oldest first.
    pub fn states(&self) -> Vec<ConnectionState> {
        self.actions
            .iter()
            .filter_map(|a| match a {
                ManagerAction::StateChanged(state) => Some(state.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of transports started.
    pub fn starts(&self) -> usize {
        self.actions.iter().filter(|a| matches!(a, ManagerAction::StartTransport { .. })).count()
    }

    /// Number of transports stopped.
    pub fn stops(&self) -> usize {
        self.actions.iter().filter(|a| matches!(a, ManagerAction::StopTransport { .. })).count()
    }

    /// Rooms joined on the wire, in order.
    pub fn joins(&self) -> Vec<RoomId> {
        self.rooms(|a| match a {
            ManagerAction::InvokeJoin { room_id, .. } => Some(*room_id),
            _ => None,
        })
    }

    /// Rooms left on the wire, in order.
    pub fn leaves(&self) -> Vec<RoomId> {
        self.rooms(|a| match a {
            ManagerAction::InvokeLeave { room_id, .. } => Some(*room_id),
            _ => None,
        })
    }

    /// Store invalidations, in order.
    pub fn invalidations(&self) -> Vec<RoomId> {
        self.rooms(|a| match a {
            ManagerAction::Invalidate { room_id } => Some(*room_id),
            _ => None,
        })
    }

    /// `RoomJoined` notices, in order.
    pub fn joined(&self) -> Vec<RoomId> {
        self.rooms(|a| match a {
            ManagerAction::RoomJoined { room_id } => Some(*room_id),
            _ => None,
        })
    }

    /// `RoomLeft` notices, in order.
    pub fn left(&self) -> Vec<RoomId> {
        self.rooms(|a| match a {
            ManagerAction::RoomLeft { room_id } => Some(*room_id),
            _ => None,
        })
    }

    /// `JoinFailed` notices as `(room, will_retry)`.
    pub fn join_failures(&self) -> Vec<(RoomId, bool)> {
        self.actions
            .iter()
            .filter_map(|a| match a {
                ManagerAction::JoinFailed { room_id, will_retry, .. } => {
                    Some((*room_id, *will_retry))
                },
                _ => None,
            })
            .collect()
    }

    /// Reconnect delays scheduled, in order.
    pub fn delays(&self) -> Vec<Duration> {
        self.actions
            .iter()
            .filter_map(|a| match a {
                ManagerAction::ScheduleReconnect { delay, .. } => Some(*delay),
                _ => None,
            })
            .collect()
    }

    fn rooms(&self, pick: impl Fn(&ManagerAction) -> Option<RoomId>) -> Vec<RoomId> {
        self.actions.iter().filter_map(pick).collect()
    }
}

/// Deterministic driver around one [`ChatConnectionManager`].
#[derive(Debug)]
pub struct ManagerHarness {
    manager: ChatConnectionManager,
    log: ActionLog,
    transitions: Vec<ConnectionState>,
    starting: Option<ConnectionId>,
    live: Option<ConnectionId>,
    timers: Vec<TimerId>,
    wire: VecDeque<WireInvocation>,
}

impl Default for ManagerHarness {
    fn default() -> Self {
        Self::new(ManagerConfig::default())
    }
}

impl ManagerHarness {
    /// Harness with the default backoff schedule.
    pub fn new(config: ManagerConfig) -> Self {
        Self::with_backoff(config, Box::new(TieredBackoff::default()))
    }

    /// Harness with a custom backoff policy.
    pub fn with_backoff(config: ManagerConfig, backoff: Box<dyn BackoffPolicy>) -> Self {
        let manager = ChatConnectionManager::new(config, backoff);
        Self {
            transitions: vec![manager.state().clone()],
            manager,
            log: ActionLog::default(),
            starting: None,
            live: None,
            timers: Vec::new(),
            wire: VecDeque::new(),
        }
    }

    /// The manager under test.
    pub fn manager(&self) -> &ChatConnectionManager {
        &self.manager
    }

    /// Actions recorded so far.
    pub fn log(&self) -> &ActionLog {
        &self.log
    }

    /// Current connection state.
    pub fn state(&self) -> &ConnectionState {
        self.manager.state()
    }

    /// Snapshot including every published state.
    pub fn snapshot(&self) -> ManagerSnapshot {
        ManagerSnapshot::from_manager(&self.manager).with_transitions(self.transitions.clone())
    }

    /// Transport started but not yet opened.
    pub fn starting(&self) -> Option<ConnectionId> {
        self.starting
    }

    /// Open transport.
    pub fn live(&self) -> Option<ConnectionId> {
        self.live
    }

    /// Scheduled timers, including cancelled ones that may still fire.
    pub fn timers(&self) -> &[TimerId] {
        &self.timers
    }

    /// Invocations awaiting completion, oldest first.
    pub fn wire(&self) -> &VecDeque<WireInvocation> {
        &self.wire
    }

    /// Consumer `open`.
    ///
    /// # Errors
    ///
    /// - whatever the manager returns
    pub fn open(&mut self, credential: &str) -> Result<(), ChatError> {
        let actions = self.manager.open(credential)?;
        self.apply(actions);
        Ok(())
    }

    /// Consumer `close`.
    pub fn close(&mut self) {
        let actions = self.manager.close();
        self.apply(actions);
    }

    /// Consumer `setActive`.
    pub fn set_active(&mut self, room_id: Option<RoomId>) {
        let actions = self.manager.set_active(room_id);
        self.apply(actions);
    }

    /// The started transport finishes its handshake. Returns `false` if
    /// nothing is starting.
    pub fn accept_transport(&mut self) -> bool {
        let Some(connection_id) = self.starting.take() else {
            return false;
        };
        self.live = Some(connection_id);
        self.send(ManagerEvent::TransportOpened { connection_id });
        true
    }

    /// The starting or live transport fails with `error`.
    pub fn fail_transport(&mut self, error: ChatError) -> bool {
        let Some(connection_id) = self.starting.take().or_else(|| self.live.take()) else {
            return false;
        };
        self.send(ManagerEvent::TransportFailed { connection_id, error });
        true
    }

    /// The live transport is closed by the hub.
    pub fn drop_transport(&mut self, error: Option<ChatError>) -> bool {
        let Some(connection_id) = self.live.take() else {
            return false;
        };
        self.send(ManagerEvent::TransportClosed { connection_id, error });
        true
    }

    /// Fire the oldest scheduled timer, cancelled or not.
    pub fn fire_timer(&mut self) -> bool {
        if self.timers.is_empty() {
            return false;
        }
        let timer_id = self.timers.remove(0);
        self.send(ManagerEvent::ReconnectDue { timer_id });
        true
    }

    /// Fire a specific timer id.
    pub fn fire_timer_id(&mut self, timer_id: TimerId) {
        self.timers.retain(|t| *t != timer_id);
        self.send(ManagerEvent::ReconnectDue { timer_id });
    }

    /// Complete the oldest invocation on the wire.
    pub fn complete_oldest(&mut self, result: Result<(), ChatError>) -> Option<WireInvocation> {
        let invocation = self.wire.pop_front()?;
        self.send(ManagerEvent::InvocationCompleted {
            invocation_id: invocation.invocation_id,
            result,
        });
        Some(invocation)
    }

    /// Complete a specific invocation.
    pub fn complete_invocation(
        &mut self,
        invocation_id: InvocationId,
        result: Result<(), ChatError>,
    ) {
        self.wire.retain(|w| w.invocation_id != invocation_id);
        self.send(ManagerEvent::InvocationCompleted { invocation_id, result });
    }

    /// Hub pushes a message on the live transport.
    pub fn deliver_message(&mut self) -> bool {
        let Some(connection_id) = self.live else {
            return false;
        };
        self.deliver_on(connection_id);
        true
    }

    /// Message arrives tagged with `connection_id`, live or not.
    pub fn deliver_on(&mut self, connection_id: ConnectionId) {
        let message = InboundMessage {
            sender_id: "mentor".to_string(),
            text: "ping".to_string(),
            sent_at: None,
        };
        self.send(ManagerEvent::MessageReceived { connection_id, message });
    }

    fn send(&mut self, event: ManagerEvent) {
        match self.manager.handle(event) {
            Ok(actions) => self.apply(actions),
            Err(error) => tracing::debug!(%error, "manager rejected event"),
        }
    }

    /// Execute actions against the simulated world.
    fn apply(&mut self, actions: Vec<ManagerAction>) {
        for action in &actions {
            match action {
                ManagerAction::StartTransport { connection_id, .. } => {
                    self.starting = Some(*connection_id);
                },
                ManagerAction::StopTransport { connection_id } => {
                    if self.starting == Some(*connection_id) {
                        self.starting = None;
                    }
                    if self.live == Some(*connection_id) {
                        self.live = None;
                    }
                },
                ManagerAction::ScheduleReconnect { timer_id, .. } => self.timers.push(*timer_id),
                ManagerAction::InvokeJoin { connection_id, invocation_id, room_id } => {
                    self.wire.push_back(WireInvocation {
                        connection_id: *connection_id,
                        invocation_id: *invocation_id,
                        room_id: *room_id,
                        join: true,
                    });
                },
                ManagerAction::InvokeLeave { connection_id, invocation_id, room_id } => {
                    self.wire.push_back(WireInvocation {
                        connection_id: *connection_id,
                        invocation_id: *invocation_id,
                        room_id: *room_id,
                        join: false,
                    });
                },
                ManagerAction::StateChanged(state) => self.transitions.push(state.clone()),
                ManagerAction::CancelReconnect { .. }
                | ManagerAction::Invalidate { .. }
                | ManagerAction::RoomJoined { .. }
                | ManagerAction::RoomLeft { .. }
                | ManagerAction::JoinFailed { .. } => {},
            }
        }
        self.log.actions.extend(actions);
    }
}

/// Step applied to a [`ManagerHarness`] in model-based tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// `open` with credential index (0 is blank).
    Open(u8),
    /// `close`.
    Close,
    /// `setActive` with a room id, or clear.
    SetActive(Option<RoomId>),
    /// Handshake completes.
    Accept,
    /// Transport fails with a transient error.
    FailTransient,
    /// Transport fails with `Unauthorized`.
    FailUnauthorized,
    /// Hub closes the live connection.
    Drop,
    /// Oldest timer fires.
    FireTimer,
    /// Oldest invocation succeeds.
    CompleteOk,
    /// Oldest invocation fails.
    CompleteErr,
    /// Message on the live transport.
    Message,
    /// Message tagged with an older transport.
    StaleMessage,
}

impl Operation {
    /// Apply this step.
    pub fn apply(&self, harness: &mut ManagerHarness) {
        match self {
            Self::Open(index) => {
                let credential = match index {
                    0 => String::new(),
                    n => format!("token-{n}"),
                };
                let _ = harness.open(&credential);
            },
            Self::Close => harness.close(),
            Self::SetActive(room_id) => harness.set_active(*room_id),
            Self::Accept => {
                harness.accept_transport();
            },
            Self::FailTransient => {
                harness.fail_transport(ChatError::Transport("connection reset".to_string()));
            },
            Self::FailUnauthorized => {
                harness.fail_transport(ChatError::Unauthorized("401".to_string()));
            },
            Self::Drop => {
                harness.drop_transport(None);
            },
            Self::FireTimer => {
                harness.fire_timer();
            },
            Self::CompleteOk => {
                harness.complete_oldest(Ok(()));
            },
            Self::CompleteErr => {
                harness.complete_oldest(Err(ChatError::Invocation {
                    target: "JoinChat".to_string(),
                    reason: "not a participant".to_string(),
                }));
            },
            Self::Message => {
                harness.deliver_message();
            },
            Self::StaleMessage => {
                if let Some(current) = harness.manager().current_connection() {
                    harness.deliver_on(current.saturating_sub(1));
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InvariantRegistry;

    #[test]
    fn accept_connects() {
        let mut h = ManagerHarness::default();
        h.open("tok").unwrap();
        assert!(h.accept_transport());

        assert_eq!(h.log().states(), vec![ConnectionState::Connecting, ConnectionState::Connected]);
        InvariantRegistry::standard().assert_all(&h.snapshot(), "after connect");
    }

    #[test]
    fn cancelled_timer_firing_starts_nothing() {
        let mut h = ManagerHarness::default();
        h.open("tok").unwrap();
        h.accept_transport();
        h.drop_transport(None);
        h.close();

        assert!(h.fire_timer());
        assert_eq!(h.log().starts(), 1);
        assert_eq!(h.state(), &ConnectionState::Disconnected);
    }
}
