//! Join/leave multiplexing over the single hub connection.
//!
//! [`RoomSession`] translates "the UI wants conversation X active" into the
//! minimal sequence of `JoinChat`/`LeaveChat` invocations. It is a pure state
//! machine owned by [`crate::ChatConnectionManager`]: methods take the
//! connection status as input and return [`RoomCommand`]s.
//!
//! # State
//!
//! ```text
//!   desired ──reconcile──> in_flight (Join|Leave) ──settle──> joined
//! ```
//!
//! - `desired`: what the consumer asked for. Survives disconnects.
//! - `joined`: what the hub currently has us in. Cleared on disconnect since
//!   the hub forgets memberships across transport reconnects.
//! - `in_flight`: at most one invocation. A join for B never starts while a
//!   leave for A is pending.

use crate::{ChatError, RoomId};

/// Identifier of a single hub invocation.
pub type InvocationId = u64;

/// Default number of join attempts per room selection before giving up.
pub const DEFAULT_MAX_JOIN_ATTEMPTS: u32 = 2;

/// How switching rooms is expressed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LeavePolicy {
    /// Joining a new room supersedes the old one on the hub. No leave call.
    #[default]
    Implicit,
    /// The old room is left with an explicit invocation before joining.
    Explicit,
}

/// Kind of invocation currently awaiting completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingInvocation {
    /// `JoinChat(room_id)` in flight.
    Join {
        /// Invocation awaiting completion.
        invocation_id: InvocationId,
        /// Room being joined.
        room_id: RoomId,
    },
    /// `LeaveChat(room_id)` in flight.
    Leave {
        /// Invocation awaiting completion.
        invocation_id: InvocationId,
        /// Room being left.
        room_id: RoomId,
    },
}

impl PendingInvocation {
    /// Invocation identifier.
    pub fn invocation_id(&self) -> InvocationId {
        match self {
            Self::Join { invocation_id, .. } | Self::Leave { invocation_id, .. } => *invocation_id,
        }
    }
}

/// Commands produced by the room session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomCommand {
    /// Invoke `JoinChat(room_id)` on the hub.
    Join {
        /// Correlates the completion.
        invocation_id: InvocationId,
        /// Room to join.
        room_id: RoomId,
    },
    /// Invoke `LeaveChat(room_id)` on the hub.
    Leave {
        /// Correlates the completion.
        invocation_id: InvocationId,
        /// Room to leave.
        room_id: RoomId,
    },
    /// The desired room is now joined.
    Joined {
        /// Room joined.
        room_id: RoomId,
    },
    /// Interest in a room was dropped.
    Left {
        /// Room left.
        room_id: RoomId,
    },
    /// Joining the desired room failed. Non-fatal for the connection.
    JoinFailed {
        /// Room that could not be joined.
        room_id: RoomId,
        /// Failure reason.
        error: ChatError,
        /// Whether the join is retried on the next connect.
        will_retry: bool,
    },
}

/// Room membership state machine.
#[derive(Debug, Clone)]
pub struct RoomSession {
    policy: LeavePolicy,
    max_join_attempts: u32,
    desired: Option<RoomId>,
    joined: Option<RoomId>,
    in_flight: Option<PendingInvocation>,
    join_failures: u32,
    next_invocation: InvocationId,
}

impl RoomSession {
    /// Create a session with no room selected.
    pub fn new(policy: LeavePolicy, max_join_attempts: u32) -> Self {
        Self {
            policy,
            max_join_attempts: max_join_attempts.max(1),
            desired: None,
            joined: None,
            in_flight: None,
            join_failures: 0,
            next_invocation: 1,
        }
    }

    /// Room the consumer wants active.
    pub fn desired(&self) -> Option<RoomId> {
        self.desired
    }

    /// Room the hub currently has us in, if any.
    pub fn joined(&self) -> Option<RoomId> {
        self.joined
    }

    /// Joined room that is also the desired one. Inbound messages are
    /// attributed to this room only.
    pub fn active(&self) -> Option<RoomId> {
        self.joined.filter(|room| self.desired == Some(*room))
    }

    /// Invocation awaiting completion.
    pub fn in_flight(&self) -> Option<PendingInvocation> {
        self.in_flight
    }

    /// Leave policy in use.
    pub fn policy(&self) -> LeavePolicy {
        self.policy
    }

    /// Select the active room.
    ///
    /// Selecting the room that is already desired issues nothing, unless its
    /// join failed: re-selecting it resets the attempt count and retries.
    /// Otherwise the new selection replaces the old one and the session
    /// reconciles if the connection is up; if not, the room is joined on the
    /// next connect.
    pub fn set_active(&mut self, room: Option<RoomId>, connected: bool) -> Vec<RoomCommand> {
        if self.desired == room {
            if self.join_failures == 0 || self.in_flight.is_some() || self.joined == room {
                return Vec::new();
            }
            tracing::debug!(?room, failures = self.join_failures, "retrying failed room");
            self.join_failures = 0;
            return self.reconcile(connected, false);
        }

        tracing::debug!(from = ?self.desired, to = ?room, "active room changed");
        self.desired = room;
        self.join_failures = 0;
        self.reconcile(connected, false)
    }

    /// Transport became usable. Re-joins the desired room.
    pub fn on_connected(&mut self) -> Vec<RoomCommand> {
        self.reconcile(true, true)
    }

    /// Transport went away. The hub forgets memberships, so both the joined
    /// room and any in-flight invocation are discarded. Completions for the
    /// discarded invocation are ignored when they arrive.
    pub fn on_disconnected(&mut self) {
        if let Some(pending) = self.in_flight.take() {
            tracing::debug!(?pending, "discarding in-flight invocation");
        }
        self.joined = None;
    }

    /// Completion of a hub invocation.
    ///
    /// Completions that do not match the in-flight invocation are stale (the
    /// transport was replaced, or the session moved on) and change nothing.
    pub fn on_completed(
        &mut self,
        invocation_id: InvocationId,
        result: Result<(), ChatError>,
        connected: bool,
    ) -> Vec<RoomCommand> {
        let Some(pending) = self.in_flight else {
            tracing::debug!(invocation_id, "completion with nothing in flight, ignoring");
            return Vec::new();
        };

        if pending.invocation_id() != invocation_id {
            tracing::debug!(invocation_id, expected = pending.invocation_id(), "stale completion");
            return Vec::new();
        }

        self.in_flight = None;

        let mut commands = match pending {
            PendingInvocation::Join { room_id, .. } => self.settle_join(room_id, result),
            PendingInvocation::Leave { room_id, .. } => {
                if let Err(error) = result {
                    tracing::warn!(room_id, %error, "leave failed, dropping interest anyway");
                }
                self.joined = None;
                vec![RoomCommand::Left { room_id }]
            },
        };

        commands.extend(self.reconcile(connected, false));
        commands
    }

    fn settle_join(&mut self, room_id: RoomId, result: Result<(), ChatError>) -> Vec<RoomCommand> {
        let wanted = self.desired == Some(room_id);

        match result {
            Ok(()) if wanted => {
                self.joined = Some(room_id);
                self.join_failures = 0;
                vec![RoomCommand::Joined { room_id }]
            },
            Ok(()) => {
                // Hub membership is real even though nobody wants it any more;
                // reconcile will leave or supersede it.
                tracing::debug!(room_id, desired = ?self.desired, "late join for stale room");
                self.joined = Some(room_id);
                Vec::new()
            },
            Err(error) if wanted => {
                self.join_failures += 1;
                let will_retry = self.join_failures < self.max_join_attempts;
                tracing::warn!(room_id, %error, will_retry, "join failed");
                vec![RoomCommand::JoinFailed { room_id, error, will_retry }]
            },
            Err(error) => {
                tracing::debug!(room_id, %error, "join for stale room failed");
                Vec::new()
            },
        }
    }

    /// Issue whatever single step moves `joined` towards `desired`.
    ///
    /// A room whose join failed is only retried on reconnect.
    fn reconcile(&mut self, connected: bool, reconnected: bool) -> Vec<RoomCommand> {
        if !connected || self.in_flight.is_some() || self.joined == self.desired {
            return Vec::new();
        }

        let mut commands = Vec::new();

        if let Some(previous) = self.joined {
            match self.policy {
                LeavePolicy::Explicit => {
                    let invocation_id = self.allocate_invocation();
                    self.in_flight = Some(PendingInvocation::Leave { invocation_id, room_id: previous });
                    commands.push(RoomCommand::Leave { invocation_id, room_id: previous });
                    return commands;
                },
                LeavePolicy::Implicit => {
                    self.joined = None;
                    commands.push(RoomCommand::Left { room_id: previous });
                },
            }
        }

        if let Some(room_id) = self.desired {
            let limit = if reconnected { self.max_join_attempts } else { 1 };
            if self.join_failures >= limit {
                return commands;
            }
            let invocation_id = self.allocate_invocation();
            self.in_flight = Some(PendingInvocation::Join { invocation_id, room_id });
            commands.push(RoomCommand::Join { invocation_id, room_id });
        }

        commands
    }

    fn allocate_invocation(&mut self) -> InvocationId {
        let id = self.next_invocation;
        self.next_invocation += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join_id(commands: &[RoomCommand]) -> InvocationId {
        commands
            .iter()
            .find_map(|c| match c {
                RoomCommand::Join { invocation_id, .. } => Some(*invocation_id),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn selection_while_disconnected_is_deferred() {
        let mut session = RoomSession::new(LeavePolicy::Implicit, 2);
        assert!(session.set_active(Some(42), false).is_empty());
        assert_eq!(session.desired(), Some(42));

        let commands = session.on_connected();
        assert!(matches!(commands.as_slice(), [RoomCommand::Join { room_id: 42, .. }]));
    }

    #[test]
    fn same_room_is_noop() {
        let mut session = RoomSession::new(LeavePolicy::Implicit, 2);
        let commands = session.set_active(Some(7), true);
        assert_eq!(commands.len(), 1);
        assert!(session.set_active(Some(7), true).is_empty());
    }

    #[test]
    fn join_confirmation_marks_room_active() {
        let mut session = RoomSession::new(LeavePolicy::Implicit, 2);
        let id = join_id(&session.set_active(Some(7), true));

        let commands = session.on_completed(id, Ok(()), true);
        assert_eq!(commands, vec![RoomCommand::Joined { room_id: 7 }]);
        assert_eq!(session.active(), Some(7));
    }

    #[test]
    fn switch_with_explicit_leave_waits_for_leave() {
        let mut session = RoomSession::new(LeavePolicy::Explicit, 2);
        let id = join_id(&session.set_active(Some(1), true));
        session.on_completed(id, Ok(()), true);

        let commands = session.set_active(Some(2), true);
        let leave_id = match commands.as_slice() {
            [RoomCommand::Leave { invocation_id, room_id: 1 }] => *invocation_id,
            other => panic!("expected leave, got {other:?}"),
        };

        let commands = session.on_completed(leave_id, Ok(()), true);
        assert!(matches!(commands.as_slice(), [
            RoomCommand::Left { room_id: 1 },
            RoomCommand::Join { room_id: 2, .. }
        ]));
    }

    #[test]
    fn switch_with_implicit_leave_joins_directly() {
        let mut session = RoomSession::new(LeavePolicy::Implicit, 2);
        let id = join_id(&session.set_active(Some(1), true));
        session.on_completed(id, Ok(()), true);

        let commands = session.set_active(Some(2), true);
        assert!(matches!(commands.as_slice(), [
            RoomCommand::Left { room_id: 1 },
            RoomCommand::Join { room_id: 2, .. }
        ]));
    }

    #[test]
    fn late_confirmation_for_superseded_room_is_ignored() {
        let mut session = RoomSession::new(LeavePolicy::Implicit, 2);
        let first = join_id(&session.set_active(Some(1), true));

        // Switch before the first join settles: nothing new goes out yet.
        assert!(session.set_active(Some(2), true).is_empty());

        let commands = session.on_completed(first, Ok(()), true);
        assert!(!commands.iter().any(|c| matches!(c, RoomCommand::Joined { room_id: 1 })));
        assert!(commands.iter().any(|c| matches!(c, RoomCommand::Join { room_id: 2, .. })));
        assert_eq!(session.active(), None);
    }

    #[test]
    fn stale_completion_after_disconnect_is_ignored() {
        let mut session = RoomSession::new(LeavePolicy::Implicit, 2);
        let id = join_id(&session.set_active(Some(3), true));

        session.on_disconnected();
        assert!(session.on_completed(id, Ok(()), false).is_empty());
        assert_eq!(session.joined(), None);

        let commands = session.on_connected();
        assert!(matches!(commands.as_slice(), [RoomCommand::Join { room_id: 3, .. }]));
    }

    #[test]
    fn join_failure_retries_once_on_next_connect() {
        let mut session = RoomSession::new(LeavePolicy::Implicit, 2);
        let id = join_id(&session.set_active(Some(5), true));

        let error = ChatError::Invocation { target: "JoinChat".into(), reason: "busy".into() };
        let commands = session.on_completed(id, Err(error.clone()), true);
        assert!(matches!(commands.as_slice(), [RoomCommand::JoinFailed { will_retry: true, .. }]));

        session.on_disconnected();
        let id = join_id(&session.on_connected());
        let commands = session.on_completed(id, Err(error), true);
        assert!(matches!(commands.as_slice(), [RoomCommand::JoinFailed { will_retry: false, .. }]));

        session.on_disconnected();
        assert!(session.on_connected().is_empty());
    }

    #[test]
    fn reselecting_failed_room_retries_join() {
        let mut session = RoomSession::new(LeavePolicy::Implicit, 2);
        let id = join_id(&session.set_active(Some(9), true));

        let error = ChatError::Invocation { target: "JoinChat".into(), reason: "busy".into() };
        session.on_completed(id, Err(error), true);
        assert_eq!(session.in_flight(), None);

        let commands = session.set_active(Some(9), true);
        let retry = join_id(&commands);
        assert!(retry > id);

        // Still pending: a second re-selection adds nothing.
        assert!(session.set_active(Some(9), true).is_empty());

        let commands = session.on_completed(retry, Ok(()), true);
        assert_eq!(commands, vec![RoomCommand::Joined { room_id: 9 }]);
        assert!(session.set_active(Some(9), true).is_empty());
    }

    #[test]
    fn reselecting_failed_room_offline_waits_for_connect() {
        let mut session = RoomSession::new(LeavePolicy::Implicit, 1);
        let id = join_id(&session.set_active(Some(4), true));
        let error = ChatError::Invocation { target: "JoinChat".into(), reason: "busy".into() };
        session.on_completed(id, Err(error), true);

        session.on_disconnected();
        assert!(session.set_active(Some(4), false).is_empty());
        assert!(matches!(session.on_connected().as_slice(), [RoomCommand::Join { room_id: 4, .. }]));
    }

    #[test]
    fn clearing_selection_leaves_room() {
        let mut session = RoomSession::new(LeavePolicy::Explicit, 2);
        let id = join_id(&session.set_active(Some(9), true));
        session.on_completed(id, Ok(()), true);

        let commands = session.set_active(None, true);
        assert!(matches!(commands.as_slice(), [RoomCommand::Leave { room_id: 9, .. }]));
    }
}
