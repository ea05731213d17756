//! Standard invariant checks.
//!
//! These invariants capture behavioral properties that must always hold.
//! They verify WHAT must be true, not specific test scenarios.

use mentorlink_core::{ConnectionState, PendingInvocation};

use super::{Invariant, InvariantKind, InvariantResult, ManagerSnapshot, Violation};

/// At most one room is joined at a time.
///
/// While a join is in flight nothing else is joined, and a leave is only in
/// flight for the room currently joined.
pub struct SingleMembership;

impl Invariant for SingleMembership {
    fn kind(&self) -> InvariantKind {
        InvariantKind::SingleMembership
    }

    fn check(&self, state: &ManagerSnapshot) -> InvariantResult {
        match state.in_flight {
            Some(PendingInvocation::Join { room_id, .. }) if state.joined_room.is_some() => {
                Err(Violation {
                    invariant: self.kind(),
                    message: format!(
                        "join for {room_id} in flight while {:?} is joined",
                        state.joined_room
                    ),
                })
            },
            Some(PendingInvocation::Leave { room_id, .. })
                if state.joined_room != Some(room_id) =>
            {
                Err(Violation {
                    invariant: self.kind(),
                    message: format!(
                        "leave for {room_id} in flight while {:?} is joined",
                        state.joined_room
                    ),
                })
            },
            _ => Ok(()),
        }
    }
}

/// Memberships only exist on a live connection.
///
/// The hub forgets memberships when the transport goes away, so outside
/// `Connected` nothing is joined and nothing is in flight.
pub struct MembershipRequiresConnection;

impl Invariant for MembershipRequiresConnection {
    fn kind(&self) -> InvariantKind {
        InvariantKind::MembershipRequiresConnection
    }

    fn check(&self, state: &ManagerSnapshot) -> InvariantResult {
        if state.state.is_connected() {
            return Ok(());
        }

        if state.joined_room.is_some() || state.in_flight.is_some() {
            return Err(Violation {
                invariant: self.kind(),
                message: format!(
                    "state {} but joined {:?}, in flight {:?}",
                    state.state, state.joined_room, state.in_flight
                ),
            });
        }
        Ok(())
    }
}

/// The active room is joined and desired.
///
/// Messages are attributed to the active room only, so it must never point at
/// a room the consumer has moved away from.
pub struct ActiveRoomMatchesDesired;

impl Invariant for ActiveRoomMatchesDesired {
    fn kind(&self) -> InvariantKind {
        InvariantKind::ActiveRoomMatchesDesired
    }

    fn check(&self, state: &ManagerSnapshot) -> InvariantResult {
        let Some(active) = state.active_room else {
            return Ok(());
        };

        if state.desired_room != Some(active) || state.joined_room != Some(active) {
            return Err(Violation {
                invariant: self.kind(),
                message: format!(
                    "active {active} but desired {:?}, joined {:?}",
                    state.desired_room, state.joined_room
                ),
            });
        }
        Ok(())
    }
}

/// Transport and timer ownership agree with the connection state.
///
/// - `Disconnected`, `Failed`: neither a transport nor a timer
/// - `Connecting`, `Connected`: one transport, no timer
/// - `Reconnecting`: exactly one of transport or timer
pub struct TransportMatchesState;

impl Invariant for TransportMatchesState {
    fn kind(&self) -> InvariantKind {
        InvariantKind::TransportMatchesState
    }

    fn check(&self, state: &ManagerSnapshot) -> InvariantResult {
        let transport = state.connection.is_some();
        let timer = state.timer.is_some();

        let ok = match state.state {
            ConnectionState::Disconnected | ConnectionState::Failed { .. } => !transport && !timer,
            ConnectionState::Connecting | ConnectionState::Connected => transport && !timer,
            ConnectionState::Reconnecting { .. } => transport != timer,
        };

        if ok {
            Ok(())
        } else {
            Err(Violation {
                invariant: self.kind(),
                message: format!(
                    "state {} with transport {:?}, timer {:?}",
                    state.state, state.connection, state.timer
                ),
            })
        }
    }
}

/// The attempt counter matches the published state.
///
/// `Reconnecting{attempt}` reports the manager's counter, which is at least
/// one; every other state has a counter of zero.
pub struct ReconnectAttemptConsistent;

impl Invariant for ReconnectAttemptConsistent {
    fn kind(&self) -> InvariantKind {
        InvariantKind::ReconnectAttemptConsistent
    }

    fn check(&self, state: &ManagerSnapshot) -> InvariantResult {
        let expected = match state.state {
            ConnectionState::Reconnecting { attempt, .. } => attempt,
            _ => 0,
        };

        let valid = match state.state {
            ConnectionState::Reconnecting { attempt, .. } => attempt >= 1,
            _ => true,
        };

        if state.attempt != expected || !valid {
            return Err(Violation {
                invariant: self.kind(),
                message: format!("state {} with attempt counter {}", state.state, state.attempt),
            });
        }
        Ok(())
    }
}

/// Every observed state change is a legal edge of the state machine.
///
/// Reconnect attempts count up by one, starting at one. `Failed` is only left
/// through `open` (to `Connecting`) or `close`.
pub struct ValidTransitions;

impl Invariant for ValidTransitions {
    fn kind(&self) -> InvariantKind {
        InvariantKind::ValidTransitions
    }

    fn check(&self, state: &ManagerSnapshot) -> InvariantResult {
        use ConnectionState::{Connected, Connecting, Disconnected, Failed, Reconnecting};

        for pair in state.transitions.windows(2) {
            let (from, to) = (&pair[0], &pair[1]);

            let legal = match (from, to) {
                (a, b) if a == b => false,
                (_, Disconnected | Connecting) => true,
                (Connecting | Reconnecting { .. }, Connected) => true,
                (Connecting | Connected, Reconnecting { attempt, .. }) => *attempt == 1,
                (Reconnecting { attempt: prev, .. }, Reconnecting { attempt, .. }) => {
                    *attempt == prev + 1
                },
                (Connecting | Connected | Reconnecting { .. }, Failed { .. }) => true,
                _ => false,
            };

            if !legal {
                return Err(Violation {
                    invariant: self.kind(),
                    message: format!("illegal transition {from} -> {to}"),
                });
            }
        }
        Ok(())
    }
}
