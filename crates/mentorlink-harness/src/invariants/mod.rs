//! Invariant checking for deterministic simulation testing.
//!
//! Invariants are properties that must always hold during system execution.
//! Unlike example-based tests that check specific scenarios, invariants
//! verify behavioral properties across all possible execution paths.
//!
//! # Architecture
//!
//! The invariant system extracts observable state from a
//! [`mentorlink_core::ChatConnectionManager`] into a [`ManagerSnapshot`], then
//! runs registered [`Invariant`] checks against it. Violations trigger panics
//! with detailed context for debugging.
//!
//! # Usage
//!
//! ```ignore
//! let registry = InvariantRegistry::standard();
//! let snapshot = ManagerSnapshot::from_manager(&manager);
//! registry.check_all(&snapshot)?;
//! ```

mod checks;
mod snapshot;

use std::fmt;

pub use checks::{
    ActiveRoomMatchesDesired, MembershipRequiresConnection, ReconnectAttemptConsistent,
    SingleMembership, TransportMatchesState, ValidTransitions,
};
pub use snapshot::ManagerSnapshot;

/// Invariant check result.
pub type InvariantResult = Result<(), Violation>;

/// Identifies an invariant in violation reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvariantKind {
    /// [`SingleMembership`]
    SingleMembership,
    /// [`MembershipRequiresConnection`]
    MembershipRequiresConnection,
    /// [`ActiveRoomMatchesDesired`]
    ActiveRoomMatchesDesired,
    /// [`TransportMatchesState`]
    TransportMatchesState,
    /// [`ReconnectAttemptConsistent`]
    ReconnectAttemptConsistent,
    /// [`ValidTransitions`]
    ValidTransitions,
}

impl fmt::Display for InvariantKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SingleMembership => "single_membership",
            Self::MembershipRequiresConnection => "membership_requires_connection",
            Self::ActiveRoomMatchesDesired => "active_room_matches_desired",
            Self::TransportMatchesState => "transport_matches_state",
            Self::ReconnectAttemptConsistent => "reconnect_attempt_consistent",
            Self::ValidTransitions => "valid_transitions",
        };
        f.write_str(name)
    }
}

/// Invariant violation with context.
#[derive(Debug, Clone)]
pub struct Violation {
    /// Violated invariant.
    pub invariant: InvariantKind,
    /// Description of what went wrong.
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.invariant, self.message)
    }
}

impl std::error::Error for Violation {}

/// An invariant that can be checked against manager state.
pub trait Invariant: Send + Sync {
    /// Invariant identity for error reporting.
    fn kind(&self) -> InvariantKind;

    /// Check the invariant against a snapshot.
    ///
    /// Returns `Ok(())` if the invariant holds, or a [`Violation`]
    /// describing what went wrong.
    fn check(&self, state: &ManagerSnapshot) -> InvariantResult;
}

/// Registry of invariants to check.
///
/// Use [`InvariantRegistry::standard()`] for the full manager invariant set.
pub struct InvariantRegistry {
    invariants: Vec<Box<dyn Invariant>>,
}

impl Default for InvariantRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InvariantRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self { invariants: Vec::new() }
    }

    /// Create a registry with every manager invariant.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.add(SingleMembership);
        registry.add(MembershipRequiresConnection);
        registry.add(ActiveRoomMatchesDesired);
        registry.add(TransportMatchesState);
        registry.add(ReconnectAttemptConsistent);
        registry.add(ValidTransitions);
        registry
    }

    /// Add an invariant to the registry.
    pub fn add<I: Invariant + 'static>(&mut self, invariant: I) {
        self.invariants.push(Box::new(invariant));
    }

    /// Check all invariants against the given state.
    ///
    /// Returns `Ok(())` if all invariants hold, or all violations found.
    pub fn check_all(&self, state: &ManagerSnapshot) -> Result<(), Vec<Violation>> {
        let violations: Vec<_> =
            self.invariants.iter().filter_map(|inv| inv.check(state).err()).collect();

        if violations.is_empty() { Ok(()) } else { Err(violations) }
    }

    /// Check all invariants, panicking with every violation found.
    pub fn assert_all(&self, state: &ManagerSnapshot, context: &str) {
        if let Err(violations) = self.check_all(state) {
            let messages: Vec<_> = violations.iter().map(ToString::to_string).collect();
            panic!("Invariant violation {context}:\n  {}", messages.join("\n  "));
        }
    }

    /// Number of registered invariants.
    pub fn len(&self) -> usize {
        self.invariants.len()
    }

    /// Check if registry is empty.
    pub fn is_empty(&self) -> bool {
        self.invariants.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use mentorlink_core::ConnectionState;

    use super::*;

    #[test]
    fn standard_registry_has_invariants() {
        let registry = InvariantRegistry::standard();
        assert_eq!(registry.len(), 6);
    }

    #[test]
    fn empty_snapshot_passes_invariants() {
        let registry = InvariantRegistry::standard();
        assert!(registry.check_all(&ManagerSnapshot::empty()).is_ok());
    }

    #[test]
    fn joined_room_while_disconnected_is_caught() {
        let snapshot = ManagerSnapshot::empty().with_rooms(Some(4), Some(4));
        let violations = InvariantRegistry::standard().check_all(&snapshot).unwrap_err();

        assert!(
            violations.iter().any(|v| v.invariant == InvariantKind::MembershipRequiresConnection)
        );
    }

    #[test]
    fn connected_without_transport_is_caught() {
        let snapshot = ManagerSnapshot::empty().with_state(ConnectionState::Connected);
        let violations = InvariantRegistry::standard().check_all(&snapshot).unwrap_err();

        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].invariant, InvariantKind::TransportMatchesState);
    }

    #[test]
    fn skipped_reconnect_attempt_is_caught() {
        let reconnecting = |attempt| ConnectionState::Reconnecting {
            attempt,
            last_error: "reset".to_string(),
        };
        let snapshot = ManagerSnapshot::empty().with_transitions(vec![
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            reconnecting(1),
            reconnecting(3),
        ]);

        let result = ValidTransitions.check(&snapshot);
        assert_eq!(result.unwrap_err().invariant, InvariantKind::ValidTransitions);
    }

    #[test]
    fn leaving_failed_only_through_open_or_close() {
        let failed = ConnectionState::Failed { error: "401".to_string() };
        let ok = ManagerSnapshot::empty().with_transitions(vec![
            ConnectionState::Connecting,
            failed.clone(),
            ConnectionState::Connecting,
        ]);
        assert!(ValidTransitions.check(&ok).is_ok());

        let bad = ManagerSnapshot::empty()
            .with_transitions(vec![ConnectionState::Connecting, failed, ConnectionState::Connected]);
        assert!(ValidTransitions.check(&bad).is_err());
    }
}
