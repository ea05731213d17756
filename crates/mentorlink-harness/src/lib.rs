//! Deterministic simulation harness for mentorlink connection testing.
//!
//! Two levels of simulation:
//!
//! - [`ManagerHarness`] drives the sans-IO manager synchronously. Tests decide
//!   exactly when transports open, fail, and when timers and completions
//!   arrive.
//! - [`SimHub`], [`SimEnv`] and [`RecordingStore`] plug into the real
//!   [`mentorlink_client::ChatRuntime`] so end-to-end behavior can be checked
//!   on tokio's paused clock.
//!
//! # Invariant Testing
//!
//! The `invariants` module provides behavioral testing through invariant
//! checks. Invariants verify WHAT must be true across all execution paths, not
//! specific scenarios. Use [`InvariantRegistry::standard()`] for the full
//! manager invariant set.

#![forbid(unsafe_code)]

pub mod invariants;
pub mod manager_harness;
pub mod recording_store;
pub mod sim_env;
pub mod sim_hub;

pub use invariants::{
    ActiveRoomMatchesDesired, Invariant, InvariantKind, InvariantRegistry, InvariantResult,
    ManagerSnapshot, MembershipRequiresConnection, ReconnectAttemptConsistent, SingleMembership,
    TransportMatchesState, ValidTransitions, Violation,
};
pub use manager_harness::{ActionLog, ManagerHarness, Operation, WireInvocation};
pub use recording_store::RecordingStore;
pub use sim_env::SimEnv;
pub use sim_hub::{ConnectOutcome, HubCall, JoinMode, SimHub};
