//! Environment abstraction for deterministic testing.
//!
//! Decouples the connection runtime from wall-clock time. Production uses the
//! system clock and tokio timers; simulation uses tokio's paused virtual clock
//! so reconnect backoff schedules run instantly and reproducibly.

use std::time::Duration;

/// Abstract environment providing time and async sleeping.
///
/// # Safety
///
/// Implementations MUST guarantee:
///
/// - `now()` never goes backwards
/// - `sleep()` completes no earlier than `duration` after it was polled
///   (virtual time counts)
pub trait Environment: Clone + Send + Sync + 'static {
    /// The specific instant type used by this environment.
    ///
    /// Production environments use `std::time::Instant`, while simulation
    /// environments use virtual time (e.g., `tokio::time::Instant`).
    type Instant: Copy + Ord + Send + Sync + std::ops::Sub<Output = Duration>;

    /// Current time (monotonic).
    ///
    /// # Invariants
    ///
    /// - Subsequent calls must return times >= previous calls.
    fn now(&self) -> Self::Instant;

    /// Sleeps for the specified duration.
    ///
    /// This is the ONLY async method in the trait, and it should only be used
    /// by runtime code to arm reconnect timers (not by the state machines).
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;
}
