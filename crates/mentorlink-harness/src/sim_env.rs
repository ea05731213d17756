//! Simulated environment on tokio's virtual clock.
//!
//! Under `#[tokio::test(start_paused = true)]` the clock only moves when every
//! task is idle or a test calls `tokio::time::advance`, so reconnect backoff
//! schedules run instantly and in a reproducible order.

use std::time::Duration;

use mentorlink_core::Environment;

/// Environment backed by `tokio::time`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimEnv;

impl SimEnv {
    /// Create a simulated environment.
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SimEnv {
    type Instant = tokio::time::Instant;

    fn now(&self) -> Self::Instant {
        tokio::time::Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn virtual_sleep_advances_clock_exactly() {
        let env = SimEnv::new();
        let start = env.now();

        env.sleep(Duration::from_secs(30)).await;

        assert_eq!(env.now() - start, Duration::from_secs(30));
    }
}
