//! Reconnect backoff policies.
//!
//! A policy maps a 1-based reconnect attempt number to the delay before that
//! attempt, or `None` once attempts are exhausted. Delays returned for
//! consecutive attempts never decrease and every policy is bounded, so a
//! dropped connection always ends in either `Connected` or `Failed`.

use std::{fmt, time::Duration};

use thiserror::Error;

/// Delay before each reconnect attempt: immediate, then 2, 10 and 30 seconds.
pub const DEFAULT_RECONNECT_DELAYS: [Duration; 4] = [
    Duration::ZERO,
    Duration::from_secs(2),
    Duration::from_secs(10),
    Duration::from_secs(30),
];

/// Invalid backoff configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackoffError {
    /// Policy would never retry.
    #[error("backoff policy must allow at least one attempt")]
    NoAttempts,

    /// A later tier is shorter than an earlier one.
    #[error("backoff delays must be non-decreasing: tier {index} ({delay:?}) < {previous:?}")]
    Decreasing {
        /// Index of the offending tier
        index: usize,
        /// Offending delay
        delay: Duration,
        /// Delay of the preceding tier
        previous: Duration,
    },

    /// Exponential growth factor below one.
    #[error("backoff multiplier must be at least 1, got {0}")]
    Multiplier(u32),

    /// Exponential cap below the initial delay.
    #[error("maximum delay {max:?} is shorter than initial delay {initial:?}")]
    Cap {
        /// Initial delay
        initial: Duration,
        /// Configured cap
        max: Duration,
    },
}

/// Maps reconnect attempt numbers to delays.
///
/// # Invariants
///
/// - `delay(n)` is `None` for every `n` past the last allowed attempt
/// - `delay(n + 1) >= delay(n)` whenever both are `Some`
pub trait BackoffPolicy: fmt::Debug + Send + Sync {
    /// Delay before reconnect attempt `attempt` (1-based). `None` if exhausted.
    fn delay(&self, attempt: u32) -> Option<Duration>;

    /// Number of reconnect attempts the policy allows.
    fn max_attempts(&self) -> u32;
}

/// Fixed list of delays, one per attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TieredBackoff {
    tiers: Vec<Duration>,
}

impl TieredBackoff {
    /// Create a policy from explicit tiers.
    ///
    /// # Errors
    ///
    /// - `BackoffError::NoAttempts` if `tiers` is empty
    /// - `BackoffError::Decreasing` if a tier is shorter than its predecessor
    pub fn new(tiers: Vec<Duration>) -> Result<Self, BackoffError> {
        if tiers.is_empty() {
            return Err(BackoffError::NoAttempts);
        }

        for (index, pair) in tiers.windows(2).enumerate() {
            if pair[1] < pair[0] {
                return Err(BackoffError::Decreasing {
                    index: index + 1,
                    delay: pair[1],
                    previous: pair[0],
                });
            }
        }

        Ok(Self { tiers })
    }

    /// `attempts` retries with no delay between them. Intended for tests.
    pub fn immediate(attempts: u32) -> Self {
        Self { tiers: vec![Duration::ZERO; attempts.max(1) as usize] }
    }

    /// Configured delays.
    pub fn tiers(&self) -> &[Duration] {
        &self.tiers
    }
}

impl Default for TieredBackoff {
    fn default() -> Self {
        Self { tiers: DEFAULT_RECONNECT_DELAYS.to_vec() }
    }
}

impl BackoffPolicy for TieredBackoff {
    fn delay(&self, attempt: u32) -> Option<Duration> {
        let index = attempt.checked_sub(1)? as usize;
        self.tiers.get(index).copied()
    }

    fn max_attempts(&self) -> u32 {
        self.tiers.len() as u32
    }
}

/// Exponentially growing delay, capped, with a bounded number of attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExponentialBackoff {
    initial: Duration,
    multiplier: u32,
    max_delay: Duration,
    max_attempts: u32,
}

impl ExponentialBackoff {
    /// Create an exponential policy.
    ///
    /// # Errors
    ///
    /// - `BackoffError::NoAttempts` if `max_attempts` is zero
    /// - `BackoffError::Multiplier` if `multiplier` is zero
    /// - `BackoffError::Cap` if `max_delay < initial`
    pub fn new(
        initial: Duration,
        multiplier: u32,
        max_delay: Duration,
        max_attempts: u32,
    ) -> Result<Self, BackoffError> {
        if max_attempts == 0 {
            return Err(BackoffError::NoAttempts);
        }
        if multiplier == 0 {
            return Err(BackoffError::Multiplier(multiplier));
        }
        if max_delay < initial {
            return Err(BackoffError::Cap { initial, max: max_delay });
        }

        Ok(Self { initial, multiplier, max_delay, max_attempts })
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            multiplier: 2,
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }

        let factor = self.multiplier.saturating_pow(attempt - 1);
        Some(self.initial.saturating_mul(factor).min(self.max_delay))
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tiers_have_four_attempts() {
        let policy = TieredBackoff::default();
        assert_eq!(policy.max_attempts(), 4);
        assert_eq!(policy.delay(1), Some(Duration::ZERO));
        assert_eq!(policy.delay(4), Some(Duration::from_secs(30)));
        assert_eq!(policy.delay(5), None);
        assert_eq!(policy.delay(0), None);
    }

    #[test]
    fn decreasing_tiers_rejected() {
        let result = TieredBackoff::new(vec![Duration::from_secs(5), Duration::from_secs(1)]);
        assert!(matches!(result, Err(BackoffError::Decreasing { index: 1, .. })));
    }

    #[test]
    fn empty_tiers_rejected() {
        assert_eq!(TieredBackoff::new(vec![]), Err(BackoffError::NoAttempts));
    }

    #[test]
    fn exponential_caps_delay() {
        let policy =
            ExponentialBackoff::new(Duration::from_millis(500), 2, Duration::from_secs(3), 6)
                .unwrap();

        assert_eq!(policy.delay(1), Some(Duration::from_millis(500)));
        assert_eq!(policy.delay(2), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay(3), Some(Duration::from_secs(2)));
        assert_eq!(policy.delay(4), Some(Duration::from_secs(3)));
        assert_eq!(policy.delay(6), Some(Duration::from_secs(3)));
        assert_eq!(policy.delay(7), None);
    }

    #[test]
    fn exponential_rejects_unbounded_config() {
        assert_eq!(
            ExponentialBackoff::new(Duration::from_secs(1), 2, Duration::from_secs(10), 0),
            Err(BackoffError::NoAttempts)
        );
        assert_eq!(
            ExponentialBackoff::new(Duration::from_secs(1), 0, Duration::from_secs(10), 3),
            Err(BackoffError::Multiplier(0))
        );
        assert!(matches!(
            ExponentialBackoff::new(Duration::from_secs(10), 2, Duration::from_secs(1), 3),
            Err(BackoffError::Cap { .. })
        ));
    }

    #[test]
    fn immediate_policy_never_waits() {
        let policy = TieredBackoff::immediate(3);
        assert!((1..=3).all(|n| policy.delay(n) == Some(Duration::ZERO)));
        assert_eq!(policy.delay(4), None);
    }
}
