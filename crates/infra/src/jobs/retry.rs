//! Retry/backoff policy.
//!
//! Pure functions of `(attempt, base, ceiling)`; no clock, no randomness.
//! Jitter belongs to the worker's polling interval, not here.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Claims allowed before a failing job becomes terminal
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Backoff ceiling
    pub max_delay: Duration,
}

/// What to do with a job whose attempt just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to `pending`, due again after `delay`.
    Retry { delay: Duration },
    /// Out of attempts; mark `failed`.
    Exhausted,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// `min(max_delay, base_delay * 2^(attempt-1))` for a 1-indexed attempt.
    ///
    /// Attempt 0 is treated as attempt 1. Saturates instead of overflowing.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.max(1) - 1;
        let factor = 2u32.checked_pow(exp).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
            .min(self.max_delay)
    }

    /// Check if more retries are allowed.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Decide the transition for a job that has been claimed `attempts` times.
    pub fn decide(&self, attempts: u32) -> RetryDecision {
        if self.should_retry(attempts) {
            RetryDecision::Retry {
                delay: self.delay_for_attempt(attempts),
            }
        } else {
            RetryDecision::Exhausted
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_secs(30), Duration::from_secs(300))
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = policy();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(120));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(240));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(300));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(30));
    }

    #[test]
    fn huge_attempts_saturate_at_ceiling() {
        let policy = policy();
        assert_eq!(policy.delay_for_attempt(64), Duration::from_secs(300));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn decide_respects_max_attempts() {
        let policy = policy();
        assert_eq!(policy.decide(1), RetryDecision::Retry { delay: Duration::from_secs(30) });
        assert_eq!(policy.decide(2), RetryDecision::Retry { delay: Duration::from_secs(60) });
        assert_eq!(policy.decide(3), RetryDecision::Exhausted);
        assert_eq!(policy.decide(4), RetryDecision::Exhausted);
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, ..ProptestConfig::default() })]

        #[test]
        fn backoff_is_monotonic_and_bounded(
            base_ms in 1u64..60_000,
            ceiling_ms in 1u64..86_400_000,
            attempt in 0u32..200,
        ) {
            let policy = RetryPolicy::new(5, Duration::from_millis(base_ms), Duration::from_millis(ceiling_ms));
            let here = policy.delay_for_attempt(attempt);
            let next = policy.delay_for_attempt(attempt + 1);
            prop_assert!(here <= next);
            prop_assert!(next <= policy.max_delay);
        }
    }
}
