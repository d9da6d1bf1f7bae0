//! Retry policy for transient failures.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential backoff with jitter, bounding the engine's local retries for
/// transient plugin and repository errors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub initial_interval_ms: u64,

    /// Cap on the delay between retries.
    pub max_interval_ms: u64,

    /// Backoff multiplier (2.0 = exponential doubling).
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0); 0.1 means ±10% randomness.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval_ms: 500,
            max_interval_ms: 10_000,
            backoff_coefficient: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval_ms: 0,
            max_interval_ms: 0,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }

    /// Delay before the given 1-based attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let retry_num = attempt - 1;
        let base = self.initial_interval_ms as f64
            * self.backoff_coefficient.powi(retry_num as i32 - 1);
        let capped = base.min(self.max_interval_ms as f64);

        let jittered = if self.jitter > 0.0 {
            let mut rng = rand::thread_rng();
            let range = capped * self.jitter;
            (capped + rng.gen_range(-range..=range)).max(0.0)
        } else {
            capped
        };

        Duration::from_millis(jittered as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_delay_before_first_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
    }

    #[test]
    fn backoff_doubles_without_jitter() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(2000));
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy {
            jitter: 0.0,
            max_interval_ms: 1500,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(1500));
    }

    #[test]
    fn attempts_budget() {
        let policy = RetryPolicy::default().with_max_attempts(2);
        assert!(policy.has_attempts_remaining(1));
        assert!(!policy.has_attempts_remaining(2));
        assert!(!RetryPolicy::no_retry().has_attempts_remaining(1));
    }
}
