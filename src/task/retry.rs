//! Retry policy: eligibility and jittered exponential backoff.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, ExecutionError};

/// Retry configuration attached to a task definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    /// Scale each delay by a uniform factor in [0.5, 1.0].
    pub jitter: bool,
    /// Error kinds eligible for retry. Empty means every recoverable kind.
    pub retryable_kinds: Vec<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter: true,
            retryable_kinds: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_delays(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_retryable_kinds(mut self, kinds: Vec<ErrorKind>) -> Self {
        self.retryable_kinds = kinds;
        self
    }

    /// Backoff before retry number `attempt` (1-based).
    ///
    /// `min(base * exp^(attempt-1), max)`, optionally jittered.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let raw = self.base_delay.as_secs_f64() * self.exponential_base.powi(exponent);
        let mut secs = raw.min(self.max_delay.as_secs_f64()).max(0.0);

        if self.jitter {
            secs *= rand::thread_rng().gen_range(0.5..=1.0);
        }

        // Caps near Duration::MAX round past it as f64.
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether a failure on attempt number `attempt` should be retried.
    pub fn should_retry(&self, error: &ExecutionError, attempt: u32) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }

        if !error.is_recoverable() {
            return false;
        }

        self.retryable_kinds.is_empty() || self.retryable_kinds.contains(&error.kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed() -> RetryPolicy {
        RetryPolicy::default().with_jitter(false)
    }

    #[test]
    fn delay_without_jitter_is_exact() {
        let policy = fixed();
        assert_eq!(policy.calculate_delay(0), Duration::ZERO);
        assert_eq!(policy.calculate_delay(1), Duration::from_secs(1));
        assert_eq!(policy.calculate_delay(2), Duration::from_secs(2));
        assert_eq!(policy.calculate_delay(3), Duration::from_secs(4));
        assert_eq!(policy.calculate_delay(6), Duration::from_secs(32));
    }

    #[test]
    fn delay_is_capped_and_monotonic() {
        let policy = fixed();
        let mut previous = Duration::ZERO;
        for attempt in 1..=64 {
            let delay = policy.calculate_delay(attempt);
            assert!(delay >= previous, "attempt {attempt} went backwards");
            assert!(delay <= policy.max_delay);
            previous = delay;
        }
        assert_eq!(policy.calculate_delay(7), Duration::from_secs(60));
        assert_eq!(policy.calculate_delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn unbounded_cap_does_not_overflow() {
        let policy = fixed().with_delays(Duration::from_secs(1), Duration::MAX);
        assert_eq!(policy.calculate_delay(100), Duration::MAX);
        assert_eq!(policy.calculate_delay(u32::MAX), Duration::MAX);
        assert_eq!(policy.calculate_delay(3), Duration::from_secs(4));

        let jittered = policy.with_jitter(true);
        assert!(jittered.calculate_delay(2_000) >= Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_half_to_full() {
        let policy = RetryPolicy::default();
        for _ in 0..200 {
            let delay = policy.calculate_delay(3);
            assert!(delay >= Duration::from_secs(2));
            assert!(delay <= Duration::from_secs(4));
        }
    }

    #[test]
    fn should_retry_respects_budget() {
        let policy = fixed();
        let err = ExecutionError::runtime("flaky");
        assert!(policy.should_retry(&err, 1));
        assert!(policy.should_retry(&err, 2));
        assert!(!policy.should_retry(&err, 3));
        assert!(!policy.should_retry(&err, 4));
    }

    #[test]
    fn validation_errors_never_retry() {
        let policy = fixed().with_max_attempts(10);
        assert!(!policy.should_retry(&ExecutionError::validation("bad input"), 1));
    }

    #[test]
    fn allow_list_filters_kinds() {
        let policy = fixed().with_retryable_kinds(vec![ErrorKind::Io]);
        let io = ExecutionError::from(std::io::Error::other("disk"));
        assert!(policy.should_retry(&io, 1));
        assert!(!policy.should_retry(&ExecutionError::runtime("nope"), 1));
    }

    #[test]
    fn none_policy_never_retries() {
        assert!(!RetryPolicy::none().should_retry(&ExecutionError::runtime("x"), 1));
    }
}
