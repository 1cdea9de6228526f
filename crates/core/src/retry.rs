//! Retry policy: how many failures a job may accumulate and how long each
//! failure pushes it back.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Failures tolerated before a job is given up on, unless its payload overrides it.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    /// Apply a payload-supplied `max_attempts`, if any.
    pub fn with_override(self, max_attempts: Option<u32>) -> Self {
        match max_attempts {
            Some(max_attempts) => Self { max_attempts },
            None => self,
        }
    }

    /// Delay after the `attempt`-th failure: `attempt^4 + 5` seconds.
    pub fn delay_for_attempt(&self, attempt: u32) -> TimeDelta {
        let secs = i64::from(attempt).saturating_pow(4).saturating_add(5);
        TimeDelta::try_seconds(secs).unwrap_or(TimeDelta::MAX)
    }

    /// When a job that has now failed `attempt` times becomes eligible again.
    pub fn next_run_at(&self, now: DateTime<Utc>, attempt: u32) -> DateTime<Utc> {
        now.checked_add_signed(self.delay_for_attempt(attempt))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Whether a job with `attempts` recorded failures may run again.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn backoff_follows_fourth_power() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_for_attempt(0), TimeDelta::seconds(5));
        assert_eq!(policy.delay_for_attempt(1), TimeDelta::seconds(6));
        assert_eq!(policy.delay_for_attempt(2), TimeDelta::seconds(21));
        assert_eq!(policy.delay_for_attempt(3), TimeDelta::seconds(86));
        assert_eq!(policy.delay_for_attempt(24), TimeDelta::seconds(331_781));
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = RetryPolicy::new(3);

        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    #[test]
    fn payload_override_replaces_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.with_override(Some(2)).max_attempts, 2);
        assert_eq!(policy.with_override(None).max_attempts, DEFAULT_MAX_ATTEMPTS);
    }

    #[test]
    fn huge_attempt_counts_saturate() {
        let policy = RetryPolicy::default();
        let at = policy.next_run_at(Utc::now(), u32::MAX);
        assert_eq!(at, DateTime::<Utc>::MAX_UTC);
    }

    proptest! {
        /// Property: each additional failure pushes the job strictly further out.
        #[test]
        fn run_at_strictly_increases(attempt in 0u32..1_000) {
            let policy = RetryPolicy::default();
            let now = Utc::now();
            prop_assert!(policy.next_run_at(now, attempt + 1) > policy.next_run_at(now, attempt));
        }
    }
}
