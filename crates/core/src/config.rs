//! Queue-wide configuration handed to the executor at construction.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Hard deadline for one execution, and the age after which a lock is stale.
pub const DEFAULT_MAX_RUN_TIME: Duration = Duration::from_secs(4 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Delete rows on success instead of stamping `finished_at`.
    pub destroy_successful_jobs: bool,
    /// Delete rows after the last allowed failure instead of stamping `failed_at`.
    pub destroy_failed_jobs: bool,
    pub retry: RetryPolicy,
    pub max_run_time: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            destroy_successful_jobs: true,
            destroy_failed_jobs: true,
            retry: RetryPolicy::default(),
            max_run_time: DEFAULT_MAX_RUN_TIME,
        }
    }
}

impl QueueConfig {
    /// Keep terminal rows around for inspection.
    pub fn retain_all() -> Self {
        Self {
            destroy_successful_jobs: false,
            destroy_failed_jobs: false,
            ..Default::default()
        }
    }

    pub fn with_destroy_successful_jobs(mut self, destroy: bool) -> Self {
        self.destroy_successful_jobs = destroy;
        self
    }

    pub fn with_destroy_failed_jobs(mut self, destroy: bool) -> Self {
        self.destroy_failed_jobs = destroy;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.retry = RetryPolicy::new(max_attempts);
        self
    }

    pub fn with_max_run_time(mut self, max_run_time: Duration) -> Self {
        self.max_run_time = max_run_time;
        self
    }
}
