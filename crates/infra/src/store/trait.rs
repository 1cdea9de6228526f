use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use backlog_core::{Job, JobFilter, JobId, JobState, NewJob, WorkerId};

/// Row-level persistence of jobs, including the claim primitive.
///
/// ## Claim protocol
///
/// `lock_exclusively` is the only source of mutual exclusion between workers.
/// Implementations must make it a single conditional write: the row is
/// claimed iff it is not terminal AND (it is already held by the caller OR it
/// is unlocked OR its lock is older than `max_run_time`). Exactly one of any
/// set of concurrent callers may observe `true` for a given row state.
///
/// `find_available` is advisory. Candidates may be claimed by someone else
/// between selection and `lock_exclusively`; callers move on to the next one.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new unlocked row and return it with its assigned id.
    async fn insert(&self, job: NewJob) -> Result<Job, StoreError>;

    /// Up to `limit` claimable rows, highest priority first, then oldest `run_at`.
    async fn find_available(
        &self,
        limit: usize,
        max_run_time: Duration,
        worker: &WorkerId,
        filter: &JobFilter,
    ) -> Result<Vec<Job>, StoreError>;

    /// Atomically claim `job` for `worker`.
    ///
    /// On success the lock columns of `job` are updated to what was written.
    /// A lost race is `Ok(false)`, never an error.
    async fn lock_exclusively(
        &self,
        job: &mut Job,
        max_run_time: Duration,
        worker: &WorkerId,
    ) -> Result<bool, StoreError>;

    /// Persist every mutable column of `job` (attempts, schedule, lock, outcome).
    async fn save(&self, job: &Job) -> Result<(), StoreError>;

    /// Remove the row. Removing a row that is already gone is not an error.
    async fn delete(&self, id: JobId) -> Result<(), StoreError>;

    /// Release every lock held by `worker`; returns how many rows were released.
    async fn clear_locks(&self, worker: &WorkerId) -> Result<u64, StoreError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    async fn stats(&self) -> Result<JobStats, StoreError>;
}

#[async_trait]
impl<T: JobStore + ?Sized> JobStore for Arc<T> {
    async fn insert(&self, job: NewJob) -> Result<Job, StoreError> {
        (**self).insert(job).await
    }

    async fn find_available(
        &self,
        limit: usize,
        max_run_time: Duration,
        worker: &WorkerId,
        filter: &JobFilter,
    ) -> Result<Vec<Job>, StoreError> {
        (**self).find_available(limit, max_run_time, worker, filter).await
    }

    async fn lock_exclusively(
        &self,
        job: &mut Job,
        max_run_time: Duration,
        worker: &WorkerId,
    ) -> Result<bool, StoreError> {
        (**self).lock_exclusively(job, max_run_time, worker).await
    }

    async fn save(&self, job: &Job) -> Result<(), StoreError> {
        (**self).save(job).await
    }

    async fn delete(&self, id: JobId) -> Result<(), StoreError> {
        (**self).delete(id).await
    }

    async fn clear_locks(&self, worker: &WorkerId) -> Result<u64, StoreError> {
        (**self).clear_locks(worker).await
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        (**self).get(id).await
    }

    async fn stats(&self) -> Result<JobStats, StoreError> {
        (**self).stats().await
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// Connectivity or database failure. Fatal to the worker loop.
    #[error("storage error: {0}")]
    Storage(String),
}

/// Row counts per lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: u64,
    pub locked: u64,
    pub failed: u64,
    pub finished: u64,
    pub total: u64,
}

impl JobStats {
    /// Count `job` into its state bucket.
    pub fn record(&mut self, job: &Job) {
        match job.state() {
            JobState::Pending => self.pending += 1,
            JobState::Locked => self.locked += 1,
            JobState::PermanentlyFailed => self.failed += 1,
            JobState::Succeeded => self.finished += 1,
        }
        self.total += 1;
    }
}
