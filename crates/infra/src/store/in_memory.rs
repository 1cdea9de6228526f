//! In-memory job store for tests and single-process use.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;

use backlog_core::{Clock, Job, JobFilter, JobId, NewJob, SystemClock, WorkerId};

use super::r#trait::{JobStats, JobStore, StoreError};

/// Jobs kept in a `BTreeMap` behind a single `RwLock`.
///
/// The claim runs entirely under the write lock, which makes it the atomic
/// conditional update the protocol requires for callers sharing this instance.
pub struct InMemoryJobStore {
    jobs: RwLock<BTreeMap<JobId, Job>>,
    next_id: AtomicI64,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for InMemoryJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryJobStore")
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            jobs: RwLock::new(BTreeMap::new()),
            next_id: AtomicI64::new(1),
            clock,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of rows, terminal ones included.
    pub fn len(&self) -> usize {
        self.read().map(|jobs| jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<JobId, Job>>, StoreError> {
        self.jobs
            .read()
            .map_err(|_| StoreError::Storage("job map lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<JobId, Job>>, StoreError> {
        self.jobs
            .write()
            .map_err(|_| StoreError::Storage("job map lock poisoned".to_string()))
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: NewJob) -> Result<Job, StoreError> {
        let id = JobId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        let job = Job::inserted(id, job, self.clock.now());
        self.write()?.insert(id, job.clone());
        Ok(job)
    }

    async fn find_available(
        &self,
        limit: usize,
        max_run_time: Duration,
        worker: &WorkerId,
        filter: &JobFilter,
    ) -> Result<Vec<Job>, StoreError> {
        let now = self.clock.now();
        let jobs = self.read()?;

        let mut candidates: Vec<Job> = jobs
            .values()
            .filter(|job| job.is_claimable(now, max_run_time, worker) && filter.matches(job))
            .cloned()
            .collect();

        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.run_at.cmp(&b.run_at))
                .then(a.id.cmp(&b.id))
        });
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn lock_exclusively(
        &self,
        job: &mut Job,
        max_run_time: Duration,
        worker: &WorkerId,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut jobs = self.write()?;

        let Some(row) = jobs.get_mut(&job.id) else {
            return Ok(false);
        };
        if !row.accepts_lock(now, max_run_time, worker) {
            return Ok(false);
        }

        row.locked_at = Some(now);
        row.locked_by = Some(worker.clone());
        row.updated_at = now;

        // The caller's copy may predate another worker's attempt.
        let decoded = std::mem::take(&mut job.decoded);
        *job = row.clone();
        job.decoded = decoded;
        Ok(true)
    }

    async fn save(&self, job: &Job) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut jobs = self.write()?;
        let row = jobs.get_mut(&job.id).ok_or(StoreError::NotFound(job.id))?;

        *row = Job {
            created_at: row.created_at,
            updated_at: now,
            ..job.clone()
        };
        Ok(())
    }

    async fn delete(&self, id: JobId) -> Result<(), StoreError> {
        self.write()?.remove(&id);
        Ok(())
    }

    async fn clear_locks(&self, worker: &WorkerId) -> Result<u64, StoreError> {
        let mut jobs = self.write()?;
        let mut released = 0;
        for job in jobs.values_mut() {
            if job.locked_by.as_ref() == Some(worker) {
                job.unlock();
                released += 1;
            }
        }
        Ok(released)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.read()?.get(&id).cloned())
    }

    async fn stats(&self) -> Result<JobStats, StoreError> {
        let jobs = self.read()?;
        let mut stats = JobStats::default();
        for job in jobs.values() {
            stats.record(job);
        }
        Ok(stats)
    }
}
