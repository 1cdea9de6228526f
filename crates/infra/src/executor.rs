//! Job lifecycle engine: claim, execute under a deadline, record the outcome.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use backlog_core::{
    Clock, ExecutionFault, Job, PayloadRegistry, QueueConfig, RetryPolicy, SystemClock, WorkerId,
    format_last_error,
};

use crate::store::{JobStore, StoreError};

/// Result of one [`JobExecutor::run_with_lock`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    Failure,
    /// Another worker holds the row; try the next candidate.
    NotClaimed,
}

/// What [`JobExecutor::reschedule`] did with a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Rescheduled { attempts: u32, run_at: DateTime<Utc> },
    PermanentlyFailed { attempts: u32 },
}

/// Runs claimed jobs and applies the retention and retry policy.
///
/// Execution faults (payload errors, panics, deadline breaches, undecodable
/// handlers) are always absorbed here. Only [`StoreError`] escapes.
pub struct JobExecutor<S> {
    store: S,
    registry: Arc<PayloadRegistry>,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
}

impl<S: JobStore> JobExecutor<S> {
    pub fn new(store: S, registry: Arc<PayloadRegistry>, config: QueueConfig) -> Self {
        Self {
            store,
            registry,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    /// Read "now" from `clock` instead of the wall clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn registry(&self) -> &PayloadRegistry {
        &self.registry
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Claim `job` for `worker` and, if that worked, execute it.
    pub async fn run_with_lock(
        &self,
        job: &mut Job,
        max_run_time: Duration,
        worker: &WorkerId,
    ) -> Result<RunOutcome, StoreError> {
        if !self.store.lock_exclusively(job, max_run_time, worker).await? {
            debug!(job.id = %job.id, worker = %worker, "job is locked by another worker");
            return Ok(RunOutcome::NotClaimed);
        }

        let name = job.name(&self.registry);
        info!(job.id = %job.id, job.name = %name, worker = %worker, "acquired lock");

        let started = Instant::now();
        match self.invoke_job(job, max_run_time).await {
            Ok(()) => {
                self.complete(job).await?;
                info!(
                    job.id = %job.id,
                    job.name = %name,
                    runtime_secs = started.elapsed().as_secs_f64(),
                    "{name} completed after {:.4}",
                    started.elapsed().as_secs_f64()
                );
                Ok(RunOutcome::Success)
            }
            Err(fault) => {
                self.reschedule(job, &fault.to_string(), &fault.trace(), None)
                    .await?;
                self.log_exception(job, &name, &fault);
                Ok(RunOutcome::Failure)
            }
        }
    }

    /// Record a failed execution.
    ///
    /// Increments `attempts`; below the job's attempt limit the row goes back
    /// to pending at `now + attempts^4 + 5s`, otherwise it is deleted or
    /// stamped `failed_at` per [`QueueConfig::destroy_failed_jobs`].
    pub async fn reschedule(
        &self,
        job: &mut Job,
        message: &str,
        trace: &[String],
        now: Option<DateTime<Utc>>,
    ) -> Result<FailureOutcome, StoreError> {
        let now = now.unwrap_or_else(|| self.clock.now());
        let policy = self.retry_policy_for(job);

        job.attempts = job.attempts.saturating_add(1);
        job.last_error = Some(format_last_error(message, trace));

        if policy.should_retry(job.attempts) {
            job.run_at = policy.next_run_at(now, job.attempts);
            job.unlock();
            self.store.save(job).await?;
            warn!(
                job.id = %job.id,
                attempts = job.attempts,
                run_at = %job.run_at,
                "job rescheduled"
            );
            return Ok(FailureOutcome::Rescheduled {
                attempts: job.attempts,
                run_at: job.run_at,
            });
        }

        let name = job.name(&self.registry);
        if self.config.destroy_failed_jobs {
            error!(
                job.id = %job.id,
                job.name = %name,
                attempts = job.attempts,
                "PERMANENTLY removing {name} because of {} consecutive failures",
                job.attempts
            );
            self.store.delete(job.id).await?;
        } else {
            error!(
                job.id = %job.id,
                job.name = %name,
                attempts = job.attempts,
                "{name} failed permanently after {} attempts",
                job.attempts
            );
            job.unlock();
            job.failed_at = Some(now);
            self.store.save(job).await?;
        }
        Ok(FailureOutcome::PermanentlyFailed {
            attempts: job.attempts,
        })
    }

    /// Decode and perform the payload under a hard deadline.
    ///
    /// The payload runs in its own task; on deadline the task is aborted at its
    /// next suspension point and a panic surfaces as [`ExecutionFault::Panicked`].
    pub async fn invoke_job(&self, job: &Job, max_run_time: Duration) -> Result<(), ExecutionFault> {
        let payload = job.payload_object(&self.registry)?;
        let mut task = tokio::spawn(async move { payload.perform().await });

        match tokio::time::timeout(max_run_time, &mut task).await {
            Ok(Ok(result)) => result.map_err(ExecutionFault::Failed),
            Ok(Err(join_err)) if join_err.is_panic() => {
                Err(ExecutionFault::Panicked(panic_message(join_err.into_panic())))
            }
            Ok(Err(join_err)) => Err(ExecutionFault::Failed(anyhow::Error::new(join_err))),
            Err(_) => {
                task.abort();
                Err(ExecutionFault::TimedOut(max_run_time))
            }
        }
    }

    fn log_exception(&self, job: &Job, name: &str, fault: &ExecutionFault) {
        error!(
            job.id = %job.id,
            job.name = %name,
            attempts = job.attempts,
            error.kind = fault.kind(),
            error.message = %fault,
            error.trace = ?fault.trace(),
            "{name} failed with {}: {fault} - {} failed attempts",
            fault.kind(),
            job.attempts
        );
    }

    async fn complete(&self, job: &mut Job) -> Result<(), StoreError> {
        if self.config.destroy_successful_jobs {
            return self.store.delete(job.id).await;
        }
        job.unlock();
        job.finished_at = Some(self.clock.now());
        self.store.save(job).await
    }

    fn retry_policy_for(&self, job: &Job) -> RetryPolicy {
        let limit = job
            .payload_object(&self.registry)
            .ok()
            .and_then(|payload| payload.max_attempts());
        self.config.retry.with_override(limit)
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
