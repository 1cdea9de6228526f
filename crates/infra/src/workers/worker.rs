//! Worker loop: repeated claim/execute batches with idle pacing and
//! graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info};

use backlog_core::{JobFilter, WorkerId};

use crate::executor::{JobExecutor, RunOutcome};
use crate::store::{JobStore, StoreError};

/// Callback invoked when a worker has found nothing to do for `idle_after`.
pub type IdleHook = Box<dyn Fn(&WorkerId) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Identity written into `locked_by`.
    pub name: WorkerId,
    pub filter: JobFilter,
    /// Suppress the console echo of [`Worker::say`] lines.
    pub quiet: bool,
    /// Work items per outer iteration.
    pub batch_size: usize,
    /// Candidates fetched per claim attempt.
    pub read_ahead: usize,
    pub sleep_delay: Duration,
    pub idle_after: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: WorkerId::for_current_process(),
            filter: JobFilter::default(),
            quiet: false,
            batch_size: 100,
            read_ahead: 5,
            sleep_delay: Duration::from_secs(5),
            idle_after: Duration::from_secs(60),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<WorkerId>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_filter(mut self, filter: JobFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_sleep_delay(mut self, delay: Duration) -> Self {
        self.sleep_delay = delay;
        self
    }

    pub fn with_idle_after(mut self, idle_after: Duration) -> Self {
        self.idle_after = idle_after;
        self
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("worker task failed: {0}")]
    Join(String),
}

/// Cloneable stop flag shared between a worker and whoever may stop it.
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`StopSignal::stop`] has been called.
    pub async fn stopped(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so `wait_for` cannot fail with a closed channel.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

/// Handle to a worker running on the tokio runtime.
#[derive(Debug)]
pub struct WorkerHandle {
    stop: StopSignal,
    join: Option<JoinHandle<Result<(), WorkerError>>>,
}

impl WorkerHandle {
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub async fn shutdown(mut self) -> Result<(), WorkerError> {
        self.stop.stop();
        match self.join.take() {
            Some(join) => join.await.map_err(|e| WorkerError::Join(e.to_string()))?,
            None => Ok(()),
        }
    }
}

/// A sequential worker. Run several (tasks, processes or machines) against
/// one store for parallelism.
pub struct Worker<S> {
    executor: JobExecutor<S>,
    config: WorkerConfig,
    stop: StopSignal,
    on_idle: Option<IdleHook>,
}

impl<S: JobStore> Worker<S> {
    pub fn new(executor: JobExecutor<S>, config: WorkerConfig) -> Self {
        Self {
            executor,
            config,
            stop: StopSignal::new(),
            on_idle: None,
        }
    }

    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_on_idle<F>(mut self, hook: F) -> Self
    where
        F: Fn(&WorkerId) + Send + Sync + 'static,
    {
        self.on_idle = Some(Box::new(hook));
        self
    }

    pub fn name(&self) -> &WorkerId {
        &self.config.name
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn executor(&self) -> &JobExecutor<S> {
        &self.executor
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Run until stopped, then release every lock this worker still holds.
    ///
    /// Job failures never end the loop; a [`StoreError`] does.
    pub async fn run(&self) -> Result<(), WorkerError> {
        self.say(&format!("*** Starting job worker {}", self.config.name));

        let result = self.run_loop().await;

        match self.executor.store().clear_locks(&self.config.name).await {
            Ok(0) => {}
            Ok(released) => info!(worker = %self.config.name, released, "released held locks"),
            Err(err) => error!(worker = %self.config.name, error = %err, "failed to clear locks"),
        }
        if let Err(err) = &result {
            error!(worker = %self.config.name, error = %err, "worker stopped on error");
        }
        self.say("*** Exiting job worker");
        result
    }

    /// Move the worker onto the runtime.
    pub fn spawn(self) -> WorkerHandle
    where
        S: 'static,
    {
        let stop = self.stop.clone();
        let join = tokio::spawn(async move { self.run().await });
        WorkerHandle {
            stop,
            join: Some(join),
        }
    }

    /// Run up to `batch_size` jobs; returns `(successes, failures)`.
    ///
    /// Stops early when nothing could be claimed or a stop was requested.
    pub async fn work_off(&self) -> Result<(usize, usize), StoreError> {
        let mut successes = 0;
        let mut failures = 0;

        for _ in 0..self.config.batch_size {
            match self.reserve_and_run_one_job().await? {
                Some(true) => successes += 1,
                Some(false) => failures += 1,
                None => break,
            }
            if self.stop.is_stopped() {
                break;
            }
        }
        Ok((successes, failures))
    }

    /// Claim and run the first available candidate.
    ///
    /// `Some(true)` on success, `Some(false)` on failure, `None` if every
    /// candidate was taken by someone else or there were none.
    pub async fn reserve_and_run_one_job(&self) -> Result<Option<bool>, StoreError> {
        let max_run_time = self.executor.config().max_run_time;
        let candidates = self
            .executor
            .store()
            .find_available(
                self.config.read_ahead,
                max_run_time,
                &self.config.name,
                &self.config.filter,
            )
            .await?;

        for mut job in candidates {
            let outcome = self
                .executor
                .run_with_lock(&mut job, max_run_time, &self.config.name)
                .await?;
            match outcome {
                RunOutcome::Success => return Ok(Some(true)),
                RunOutcome::Failure => return Ok(Some(false)),
                RunOutcome::NotClaimed => continue,
            }
        }
        Ok(None)
    }

    /// Log `text`, echoing it to stdout unless quiet.
    pub fn say(&self, text: &str) {
        if !self.config.quiet {
            println!("{text}");
        }
        info!(worker = %self.config.name, "{text}");
    }

    async fn run_loop(&self) -> Result<(), WorkerError> {
        let mut next_idle = Instant::now().checked_add(self.config.idle_after);

        loop {
            let started = Instant::now();
            let (successes, failures) = self.work_off().await?;
            let count = successes + failures;

            if self.stop.is_stopped() {
                break;
            }

            if count == 0 {
                if next_idle.is_some_and(|at| Instant::now() >= at) {
                    self.on_idle();
                    next_idle = Instant::now().checked_add(self.config.idle_after);
                }
                tokio::select! {
                    _ = tokio::time::sleep(self.config.sleep_delay) => {}
                    _ = self.stop.stopped() => {}
                }
            } else {
                next_idle = Instant::now().checked_add(self.config.idle_after);
                let elapsed = started.elapsed().as_secs_f64().max(f64::EPSILON);
                self.say(&format!(
                    "{count} jobs processed at {:.4} j/s, {failures} failed ...",
                    count as f64 / elapsed
                ));
            }

            if self.stop.is_stopped() {
                break;
            }
        }
        Ok(())
    }

    fn on_idle(&self) {
        info!(worker = %self.config.name, "worker idle");
        if let Some(hook) = &self.on_idle {
            hook(&self.config.name);
        }
    }
}
