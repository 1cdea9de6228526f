//! Infrastructure layer: job storage, the lifecycle engine and workers.

pub mod config;
pub mod executor;
pub mod queue;
pub mod store;
pub mod workers;


#[cfg(test)]
mod testing;

pub use config::WorkerSettings;
pub use executor::{FailureOutcome, JobExecutor, RunOutcome};
pub use queue::{EnqueueError, Queue};
pub use store::{InMemoryJobStore, JobStats, JobStore, PostgresJobStore, StoreError};
pub use workers::{StopSignal, Worker, WorkerConfig, WorkerError, WorkerHandle};
