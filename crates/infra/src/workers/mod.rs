//! Background workers.

pub mod worker;

pub use worker::{IdleHook, StopSignal, Worker, WorkerConfig, WorkerError, WorkerHandle};
