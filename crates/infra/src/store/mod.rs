//! Job record storage.
//!
//! [`JobStore`] is the boundary; [`InMemoryJobStore`] backs tests and
//! single-process use, [`PostgresJobStore`] is the shared production store.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;
pub use r#trait::{JobStats, JobStore, StoreError};
