//! The capability contract a unit of deferred work must satisfy.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// A decoded job payload.
///
/// `perform` is the single execution entry point. It may be aborted at any
/// await point when the run deadline passes, and may run more than once if a
/// claim expires while it is still in flight, so it should be idempotent.
#[async_trait]
pub trait Payload: Send + Sync + 'static {
    async fn perform(&self) -> anyhow::Result<()>;

    /// Name used in log lines; defaults to the registered type name.
    fn display_name(&self) -> Option<String> {
        None
    }

    /// Overrides the queue-wide maximum number of attempts.
    fn max_attempts(&self) -> Option<u32> {
        None
    }
}

/// A payload type that can be stored and later rebuilt by name.
///
/// `TYPE_NAME` is written to the `job_type` column and used to find the
/// decoder, so it must be unique within a deployment and stable across
/// releases.
pub trait PayloadType: Payload + Serialize + DeserializeOwned {
    const TYPE_NAME: &'static str;
}
