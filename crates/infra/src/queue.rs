//! Producer side: encode payloads and insert them as jobs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument};

use backlog_core::{CodecError, EncodedPayload, Job, NewJob, PayloadRegistry, PayloadType};

use crate::store::{JobStore, StoreError};

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Enqueue handle over a store and the registry that defines which payloads exist.
pub struct Queue<S> {
    store: S,
    registry: Arc<PayloadRegistry>,
}

impl<S: JobStore> Queue<S> {
    pub fn new(store: S, registry: Arc<PayloadRegistry>) -> Self {
        Self { store, registry }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn registry(&self) -> &PayloadRegistry {
        &self.registry
    }

    /// Enqueue `payload` to run no earlier than `run_at` (default: now).
    ///
    /// Fails with [`CodecError::InvalidPayload`] if the payload type is not
    /// registered, since no worker could ever execute it.
    #[instrument(skip(self, payload), fields(job_type = P::TYPE_NAME), err)]
    pub async fn enqueue<P: PayloadType>(
        &self,
        payload: &P,
        priority: i32,
        run_at: Option<DateTime<Utc>>,
    ) -> Result<Job, EnqueueError> {
        let encoded = self.registry.encode(payload)?;
        self.insert(encoded, priority, run_at).await
    }

    /// Enqueue a call of a registered command with JSON arguments.
    #[instrument(skip(self, args), err)]
    pub async fn enqueue_command(
        &self,
        name: &str,
        args: Value,
        priority: i32,
        run_at: Option<DateTime<Utc>>,
    ) -> Result<Job, EnqueueError> {
        let encoded = self.registry.encode_command(name, args)?;
        self.insert(encoded, priority, run_at).await
    }

    async fn insert(
        &self,
        encoded: EncodedPayload,
        priority: i32,
        run_at: Option<DateTime<Utc>>,
    ) -> Result<Job, EnqueueError> {
        let job = self
            .store
            .insert(NewJob::new(encoded).with_priority(priority).run_at(run_at))
            .await?;
        debug!(job.id = %job.id, job_type = %job.job_type, priority, "job enqueued");
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use chrono::TimeDelta;
    use serde::{Deserialize, Serialize};

    use backlog_core::Payload;

    use crate::store::InMemoryJobStore;

    #[derive(Debug, Serialize, Deserialize)]
    struct Welcome {
        user: String,
    }

    #[async_trait]
    impl Payload for Welcome {
        async fn perform(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    impl PayloadType for Welcome {
        const TYPE_NAME: &'static str = "Welcome";
    }

    fn queue() -> Queue<Arc<InMemoryJobStore>> {
        let mut registry = PayloadRegistry::new();
        registry.register::<Welcome>();
        registry.register_command("purge", |_args| Ok(()));
        Queue::new(InMemoryJobStore::arc(), Arc::new(registry))
    }

    #[tokio::test]
    async fn enqueue_records_type_priority_and_schedule() {
        let queue = queue();
        let at = Utc::now() + TimeDelta::hours(1);
        let job = queue
            .enqueue(&Welcome { user: "ada".into() }, 3, Some(at))
            .await
            .unwrap();

        assert_eq!(job.job_type, "Welcome");
        assert_eq!(job.priority, 3);
        assert_eq!(job.run_at, at);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.name(queue.registry()), "Welcome");
        assert!(queue.store().get(job.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unregistered_payload_is_invalid() {
        let queue = Queue::new(InMemoryJobStore::arc(), Arc::new(PayloadRegistry::new()));
        let err = queue
            .enqueue(&Welcome { user: "ada".into() }, 0, None)
            .await
            .unwrap_err();

        assert!(matches!(err, EnqueueError::Codec(CodecError::InvalidPayload(_))));
        assert!(queue.store().is_empty());
    }

    #[tokio::test]
    async fn commands_must_be_registered() {
        let queue = queue();
        let job = queue
            .enqueue_command("purge", serde_json::json!({ "days": 30 }), 0, None)
            .await
            .unwrap();
        assert_eq!(job.name(queue.registry()), "Command:purge");

        let err = queue
            .enqueue_command("rm -rf", Value::Null, 0, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EnqueueError::Codec(CodecError::InvalidPayload(_))));
    }
}
