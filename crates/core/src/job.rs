//! The persistent job record and the predicates every store must agree on.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::codec::{EncodedPayload, PayloadRegistry};
use crate::error::CodecError;
use crate::id::{JobId, WorkerId};
use crate::payload::Payload;

/// Lifecycle state derived from a row's timestamp columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Unlocked and waiting for `run_at`.
    Pending,
    /// Claimed by a worker (possibly stale).
    Locked,
    Succeeded,
    PermanentlyFailed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::PermanentlyFailed)
    }
}

/// A job about to be inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub job_type: String,
    pub handler: String,
    pub priority: i32,
    /// Defaults to the store's notion of "now".
    pub run_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(encoded: EncodedPayload) -> Self {
        Self {
            job_type: encoded.job_type,
            handler: encoded.handler,
            priority: 0,
            run_at: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn run_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.run_at = at;
        self
    }
}

/// Memoized decoded payload of one job instance. Not persisted, not compared.
#[derive(Clone, Default)]
pub struct DecodedPayload(OnceLock<Arc<dyn Payload>>);

impl std::fmt::Debug for DecodedPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = if self.0.get().is_some() { "decoded" } else { "pending" };
        f.debug_tuple("DecodedPayload").field(&state).finish()
    }
}

impl PartialEq for DecodedPayload {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

/// A job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Higher runs first.
    pub priority: i32,
    /// Failed executions so far.
    pub attempts: u32,
    pub handler: String,
    pub job_type: String,
    pub last_error: Option<String>,
    pub run_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<WorkerId>,
    pub failed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub decoded: DecodedPayload,
}

/// Locks taken strictly before this instant are stale.
pub fn lock_expiry_cutoff(now: DateTime<Utc>, max_run_time: Duration) -> DateTime<Utc> {
    let window = TimeDelta::from_std(max_run_time).unwrap_or(TimeDelta::MAX);
    now.checked_sub_signed(window)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl Job {
    /// Row as first inserted: unlocked, no attempts, `run_at` defaulting to `now`.
    pub fn inserted(id: JobId, new_job: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id,
            priority: new_job.priority,
            attempts: 0,
            handler: new_job.handler,
            job_type: new_job.job_type,
            last_error: None,
            run_at: new_job.run_at.unwrap_or(now),
            locked_at: None,
            locked_by: None,
            failed_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
            decoded: DecodedPayload::default(),
        }
    }

    /// Whether `worker` may claim this row at `now`.
    ///
    /// Due and unlocked (or locked longer than `max_run_time` ago), or already
    /// held by `worker`; never once terminal.
    pub fn is_claimable(&self, now: DateTime<Utc>, max_run_time: Duration, worker: &WorkerId) -> bool {
        if self.failed_at.is_some() || self.finished_at.is_some() {
            return false;
        }
        let lock_free = match self.locked_at {
            None => true,
            Some(locked_at) => locked_at < lock_expiry_cutoff(now, max_run_time),
        };
        (self.run_at <= now && lock_free) || self.locked_by.as_ref() == Some(worker)
    }

    /// Whether a conditional claim by `worker` at `now` would succeed.
    ///
    /// Unlike [`Job::is_claimable`] this ignores `run_at`: the claim only
    /// arbitrates ownership, scheduling is the candidate query's business.
    pub fn accepts_lock(&self, now: DateTime<Utc>, max_run_time: Duration, worker: &WorkerId) -> bool {
        if self.failed_at.is_some() || self.finished_at.is_some() {
            return false;
        }
        if self.locked_by.as_ref() == Some(worker) {
            return true;
        }
        match self.locked_at {
            None => true,
            Some(locked_at) => locked_at < lock_expiry_cutoff(now, max_run_time),
        }
    }

    pub fn state(&self) -> JobState {
        if self.finished_at.is_some() {
            JobState::Succeeded
        } else if self.failed_at.is_some() {
            JobState::PermanentlyFailed
        } else if self.locked_by.is_some() {
            JobState::Locked
        } else {
            JobState::Pending
        }
    }

    pub fn failed(&self) -> bool {
        self.failed_at.is_some()
    }

    pub fn finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Clear the lock columns in memory; the caller persists.
    pub fn unlock(&mut self) {
        self.locked_at = None;
        self.locked_by = None;
    }

    /// Decoded payload, decoding on first access.
    pub fn payload_object(&self, registry: &PayloadRegistry) -> Result<Arc<dyn Payload>, CodecError> {
        if let Some(payload) = self.decoded.0.get() {
            return Ok(payload.clone());
        }
        let payload = registry.decode(&self.handler)?;
        Ok(self.decoded.0.get_or_init(|| payload).clone())
    }

    /// Name for log lines: the payload's display name, else its type name.
    ///
    /// A payload that cannot be decoded is reported as `<job_type>#<id>`.
    pub fn name(&self, registry: &PayloadRegistry) -> String {
        match self.payload_object(registry) {
            Ok(payload) => payload
                .display_name()
                .unwrap_or_else(|| self.job_type.clone()),
            Err(err) => {
                debug!(job.id = %self.id, error = %err, "could not decode payload for naming");
                format!("{}#{}", self.job_type, self.id)
            }
        }
    }
}

/// Text stored in `last_error`: the message followed by one trace line per line.
pub fn format_last_error(message: &str, trace: &[String]) -> String {
    if trace.is_empty() {
        return message.to_string();
    }
    format!("{}\n{}", message, trace.join("\n"))
}

/// Optional narrowing of candidate selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFilter {
    pub min_priority: Option<i32>,
    pub max_priority: Option<i32>,
    /// Allow-list of `job_type` values.
    pub job_types: Option<Vec<String>>,
}

impl JobFilter {
    pub fn with_min_priority(mut self, min: i32) -> Self {
        self.min_priority = Some(min);
        self
    }

    pub fn with_max_priority(mut self, max: i32) -> Self {
        self.max_priority = Some(max);
        self
    }

    pub fn with_job_types<I, T>(mut self, job_types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.job_types = Some(job_types.into_iter().map(Into::into).collect());
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        if self.min_priority.is_some_and(|min| job.priority < min) {
            return false;
        }
        if self.max_priority.is_some_and(|max| job.priority > max) {
            return false;
        }
        match &self.job_types {
            Some(types) => types.iter().any(|t| t == &job.job_type),
            None => true,
        }
    }
}
