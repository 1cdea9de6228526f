//! Postgres-backed job store.
//!
//! Expects the `jobs` table described by `migrations/0001_create_jobs.sql`.
//! Every worker process shares the table; the conditional `UPDATE` in
//! [`PostgresJobStore::lock_exclusively`] is what keeps claims exclusive
//! across processes and machines.
//!
//! ## Error Mapping
//!
//! | SQLx Error | StoreError |
//! |------------|------------|
//! | Database (any code) | `Storage` with the database message |
//! | PoolClosed | `Storage` |
//! | RowNotFound | `Storage` (queries use `fetch_optional`/`fetch_all`) |
//! | Other | `Storage` |
//!
//! Timestamps come from the injected [`Clock`], not from `now()` in SQL, so
//! every participant compares lock ages against the same kind of time source.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder, Row};
use tracing::{Span, field, instrument};

use backlog_core::{
    Clock, DecodedPayload, Job, JobFilter, JobId, NewJob, SystemClock, WorkerId, lock_expiry_cutoff,
};

use super::r#trait::{JobStats, JobStore, StoreError};

const JOB_COLUMNS: &str = "id, priority, attempts, handler, last_error, run_at, locked_at, \
    locked_by, failed_at, finished_at, job_type, created_at, updated_at";

#[derive(Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for PostgresJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresJobStore")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self::with_clock(pool, Arc::new(SystemClock))
    }

    pub fn with_clock(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool: Arc::new(pool),
            clock,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_type = %job.job_type, priority = job.priority, job_id = field::Empty), err)]
    async fn insert(&self, job: NewJob) -> Result<Job, StoreError> {
        let now = self.clock.now();
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO jobs (priority, attempts, handler, run_at, job_type, created_at, updated_at)
            VALUES ($1, 0, $2, $3, $4, $5, $5)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job.priority)
        .bind(&job.handler)
        .bind(job.run_at.unwrap_or(now))
        .bind(&job.job_type)
        .bind(now)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert", e))?;

        let job = decode_row(&row)?;
        Span::current().record("job_id", job.id.as_i64());
        Ok(job)
    }

    #[instrument(skip(self, filter), fields(worker = %worker, job_count = field::Empty), err)]
    async fn find_available(
        &self,
        limit: usize,
        max_run_time: Duration,
        worker: &WorkerId,
        filter: &JobFilter,
    ) -> Result<Vec<Job>, StoreError> {
        let now = self.clock.now();
        let cutoff = lock_expiry_cutoff(now, max_run_time);

        let mut query = QueryBuilder::<Postgres>::new(format!("SELECT {JOB_COLUMNS} FROM jobs WHERE ("));
        query
            .push("(run_at <= ")
            .push_bind(now)
            .push(" AND (locked_at IS NULL OR locked_at < ")
            .push_bind(cutoff)
            .push(")) OR locked_by = ")
            .push_bind(worker.as_str())
            .push(") AND failed_at IS NULL AND finished_at IS NULL");

        if let Some(min) = filter.min_priority {
            query.push(" AND priority >= ").push_bind(min);
        }
        if let Some(max) = filter.max_priority {
            query.push(" AND priority <= ").push_bind(max);
        }
        if let Some(job_types) = &filter.job_types {
            query.push(" AND job_type = ANY(").push_bind(job_types.clone()).push(")");
        }

        query
            .push(" ORDER BY priority DESC, run_at ASC, id ASC LIMIT ")
            .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));

        let rows = query
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_available", e))?;

        let jobs = rows.iter().map(decode_row).collect::<Result<Vec<_>, _>>()?;
        Span::current().record("job_count", jobs.len());
        Ok(jobs)
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, worker = %worker), err)]
    async fn lock_exclusively(
        &self,
        job: &mut Job,
        max_run_time: Duration,
        worker: &WorkerId,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let cutoff = lock_expiry_cutoff(now, max_run_time);

        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET locked_at = $1, locked_by = $2, updated_at = $1
            WHERE id = $3
              AND failed_at IS NULL
              AND finished_at IS NULL
              AND (locked_by = $2 OR locked_at IS NULL OR locked_at < $4)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(now)
        .bind(worker.as_str())
        .bind(job.id.as_i64())
        .bind(cutoff)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("lock_exclusively", e))?;

        let Some(row) = row else {
            return Ok(false);
        };

        // The caller's copy may predate another worker's attempt.
        let decoded = std::mem::take(&mut job.decoded);
        *job = decode_row(&row)?;
        job.decoded = decoded;
        Ok(true)
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, attempts = job.attempts), err)]
    async fn save(&self, job: &Job) -> Result<(), StoreError> {
        let attempts = i32::try_from(job.attempts)
            .map_err(|_| StoreError::Storage(format!("attempts out of range: {}", job.attempts)))?;

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET priority = $2,
                attempts = $3,
                handler = $4,
                last_error = $5,
                run_at = $6,
                locked_at = $7,
                locked_by = $8,
                failed_at = $9,
                finished_at = $10,
                updated_at = $11
            WHERE id = $1
            "#,
        )
        .bind(job.id.as_i64())
        .bind(job.priority)
        .bind(attempts)
        .bind(&job.handler)
        .bind(job.last_error.as_deref())
        .bind(job.run_at)
        .bind(job.locked_at)
        .bind(job.locked_by.as_ref().map(WorkerId::as_str))
        .bind(job.failed_at)
        .bind(job.finished_at)
        .bind(self.clock.now())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("save", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(job.id));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn delete(&self, id: JobId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id.as_i64())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(worker = %worker), err)]
    async fn clear_locks(&self, worker: &WorkerId) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET locked_at = NULL, locked_by = NULL, updated_at = $2 WHERE locked_by = $1",
        )
        .bind(worker.as_str())
        .bind(self.clock.now())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("clear_locks", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id.as_i64())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(decode_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<JobStats, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (
                    WHERE failed_at IS NULL AND finished_at IS NULL AND locked_by IS NULL
                ) AS pending,
                COUNT(*) FILTER (
                    WHERE failed_at IS NULL AND finished_at IS NULL AND locked_by IS NOT NULL
                ) AS locked,
                COUNT(*) FILTER (WHERE failed_at IS NOT NULL) AS failed,
                COUNT(*) FILTER (WHERE finished_at IS NOT NULL) AS finished,
                COUNT(*) AS total
            FROM jobs
            "#,
        )
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let count = |column: &str| -> Result<u64, StoreError> {
            let value: i64 = row
                .try_get(column)
                .map_err(|e| map_sqlx_error("stats", e))?;
            Ok(value.max(0) as u64)
        };

        Ok(JobStats {
            pending: count("pending")?,
            locked: count("locked")?,
            failed: count("failed")?,
            finished: count("finished")?,
            total: count("total")?,
        })
    }
}

fn decode_row(row: &PgRow) -> Result<Job, StoreError> {
    JobRow::from_row(row)
        .map(Job::from)
        .map_err(|e| StoreError::Storage(format!("failed to deserialize job row: {e}")))
}

/// Map SQLx errors to `StoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            StoreError::Storage(format!(
                "database error in {operation} ({code}): {}",
                db_err.message()
            ))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::RowNotFound => {
            StoreError::Storage(format!("unexpected row not found in {operation}"))
        }
        _ => StoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

#[derive(Debug)]
struct JobRow {
    id: i64,
    priority: i32,
    attempts: u32,
    handler: String,
    last_error: Option<String>,
    run_at: DateTime<Utc>,
    locked_at: Option<DateTime<Utc>>,
    locked_by: Option<String>,
    failed_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    job_type: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let attempts: i32 = row.try_get("attempts")?;
        let attempts = u32::try_from(attempts).map_err(|e| sqlx::Error::ColumnDecode {
            index: "attempts".to_string(),
            source: Box::new(e),
        })?;

        Ok(JobRow {
            id: row.try_get("id")?,
            priority: row.try_get("priority")?,
            attempts,
            handler: row.try_get("handler")?,
            last_error: row.try_get("last_error")?,
            run_at: row.try_get("run_at")?,
            locked_at: row.try_get("locked_at")?,
            locked_by: row.try_get("locked_by")?,
            failed_at: row.try_get("failed_at")?,
            finished_at: row.try_get("finished_at")?,
            job_type: row.try_get("job_type")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        Job {
            id: JobId::new(row.id),
            priority: row.priority,
            attempts: row.attempts,
            handler: row.handler,
            job_type: row.job_type,
            last_error: row.last_error,
            run_at: row.run_at,
            locked_at: row.locked_at,
            locked_by: row.locked_by.map(WorkerId::new),
            failed_at: row.failed_at,
            finished_at: row.finished_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            decoded: DecodedPayload::default(),
        }
    }
}
