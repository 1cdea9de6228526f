//! PostgreSQL store tests.
//!
//! Skipped unless `DATABASE_URL` points at a database the tests may create
//! schemas in. Each test provisions the reference schema in a fresh Postgres
//! schema and drops it afterwards.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use backlog_core::{Clock, JobFilter, JobId, ManualClock, NewJob, WorkerId};
use backlog_infra::{JobStats, JobStore, PostgresJobStore, StoreError};

const SCHEMA_SQL: &str = include_str!("../../../migrations/0001_create_jobs.sql");
const HOUR: Duration = Duration::from_secs(3600);

static SCHEMA_SEQ: AtomicU32 = AtomicU32::new(0);

struct TestDb {
    admin: PgPool,
    schema: String,
    store: PostgresJobStore,
    clock: ManualClock,
}

impl TestDb {
    async fn teardown(self) {
        self.store.pool().close().await;
        let _ = sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", self.schema))
            .execute(&self.admin)
            .await;
    }
}

async fn setup() -> Option<TestDb> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set; skipping postgres store test");
        return None;
    };

    let admin = PgPoolOptions::new()
        .max_connections(1)
        .connect(&url)
        .await
        .expect("connect to DATABASE_URL");

    let schema = format!(
        "backlog_test_{}_{}",
        std::process::id(),
        SCHEMA_SEQ.fetch_add(1, Ordering::SeqCst)
    );
    sqlx::query(&format!("CREATE SCHEMA {schema}"))
        .execute(&admin)
        .await
        .expect("create test schema");

    let search_path = format!("SET search_path TO {schema}");
    let pool = PgPoolOptions::new()
        .max_connections(8)
        .after_connect(move |conn, _meta| {
            let search_path = search_path.clone();
            Box::pin(async move {
                sqlx::query(&search_path).execute(&mut *conn).await?;
                Ok(())
            })
        })
        .connect(&url)
        .await
        .expect("connect test pool");

    sqlx::raw_sql(SCHEMA_SQL)
        .execute(&pool)
        .await
        .expect("apply reference schema");

    let clock = ManualClock::new(Utc::now());
    let store = PostgresJobStore::with_clock(pool, Arc::new(clock.clone()));
    Some(TestDb {
        admin,
        schema,
        store,
        clock,
    })
}

fn new_job(job_type: &str, priority: i32) -> NewJob {
    NewJob {
        job_type: job_type.to_string(),
        handler: format!(r#"{{"type":"{job_type}","data":null}}"#),
        priority,
        run_at: None,
    }
}

#[tokio::test]
async fn insert_and_get_round_trip_columns() {
    let Some(db) = setup().await else { return };

    let inserted = db.store.insert(new_job("Report", 3)).await.unwrap();
    let loaded = db.store.get(inserted.id).await.unwrap().unwrap();

    assert_eq!(loaded.job_type, "Report");
    assert_eq!(loaded.priority, 3);
    assert_eq!(loaded.attempts, 0);
    assert!(loaded.locked_by.is_none());
    assert!(loaded.last_error.is_none());
    assert_eq!(loaded.handler, inserted.handler);
    assert_eq!(
        loaded.run_at.timestamp_micros(),
        db.clock.now().timestamp_micros()
    );
    assert!(db.store.get(JobId::new(i64::MAX)).await.unwrap().is_none());

    db.teardown().await;
}

#[tokio::test]
async fn find_available_orders_and_filters() {
    let Some(db) = setup().await else { return };
    let worker = WorkerId::new("w");
    let now = db.clock.now();

    let low = db.store.insert(new_job("Mail", 0)).await.unwrap();
    let high = db.store.insert(new_job("Report", 10)).await.unwrap();
    let older = db
        .store
        .insert(new_job("Mail", 0).run_at(Some(now - TimeDelta::minutes(5))))
        .await
        .unwrap();
    db.store
        .insert(new_job("Mail", 20).run_at(Some(now + TimeDelta::minutes(5))))
        .await
        .unwrap();

    let found = db
        .store
        .find_available(10, HOUR, &worker, &JobFilter::default())
        .await
        .unwrap();
    let ids: Vec<_> = found.iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![high.id, older.id, low.id]);

    let first = db
        .store
        .find_available(1, HOUR, &worker, &JobFilter::default())
        .await
        .unwrap();
    assert_eq!(first[0].id, high.id);

    let filter = JobFilter::default().with_job_types(["Mail"]).with_max_priority(5);
    let mail = db.store.find_available(10, HOUR, &worker, &filter).await.unwrap();
    assert_eq!(mail.len(), 2);
    assert!(mail.iter().all(|j| j.job_type == "Mail"));

    db.teardown().await;
}

#[tokio::test]
async fn lock_is_exclusive_until_stale() {
    let Some(db) = setup().await else { return };
    let job = db.store.insert(new_job("Report", 0)).await.unwrap();
    let first = WorkerId::new("first");
    let second = WorkerId::new("second");

    let mut mine = job.clone();
    assert!(db.store.lock_exclusively(&mut mine, HOUR, &first).await.unwrap());
    let mut theirs = job.clone();
    assert!(!db.store.lock_exclusively(&mut theirs, HOUR, &second).await.unwrap());

    // The owner can always refresh.
    assert!(db.store.lock_exclusively(&mut mine, HOUR, &first).await.unwrap());

    db.clock.advance(TimeDelta::hours(1) + TimeDelta::seconds(1));
    assert!(db.store.lock_exclusively(&mut theirs, HOUR, &second).await.unwrap());
    let row = db.store.get(job.id).await.unwrap().unwrap();
    assert_eq!(row.locked_by, Some(second));

    db.teardown().await;
}

#[tokio::test]
async fn claim_returns_the_current_row() {
    let Some(db) = setup().await else { return };
    let job = db.store.insert(new_job("Report", 0)).await.unwrap();
    let stale = job.clone();

    let mut fresh = job.clone();
    fresh.attempts = 3;
    fresh.last_error = Some("boom".into());
    db.store.save(&fresh).await.unwrap();

    let worker = WorkerId::new("w");
    let mut claimed = stale;
    assert!(db.store.lock_exclusively(&mut claimed, HOUR, &worker).await.unwrap());
    assert_eq!(claimed.attempts, 3);
    assert_eq!(claimed.last_error.as_deref(), Some("boom"));
    assert_eq!(claimed.locked_by, Some(worker));

    db.teardown().await;
}

#[tokio::test]
async fn concurrent_claims_have_one_winner() {
    let Some(db) = setup().await else { return };
    let job = db.store.insert(new_job("Report", 0)).await.unwrap();
    let store = Arc::new(db.store.clone());

    let mut tasks = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        let mut job = job.clone();
        tasks.push(tokio::spawn(async move {
            store
                .lock_exclusively(&mut job, HOUR, &WorkerId::new(format!("w{i}")))
                .await
                .unwrap()
        }));
    }

    let mut winners = 0;
    for task in tasks {
        if task.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    db.teardown().await;
}

#[tokio::test]
async fn save_clear_locks_and_stats() {
    let Some(db) = setup().await else { return };
    let worker = WorkerId::new("w");

    db.store.insert(new_job("Pending", 0)).await.unwrap();
    let mut locked = db.store.insert(new_job("Locked", 0)).await.unwrap();
    db.store.lock_exclusively(&mut locked, HOUR, &worker).await.unwrap();

    let mut failed = db.store.insert(new_job("Failed", 0)).await.unwrap();
    failed.attempts = 25;
    failed.last_error = Some("boom\ncaused by: io".to_string());
    failed.failed_at = Some(db.clock.now());
    db.store.save(&failed).await.unwrap();

    let mut finished = db.store.insert(new_job("Finished", 0)).await.unwrap();
    finished.finished_at = Some(db.clock.now());
    db.store.save(&finished).await.unwrap();

    assert_eq!(
        db.store.stats().await.unwrap(),
        JobStats {
            pending: 1,
            locked: 1,
            failed: 1,
            finished: 1,
            total: 4,
        }
    );

    let row = db.store.get(failed.id).await.unwrap().unwrap();
    assert_eq!(row.attempts, 25);
    assert_eq!(row.last_error.as_deref(), Some("boom\ncaused by: io"));
    assert!(
        !db.store
            .lock_exclusively(&mut failed.clone(), HOUR, &worker)
            .await
            .unwrap()
    );

    assert_eq!(db.store.clear_locks(&worker).await.unwrap(), 1);
    assert_eq!(db.store.stats().await.unwrap().locked, 0);

    db.store.delete(finished.id).await.unwrap();
    db.store.delete(finished.id).await.unwrap();
    assert_eq!(
        db.store.save(&finished).await,
        Err(StoreError::NotFound(finished.id))
    );

    db.teardown().await;
}
