//! Worker process wiring: settings, Postgres pool, registry and signals.
//!
//! Deployments with their own payload types build a [`PayloadRegistry`],
//! register them and call [`run`] from their own `main`.

use std::sync::Arc;

use anyhow::Context;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use backlog_core::PayloadRegistry;
use backlog_infra::{JobExecutor, PostgresJobStore, StopSignal, Worker, WorkerSettings};

/// Registry with the commands every worker binary understands.
///
/// - `log`: writes its arguments to the log. Useful for checking a deployment
///   end to end.
pub fn builtin_registry() -> PayloadRegistry {
    let mut registry = PayloadRegistry::new();
    registry.register_command("log", |args: Value| {
        info!(args = %args, "log command");
        Ok(())
    });
    registry
}

/// Connect, then work until SIGINT/SIGTERM.
pub async fn run(settings: WorkerSettings, registry: PayloadRegistry) -> anyhow::Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(settings.pool_size)
        .connect(&settings.database_url)
        .await
        .context("failed to connect to DATABASE_URL")?;

    info!(
        worker = %settings.worker.name,
        job_types = ?registry.type_names(),
        "starting worker"
    );

    let store = PostgresJobStore::new(pool);
    let executor = JobExecutor::new(store, Arc::new(registry), settings.queue);
    let worker = Worker::new(executor, settings.worker);

    install_signal_handlers(worker.stop_signal());
    worker.run().await?;
    Ok(())
}

/// Stop `stop` on the first termination signal.
///
/// The running job is never interrupted; the worker exits at its next loop
/// boundary.
pub fn install_signal_handlers(stop: StopSignal) {
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Exiting...");
        stop.stop();
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
