#[tokio::main]
async fn main() -> anyhow::Result<()> {
    backlog_observability::init();

    let settings = backlog_infra::WorkerSettings::from_env()?;
    backlog_worker::run(settings, backlog_worker::builtin_registry()).await
}
