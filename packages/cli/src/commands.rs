// ABOUTME: Implementations of the serve, sweep, replay and migrate subcommands
// ABOUTME: Wires storage, gateway, dispatcher, consumer pool and sweeper from one Config

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use superagent_api::{create_router, AppState};
use superagent_core::Config;
use superagent_ingest::{
    IngestQueue, IngestionConsumer, ReplayReport, SqliteDeadLetterSink, SqliteLock,
};
use superagent_sandbox::{GatewaySandboxAgent, HttpSandboxGateway, SandboxAgent, SandboxGateway};
use superagent_storage::{connect, run_migrations, TaskStorage};
use superagent_tasks::{StaleTaskSweeper, SweepReport, TaskDispatcher, TaskDomainService};

async fn open_storage(config: &Config) -> Result<TaskStorage> {
    let pool = connect(&config.database_url)
        .await
        .with_context(|| format!("Failed to open database {}", config.database_url))?;
    run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;
    Ok(TaskStorage::new(pool))
}

fn gateway(config: &Config) -> Result<Arc<dyn SandboxGateway>> {
    let gateway =
        HttpSandboxGateway::new(&config.gateway).context("Failed to build gateway client")?;
    Ok(Arc::new(gateway))
}

/// Run the webhook API, the ingestion workers and the stale-task sweeper until Ctrl-C
pub async fn serve(config: Config) -> Result<()> {
    let sandbox_token = config.require_sandbox_token()?.to_string();
    let storage = open_storage(&config).await?;
    let pool = storage.pool().clone();
    let service = TaskDomainService::new(storage);

    let gateway = gateway(&config)?;
    let agent: Arc<dyn SandboxAgent> = Arc::new(GatewaySandboxAgent::new(gateway.clone()));
    let dispatcher = Arc::new(TaskDispatcher::new(
        service.clone(),
        gateway.clone(),
        agent,
        &config,
    ));

    let queue = IngestQueue::new(config.ingest.queue_capacity);
    let consumer = Arc::new(IngestionConsumer::new(
        service.clone(),
        Arc::new(SqliteLock::new(pool.clone())),
        Arc::new(SqliteDeadLetterSink::new(pool)),
        &config.ingest,
    ));
    let mut workers = consumer.run(queue.clone(), config.ingest.workers);

    let sweeper = StaleTaskSweeper::new(service, gateway, config.sweeper.clone());
    sweeper.start().await;

    let app = create_router(AppState::new(sandbox_token, queue.publisher(), dispatcher));
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!(
        %addr,
        workers = config.ingest.workers,
        gateway = %config.gateway.base_url,
        "SuperAgent orchestrator listening"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Shutting down");
    sweeper.stop().await;
    queue.shutdown();
    while workers.join_next().await.is_some() {}
    info!(acked = queue.acked_count(), "Ingestion workers stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
}

/// One stale-task sweep, for cron-driven deployments
pub async fn sweep(config: Config) -> Result<SweepReport> {
    let storage = open_storage(&config).await?;
    let sweeper = StaleTaskSweeper::new(
        TaskDomainService::new(storage),
        gateway(&config)?,
        config.sweeper.clone(),
    );

    let report = sweeper.sweep_once().await.context("Sweep failed")?;
    info!(
        expired_tasks = report.expired_tasks,
        checked_topics = report.reconciled.checked,
        refreshed_topics = report.reconciled.refreshed,
        failed_topics = report.reconciled.failed,
        "Sweep finished"
    );
    Ok(report)
}

/// Re-apply FAILED messages that still have retry budget
pub async fn replay(config: Config, max_retries: i32, limit: u32) -> Result<ReplayReport> {
    let storage = open_storage(&config).await?;
    let pool = storage.pool().clone();
    let consumer = IngestionConsumer::new(
        TaskDomainService::new(storage),
        Arc::new(SqliteLock::new(pool.clone())),
        Arc::new(SqliteDeadLetterSink::new(pool)),
        &config.ingest,
    );

    let report = consumer
        .replay_failed_messages(max_retries, limit)
        .await
        .context("Replay failed")?;
    info!(
        attempted = report.attempted,
        recovered = report.recovered,
        "Replay finished"
    );
    Ok(report)
}

pub async fn migrate(config: Config) -> Result<()> {
    open_storage(&config).await?;
    info!(database_url = %config.database_url, "Migrations applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn file_config(dir: &tempfile::TempDir) -> Config {
        let url = format!("sqlite://{}", dir.path().join("tasks.db").display());
        Config::from_lookup(|key| (key == "SUPERAGENT_DATABASE_URL").then(|| url.clone())).unwrap()
    }

    #[tokio::test]
    async fn test_migrate_then_sweep_empty_database() {
        let dir = tempfile::tempdir().unwrap();
        let config = file_config(&dir);

        migrate(config.clone()).await.unwrap();
        // Migrations are idempotent
        migrate(config.clone()).await.unwrap();

        let report = sweep(config).await.unwrap();
        assert_eq!(report, SweepReport::default());
    }

    #[tokio::test]
    async fn test_replay_with_nothing_failed() {
        let dir = tempfile::tempdir().unwrap();
        let report = replay(file_config(&dir), 3, 100).await.unwrap();
        assert_eq!(report, ReplayReport::default());
    }

    #[tokio::test]
    async fn test_serve_requires_sandbox_token() {
        let dir = tempfile::tempdir().unwrap();
        let err = serve(file_config(&dir)).await.unwrap_err();
        assert!(err.to_string().contains("SANDBOX_TOKEN"));
    }
}
