// Scheduler node entry point

mod runner;

use anyhow::Context;
use jobstore::repository::PostgresDocumentStore;
use jobstore::{telemetry, DocumentJobStore, JobStore, Settings};
use runner::{LoggingExecutor, RunnerConfig, SchedulerRunner};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("Failed to load configuration")?;

    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.tracing_endpoint.as_deref(),
    )?;
    if let Some(port) = settings.observability.metrics_port {
        telemetry::init_metrics(port)?;
    }

    info!(
        instance_name = %settings.scheduler.instance_name,
        clustered = settings.scheduler.clustered,
        collection_id = %settings.store.collection_id,
        "Configuration loaded"
    );

    let repo = PostgresDocumentStore::connect(&settings.store)
        .await
        .context("Failed to connect to document store")?;
    repo.ensure_schema()
        .await
        .context("Failed to prepare document store schema")?;
    let repo = Arc::new(repo);

    let store = Arc::new(DocumentJobStore::new(repo.clone(), &settings)?);
    store.start().await.context("Failed to start job store")?;
    info!(instance_id = %store.instance_id(), "Job store started");

    let runner = Arc::new(SchedulerRunner::new(
        RunnerConfig::default(),
        store.clone(),
        Arc::new(LoggingExecutor),
    ));

    let runner_for_shutdown = runner.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal, initiating graceful shutdown"),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl+C, shutting down"),
        }
        runner_for_shutdown.stop();
    });

    runner.run().await;

    if let Err(e) = store.shutdown().await {
        error!(error = %e, "Error during job store shutdown");
    }
    repo.close().await;
    telemetry::shutdown_tracer();

    info!("Scheduler stopped");
    Ok(())
}
