//! Standalone worker process: runs only the worker pool against the shared
//! Postgres store and Redis queue.

use anyhow::Context;

use corejobs_infra::config::{PipelineConfig, QueueBackend, StoreBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = PipelineConfig::from_env().context("invalid configuration")?;
    corejobs_observability::init(config.log_format);

    if config.store.backend == StoreBackend::Memory || config.queue.backend == QueueBackend::Memory {
        anyhow::bail!(
            "a standalone worker needs shared backends: set COREJOBS_STORE=postgres and COREJOBS_QUEUE=redis"
        );
    }

    let services = corejobs_api::app::services::build_services(&config).await?;
    let workers = services.spawn_workers(&config);
    tracing::info!(
        pool = %config.worker.name,
        concurrency = config.worker.concurrency,
        job_types = ?services.registry.job_types(),
        "worker process running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown signal received; draining workers");
    workers.shutdown().await;
    Ok(())
}
