use std::sync::Arc;

use anyhow::Context;

use corejobs_infra::config::{PipelineConfig, QueueBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = PipelineConfig::from_env().context("invalid configuration")?;
    corejobs_observability::init(config.log_format);

    let services = Arc::new(corejobs_api::app::services::build_services(&config).await?);

    let embedded = config.http.embedded_workers || config.queue.backend == QueueBackend::Memory;
    if embedded && !config.http.embedded_workers {
        tracing::warn!("in-memory queue is process-local; starting embedded workers anyway");
    }
    let workers = embedded.then(|| services.spawn_workers(&config));

    let app = corejobs_api::app::build_app(services);

    let listener = tokio::net::TcpListener::bind(config.http.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.http.bind_addr))?;

    tracing::info!(addr = %listener.local_addr()?, embedded_workers = embedded, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    if let Some(workers) = workers {
        workers.shutdown().await;
    }
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        return;
    }
    tracing::info!("shutdown signal received");
}
