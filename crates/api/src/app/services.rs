use std::sync::Arc;

use anyhow::Context;

use corejobs_infra::{
    config::{PipelineConfig, QueueBackend, QueueConfig, StoreBackend},
    handlers::{HandlerRegistry, SecurityCatalog},
    ingestion::IngestionGateway,
    query::QueryService,
    queue::{InMemoryQueue, JobQueue},
    store::{InMemoryJobStore, JobStore, PostgresJobStore},
    worker::{WorkerPool, WorkerPoolHandle},
};

/// Everything the HTTP layer (and an embedded worker pool) needs.
#[derive(Clone)]
pub struct AppServices {
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn JobQueue>,
    pub gateway: IngestionGateway,
    pub queries: QueryService,
    pub registry: HandlerRegistry,
}

impl AppServices {
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<dyn JobQueue>, config: &PipelineConfig) -> Self {
        let registry = HandlerRegistry::with_defaults(&config.handlers, Arc::new(SecurityCatalog::default()));
        Self {
            gateway: IngestionGateway::new(store.clone(), queue.clone()),
            queries: QueryService::new(store.clone(), config.pagination),
            store,
            queue,
            registry,
        }
    }

    /// In-memory store and queue (local runs, tests).
    pub fn in_memory(config: &PipelineConfig) -> Self {
        let store = Arc::new(InMemoryJobStore::new().with_duplicate_window(config.ingestion.duplicate_window));
        let queue = InMemoryQueue::arc(config.queue.visibility_timeout);
        Self::new(store, queue, config)
    }

    /// Start a worker pool against this process's store and queue.
    pub fn spawn_workers(&self, config: &PipelineConfig) -> WorkerPoolHandle {
        WorkerPool::new(
            self.store.clone(),
            self.queue.clone(),
            self.registry.clone(),
            config.worker.clone(),
        )
        .spawn()
    }
}

/// Build services for the configured backends.
pub async fn build_services(config: &PipelineConfig) -> anyhow::Result<AppServices> {
    let store = build_store(config).await?;
    let consumer = format!("{}-{}", config.worker.name, std::process::id());
    let queue = build_queue(&config.queue, &consumer).await?;
    Ok(AppServices::new(store, queue, config))
}

async fn build_store(config: &PipelineConfig) -> anyhow::Result<Arc<dyn JobStore>> {
    match config.store.backend {
        StoreBackend::Memory => {
            tracing::warn!("using in-memory job store; jobs are lost on restart");
            Ok(Arc::new(
                InMemoryJobStore::new().with_duplicate_window(config.ingestion.duplicate_window),
            ))
        }
        StoreBackend::Postgres => {
            let store = PostgresJobStore::connect(&config.store)
                .await
                .context("failed to connect to Postgres")?
                .with_duplicate_window(config.ingestion.duplicate_window);
            store.migrate().await.context("failed to apply job store schema")?;
            tracing::info!("connected to Postgres job store");
            Ok(Arc::new(store))
        }
    }
}

async fn build_queue(config: &QueueConfig, consumer: &str) -> anyhow::Result<Arc<dyn JobQueue>> {
    match config.backend {
        QueueBackend::Memory => Ok(InMemoryQueue::arc(config.visibility_timeout)),
        #[cfg(feature = "redis")]
        QueueBackend::Redis => {
            let queue = corejobs_infra::queue::RedisStreamsQueue::connect(config, consumer)
                .await
                .context("failed to connect to Redis")?;
            tracing::info!(stream = %config.stream_key, group = %config.group, "connected to Redis Streams queue");
            Ok(Arc::new(queue))
        }
        #[cfg(not(feature = "redis"))]
        QueueBackend::Redis => {
            let _ = consumer;
            anyhow::bail!("COREJOBS_QUEUE=redis requires building with the `redis` feature")
        }
    }
}
