use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::processor::{JobProcessor, WorkerStats};
use crate::config::WorkerConfig;
use crate::handlers::{HandlerRegistry, StopFlag};
use crate::queue::JobQueue;
use crate::store::JobStore;

/// A set of worker tasks pulling from one queue.
pub struct WorkerPool {
    processor: JobProcessor,
    queue: Arc<dyn JobQueue>,
    config: WorkerConfig,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        registry: HandlerRegistry,
        config: WorkerConfig,
    ) -> Self {
        let processor = JobProcessor::new(store, queue.clone(), registry, config.retry.clone());
        Self {
            processor,
            queue,
            config,
        }
    }

    /// Spawn `config.concurrency` worker tasks on the current runtime.
    pub fn spawn(self) -> WorkerPoolHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let concurrency = self.config.concurrency.max(1);

        let tasks = (0..concurrency)
            .map(|index| {
                let processor = self.processor.clone();
                let queue = self.queue.clone();
                let config = self.config.clone();
                let stop_rx = stop_rx.clone();
                tokio::spawn(worker_loop(index, processor, queue, config, stop_rx))
            })
            .collect();

        info!(pool = %self.config.name, concurrency, "worker pool started");
        WorkerPoolHandle {
            name: self.config.name,
            stop_tx,
            tasks,
            processor: self.processor,
            grace: self.config.shutdown_grace,
        }
    }
}

/// Handle to control a running pool.
pub struct WorkerPoolHandle {
    name: String,
    stop_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    processor: JobProcessor,
    grace: std::time::Duration,
}

impl WorkerPoolHandle {
    pub fn stats(&self) -> WorkerStats {
        self.processor.stats()
    }

    /// Raise the stop flag and wait for in-flight jobs up to the grace
    /// period; tasks still running after that are aborted.
    pub async fn shutdown(self) {
        let _ = self.stop_tx.send(true);
        let deadline = Instant::now() + self.grace;

        for mut task in self.tasks {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                warn!(pool = %self.name, "worker did not stop within the grace period; aborting");
                task.abort();
            }
        }
        info!(pool = %self.name, stats = ?self.processor.stats(), "worker pool stopped");
    }
}

async fn worker_loop(
    index: usize,
    processor: JobProcessor,
    queue: Arc<dyn JobQueue>,
    config: WorkerConfig,
    stop_rx: watch::Receiver<bool>,
) {
    let stop = StopFlag::new(stop_rx);
    info!(pool = %config.name, worker = index, "worker started");

    while !stop.is_raised() {
        match queue.dequeue(config.poll_wait).await {
            Ok(Some(delivery)) => {
                processor.process(delivery, &stop).await;
            }
            Ok(None) => {}
            Err(e) => {
                error!(pool = %config.name, worker = index, error = %e, "dequeue failed");
                tokio::time::sleep(config.poll_wait).await;
            }
        }
    }

    info!(pool = %config.name, worker = index, "worker stopped");
}
