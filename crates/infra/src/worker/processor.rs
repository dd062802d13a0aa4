//! Processing of a single queue delivery.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, warn, Instrument};

use corejobs_core::{JobRecord, JobStatus, StatusUpdate};

use super::retry::RetryPolicy;
use crate::handlers::{HandlerRegistry, JobContext, StopFlag, TaskError};
use crate::queue::{Delivery, JobQueue, QueueError};
use crate::store::{JobStore, JobStoreError};

/// What happened to a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Completed,
    Failed,
    /// Released back to the queue after a transient failure.
    Retrying { delay: Duration },
    /// Job already terminal, cancelled, or unknown; message acknowledged.
    Skipped,
    /// Another attempt owns the job now; this delivery's result was discarded.
    Stale,
}

/// Counters shared by all tasks of a pool.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    processed: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    skipped: AtomicU64,
    stale: AtomicU64,
    pub(crate) in_flight: AtomicU64,
}

/// Worker pool runtime statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStats {
    pub processed: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub skipped: u64,
    pub stale: u64,
    pub in_flight: u64,
}

impl Counters {
    fn record(&self, outcome: &DeliveryOutcome) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            DeliveryOutcome::Completed => &self.completed,
            DeliveryOutcome::Failed => &self.failed,
            DeliveryOutcome::Retrying { .. } => &self.retried,
            DeliveryOutcome::Skipped => &self.skipped,
            DeliveryOutcome::Stale => &self.stale,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            processed: self.processed.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }
}

/// Claims, runs and settles one delivery at a time.
#[derive(Clone)]
pub struct JobProcessor {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    registry: HandlerRegistry,
    retry: RetryPolicy,
    pub(crate) counters: Arc<Counters>,
}

impl JobProcessor {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        registry: HandlerRegistry,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
            retry,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }

    pub async fn process(&self, delivery: Delivery, stop: &StopFlag) -> DeliveryOutcome {
        let span = info_span!(
            "job",
            job_id = %delivery.message.job_id,
            reference_id = %delivery.message.reference_id,
            correlation_id = %delivery.message.correlation_id,
            delivery = delivery.delivery_count
        );

        self.counters.in_flight.fetch_add(1, Ordering::Relaxed);
        let outcome = self.process_inner(&delivery, stop).instrument(span).await;
        self.counters.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.counters.record(&outcome);
        outcome
    }

    async fn process_inner(&self, delivery: &Delivery, stop: &StopFlag) -> DeliveryOutcome {
        let job_id = delivery.message.job_id;

        let record = match self.store.begin_attempt(job_id).await {
            Ok(record) => record,
            Err(JobStoreError::NotFound(_)) => {
                warn!("poison message: job does not exist");
                self.ack(delivery).await;
                return DeliveryOutcome::Skipped;
            }
            Err(JobStoreError::InvalidTransition(e)) => {
                info!(reason = %e, "job is no longer runnable; skipping delivery");
                self.ack(delivery).await;
                return DeliveryOutcome::Skipped;
            }
            Err(e) => {
                error!(error = %e, "failed to claim job");
                return self.retry_later(delivery, 1).await;
            }
        };
        let attempt = record.attempts;

        // Crash loops redeliver without ever reaching the retry branch below.
        if attempt > self.retry.max_attempts {
            let message = format!("Retry limit reached after {} attempts", attempt - 1);
            return self.finish(delivery, &record, JobStatus::Failed, message).await;
        }

        let Some(handler) = self.registry.get(record.job_type) else {
            let message = format!("No handler registered for job type {}", record.job_type);
            return self.finish(delivery, &record, JobStatus::Failed, message).await;
        };

        info!(attempt, job_type = %record.job_type, "job started");
        let ctx = JobContext::from_record(&record, delivery.message.correlation_id, stop.clone());
        let task = tokio::spawn(async move { handler.handle(&ctx).await });
        let result = match self.run_with_lease(delivery, task).await {
            Ok(result) => result,
            Err(join_err) if join_err.is_panic() => {
                Err(TaskError::transient(format!("handler panicked: {join_err}")))
            }
            Err(join_err) => Err(TaskError::transient(format!("handler aborted: {join_err}"))),
        };

        match result {
            Ok(summary) => self.finish(delivery, &record, JobStatus::Completed, summary).await,
            Err(TaskError::Permanent(reason)) => {
                warn!(attempt, reason = %reason, "job failed permanently");
                self.finish(delivery, &record, JobStatus::Failed, reason).await
            }
            Err(TaskError::Transient(reason)) if !self.retry.should_retry(attempt) => {
                warn!(attempt, reason = %reason, "job failed; retry limit reached");
                let message = format!("{reason} (after {attempt} attempts)");
                self.finish(delivery, &record, JobStatus::Failed, message).await
            }
            Err(TaskError::Transient(reason)) => {
                warn!(attempt, reason = %reason, "transient failure; will retry");
                self.retry_later(delivery, attempt).await
            }
        }
    }

    /// Wait for the handler task, extending the delivery's lease every third
    /// of the visibility timeout so it is not redelivered while running.
    async fn run_with_lease<T>(
        &self,
        delivery: &Delivery,
        mut task: tokio::task::JoinHandle<T>,
    ) -> Result<T, tokio::task::JoinError> {
        let lease = self.queue.visibility_timeout();
        let period = (lease / 3).max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                joined = &mut task => return joined,
                _ = heartbeat.tick() => match self.queue.extend(delivery, lease).await {
                    Ok(()) => debug!(lease_ms = lease.as_millis() as u64, "lease extended"),
                    Err(QueueError::StaleReceipt(_)) => {
                        warn!("lease lost; message was redelivered elsewhere")
                    }
                    Err(e) => warn!(error = %e, "failed to extend lease"),
                },
            }
        }
    }

    /// Record the terminal status (fenced to this attempt), then ack.
    async fn finish(
        &self,
        delivery: &Delivery,
        record: &JobRecord,
        status: JobStatus,
        message: String,
    ) -> DeliveryOutcome {
        let update = StatusUpdate::new(status, message).for_attempt(record.attempts);
        match self.store.update_status(record.id, update).await {
            Ok(updated) => {
                info!(status = %updated.status, attempts = updated.attempts, "job finished");
                self.ack(delivery).await;
                if status == JobStatus::Completed {
                    DeliveryOutcome::Completed
                } else {
                    DeliveryOutcome::Failed
                }
            }
            Err(JobStoreError::StaleAttempt { expected, current, .. }) => {
                warn!(expected, current, "result discarded; job was redelivered to a newer attempt");
                DeliveryOutcome::Stale
            }
            Err(e) => {
                error!(error = %e, "failed to record job result");
                self.retry_later(delivery, record.attempts).await
            }
        }
    }

    async fn retry_later(&self, delivery: &Delivery, attempt: u32) -> DeliveryOutcome {
        let delay = self.retry.delay_for_attempt(attempt);
        match self.queue.release(delivery, delay).await {
            Ok(()) => debug!(delay_ms = delay.as_millis() as u64, "delivery released"),
            // Visibility timeout will bring it back regardless.
            Err(e) => warn!(error = %e, "failed to release delivery"),
        }
        DeliveryOutcome::Retrying { delay }
    }

    async fn ack(&self, delivery: &Delivery) {
        match self.queue.ack(delivery).await {
            Ok(()) => {}
            Err(QueueError::StaleReceipt(id)) => {
                warn!(message_id = %id, "ack rejected; message was redelivered elsewhere")
            }
            Err(e) => error!(error = %e, "failed to ack delivery"),
        }
    }
}
