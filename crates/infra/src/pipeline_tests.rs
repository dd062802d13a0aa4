//! End-to-end tests for the job pipeline on the in-memory backends.
//!
//! Tests: Gateway → JobStore → JobQueue → JobProcessor → JobStore → QueryService
//!
//! Verifies:
//! - Accepted jobs are durable and queued before the caller gets a receipt
//! - Duplicate submissions resolve to the active job without a second message
//! - Enqueue or queueing failures leave no orphaned `Pending`/`Queued` record
//! - Long-running handlers keep their lease and run exactly once
//! - Retry, permanent failure and cancellation land in the right terminal state

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use chrono::Utc;
    use corejobs_core::{
        CorrelationId, JobId, JobRecord, JobStatus, JobType, NewJob, StatusUpdate,
    };

    use crate::config::{HandlersConfig, PaginationConfig, WorkerConfig};
    use crate::handlers::{
        ConnectionTestHandler, HandlerRegistry, JobContext, JobHandler, SecurityCatalog, StopFlag,
        TaskError,
    };
    use crate::ingestion::{IngestionError, IngestionGateway, SubmissionContext};
    use crate::query::{JobQuery, ListParams, QueryService};
    use crate::queue::{
        Delivery, InMemoryQueue, JobQueue, MessageId, QueueDepth, QueueError, QueueMessage,
    };
    use crate::store::{CreateOutcome, InMemoryJobStore, JobStats, JobStore, JobStoreError};
    use crate::worker::{DeliveryOutcome, JobProcessor, RetryPolicy, WorkerPool};

    /// Fails or succeeds according to a fixed script, counting calls.
    struct ScriptedHandler {
        calls: AtomicU32,
        script: fn(u32) -> Result<String, TaskError>,
    }

    impl ScriptedHandler {
        fn new(script: fn(u32) -> Result<String, TaskError>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                script,
            })
        }
    }

    #[async_trait::async_trait]
    impl JobHandler for ScriptedHandler {
        async fn handle(&self, _ctx: &JobContext) -> Result<String, TaskError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            (self.script)(call)
        }
    }

    struct PanickingHandler;

    #[async_trait::async_trait]
    impl JobHandler for PanickingHandler {
        async fn handle(&self, _ctx: &JobContext) -> Result<String, TaskError> {
            panic!("handler bug");
        }
    }

    /// A queue whose broker is always down.
    struct DownQueue;

    #[async_trait::async_trait]
    impl JobQueue for DownQueue {
        async fn enqueue(&self, _message: QueueMessage) -> Result<MessageId, QueueError> {
            Err(QueueError::Unavailable("connection refused".into()))
        }

        async fn dequeue(&self, _wait: Duration) -> Result<Option<Delivery>, QueueError> {
            Err(QueueError::Unavailable("connection refused".into()))
        }

        async fn ack(&self, _delivery: &Delivery) -> Result<(), QueueError> {
            Ok(())
        }

        async fn release(&self, _delivery: &Delivery, _delay: Duration) -> Result<(), QueueError> {
            Ok(())
        }

        async fn extend(&self, _delivery: &Delivery, _extension: Duration) -> Result<(), QueueError> {
            Ok(())
        }

        fn visibility_timeout(&self) -> Duration {
            Duration::from_secs(30)
        }

        async fn depth(&self) -> Result<QueueDepth, QueueError> {
            Ok(QueueDepth::default())
        }
    }

    /// In-memory store whose first status update fails.
    struct FlakyStore {
        inner: InMemoryJobStore,
        failed_once: AtomicU32,
    }

    #[async_trait::async_trait]
    impl JobStore for FlakyStore {
        async fn create(&self, job: NewJob) -> Result<CreateOutcome, JobStoreError> {
            self.inner.create(job).await
        }

        async fn get(&self, id: JobId) -> Result<JobRecord, JobStoreError> {
            self.inner.get(id).await
        }

        async fn update_status(&self, id: JobId, update: StatusUpdate) -> Result<JobRecord, JobStoreError> {
            if self.failed_once.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(JobStoreError::Storage("connection reset".into()));
            }
            self.inner.update_status(id, update).await
        }

        async fn begin_attempt(&self, id: JobId) -> Result<JobRecord, JobStoreError> {
            self.inner.begin_attempt(id).await
        }

        async fn fail_undelivered(&self, id: JobId, reason: &str) -> Result<JobRecord, JobStoreError> {
            self.inner.fail_undelivered(id, reason).await
        }

        async fn list(&self, query: &JobQuery) -> Result<(Vec<JobRecord>, u64), JobStoreError> {
            self.inner.list(query).await
        }

        async fn stats(&self) -> Result<JobStats, JobStoreError> {
            self.inner.stats().await
        }
    }

    /// Succeeds after `duration` of (virtual) time, counting calls.
    struct SlowHandler {
        calls: AtomicU32,
        duration: Duration,
    }

    #[async_trait::async_trait]
    impl JobHandler for SlowHandler {
        async fn handle(&self, _ctx: &JobContext) -> Result<String, TaskError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.duration).await;
            Ok("slow job done".to_string())
        }
    }

    struct Pipeline {
        store: Arc<InMemoryJobStore>,
        queue: Arc<InMemoryQueue>,
        gateway: IngestionGateway,
    }

    fn pipeline() -> Pipeline {
        let store = InMemoryJobStore::arc();
        let queue = InMemoryQueue::arc(Duration::from_secs(30));
        let gateway = IngestionGateway::new(store.clone(), queue.clone());
        Pipeline {
            store,
            queue,
            gateway,
        }
    }

    fn processor(p: &Pipeline, registry: HandlerRegistry, retry: RetryPolicy) -> JobProcessor {
        JobProcessor::new(p.store.clone(), p.queue.clone(), registry, retry)
    }

    fn connection_test_registry() -> HandlerRegistry {
        HandlerRegistry::new().register(
            JobType::ConnectionTest,
            Arc::new(ConnectionTestHandler::new(Duration::ZERO)),
        )
    }

    async fn next_delivery(queue: &InMemoryQueue) -> Delivery {
        queue
            .dequeue(Duration::from_millis(100))
            .await
            .unwrap()
            .expect("a delivery should be ready")
    }

    #[tokio::test]
    async fn accepted_job_is_queued_then_completed() {
        let p = pipeline();
        let ctx = SubmissionContext::default();

        let receipt = p
            .gateway
            .submit_connection_test("TEST-1", Some("ping"), &ctx)
            .await
            .unwrap();
        assert_eq!(receipt.status, JobStatus::Queued);
        assert!(!receipt.duplicate);
        assert_eq!(receipt.correlation_id, ctx.correlation_id);
        assert_eq!(p.queue.depth().await.unwrap().ready, 1);

        let stored = p.store.get(receipt.core_job_id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(stored.description, "ping");

        let worker = processor(&p, connection_test_registry(), RetryPolicy::default());
        let delivery = next_delivery(&p.queue).await;
        assert_eq!(delivery.message.correlation_id, ctx.correlation_id);
        let outcome = worker.process(delivery, &StopFlag::never()).await;
        assert_eq!(outcome, DeliveryOutcome::Completed);

        let done = p.store.get(receipt.core_job_id).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.message, "Connection test completed");
        assert_eq!(done.attempts, 1);
        assert!(done.finished_at.is_some());
        assert_eq!(p.queue.depth().await.unwrap(), QueueDepth::default());
        assert_eq!(worker.stats().completed, 1);
    }

    #[tokio::test]
    async fn duplicate_reference_returns_active_job_without_enqueue() {
        let p = pipeline();
        let ctx = SubmissionContext::default();

        let first = p.gateway.submit_connection_test("DUP-1", None, &ctx).await.unwrap();
        let second = p.gateway.submit_connection_test("DUP-1", None, &ctx).await.unwrap();

        assert!(second.duplicate);
        assert_eq!(second.core_job_id, first.core_job_id);
        assert_eq!(p.queue.depth().await.unwrap().ready, 1);
        assert_eq!(p.store.stats().await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn enqueue_failure_marks_job_failed() {
        let store = InMemoryJobStore::arc();
        let gateway = IngestionGateway::new(store.clone(), Arc::new(DownQueue));

        let err = gateway
            .submit_connection_test("DOWN-1", None, &SubmissionContext::default())
            .await
            .unwrap_err();
        let IngestionError::QueueUnavailable { job_id, .. } = &err else {
            panic!("expected QueueUnavailable, got {err:?}");
        };

        let record = store.get(*job_id).await.unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.message, "enqueue failed");
        assert_eq!(record.attempts, 0);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.queued, 0);
    }

    #[tokio::test]
    async fn queueing_failure_marks_job_failed_and_frees_reference() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryJobStore::new().with_duplicate_window(Duration::ZERO),
            failed_once: AtomicU32::new(0),
        });
        let queue = InMemoryQueue::arc(Duration::from_secs(30));
        let gateway = IngestionGateway::new(store.clone(), queue.clone());
        let ctx = SubmissionContext::default();

        let err = gateway.submit_connection_test("FLAKY-1", None, &ctx).await.unwrap_err();
        assert!(matches!(err, IngestionError::Store(JobStoreError::Storage(_))), "{err:?}");

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 0);
        assert_eq!(queue.depth().await.unwrap().ready, 0);
        let (failed, _) = store.list(&JobQuery::default()).await.unwrap();
        assert_eq!(failed[0].message, "enqueue failed");

        // The failed record does not hold the reference id hostage.
        let retry = gateway.submit_connection_test("FLAKY-1", None, &ctx).await.unwrap();
        assert!(!retry.duplicate);
        assert_ne!(retry.core_job_id, failed[0].id);
        assert_eq!(retry.status, JobStatus::Queued);
        assert_eq!(queue.depth().await.unwrap().ready, 1);
    }

    #[tokio::test]
    async fn invalid_submission_is_rejected_before_persisting() {
        let p = pipeline();
        let err = p
            .gateway
            .submit_connection_test("   ", None, &SubmissionContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestionError::Validation(_)));
        assert_eq!(p.store.stats().await.unwrap().total, 0);
        assert_eq!(p.queue.depth().await.unwrap().ready, 0);
    }

    #[tokio::test]
    async fn transient_failures_retry_until_ceiling() {
        let p = pipeline();
        let handler = ScriptedHandler::new(|_| Err(TaskError::transient("dependency down")));
        let registry = HandlerRegistry::new().register(JobType::ConnectionTest, handler.clone());
        let worker = processor(&p, registry, RetryPolicy::fixed(3, Duration::ZERO));

        let receipt = p
            .gateway
            .submit_connection_test("RETRY-1", None, &SubmissionContext::default())
            .await
            .unwrap();

        for attempt in 1..=2 {
            let outcome = worker.process(next_delivery(&p.queue).await, &StopFlag::never()).await;
            assert!(matches!(outcome, DeliveryOutcome::Retrying { .. }), "attempt {attempt}");
            let record = p.store.get(receipt.core_job_id).await.unwrap();
            assert_eq!(record.status, JobStatus::Processing);
            assert_eq!(record.attempts, attempt);
        }

        let outcome = worker.process(next_delivery(&p.queue).await, &StopFlag::never()).await;
        assert_eq!(outcome, DeliveryOutcome::Failed);

        let record = p.store.get(receipt.core_job_id).await.unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.attempts, 3);
        assert_eq!(record.message, "dependency down (after 3 attempts)");
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(p.queue.depth().await.unwrap(), QueueDepth::default());
    }

    #[tokio::test]
    async fn transient_failure_then_success_completes() {
        let p = pipeline();
        let handler = ScriptedHandler::new(|call| {
            if call == 1 {
                Err(TaskError::transient("blip"))
            } else {
                Ok("done".to_string())
            }
        });
        let registry = HandlerRegistry::new().register(JobType::ConnectionTest, handler);
        let worker = processor(&p, registry, RetryPolicy::fixed(3, Duration::ZERO));

        let receipt = p
            .gateway
            .submit_connection_test("RETRY-2", None, &SubmissionContext::default())
            .await
            .unwrap();

        let first = worker.process(next_delivery(&p.queue).await, &StopFlag::never()).await;
        assert!(matches!(first, DeliveryOutcome::Retrying { .. }));
        let second = next_delivery(&p.queue).await;
        assert_eq!(second.delivery_count, 2);
        assert_eq!(worker.process(second, &StopFlag::never()).await, DeliveryOutcome::Completed);

        let record = p.store.get(receipt.core_job_id).await.unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.message, "done");
        assert_eq!(record.attempts, 2);
    }

    #[tokio::test]
    async fn redelivery_after_crash_completes_once() {
        let store = InMemoryJobStore::arc();
        let queue = InMemoryQueue::arc(Duration::from_millis(50));
        let gateway = IngestionGateway::new(store.clone(), queue.clone());
        let handler = ScriptedHandler::new(|_| Ok("done".to_string()));
        let registry = HandlerRegistry::new().register(JobType::ConnectionTest, handler.clone());
        let worker = JobProcessor::new(store.clone(), queue.clone(), registry, RetryPolicy::default());

        let receipt = gateway
            .submit_connection_test("CRASH-1", None, &SubmissionContext::default())
            .await
            .unwrap();

        // First worker claims and runs the job, then dies before settling it.
        let lost = next_delivery(&queue).await;
        let claimed = store.begin_attempt(lost.message.job_id).await.unwrap();
        let ctx = JobContext::from_record(&claimed, lost.message.correlation_id, StopFlag::never());
        handler.handle(&ctx).await.unwrap();

        let redelivered = queue.dequeue(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(redelivered.delivery_count, 2);
        assert_eq!(worker.process(redelivered, &StopFlag::never()).await, DeliveryOutcome::Completed);

        let record = store.get(receipt.core_job_id).await.unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.attempts, 2);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);

        // The dead worker's receipt no longer acknowledges anything.
        assert!(matches!(queue.ack(&lost).await, Err(QueueError::StaleReceipt(_))));
        assert_eq!(queue.depth().await.unwrap(), QueueDepth::default());
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let p = pipeline();
        let handler = ScriptedHandler::new(|_| Err(TaskError::permanent("bad payload")));
        let registry = HandlerRegistry::new().register(JobType::ConnectionTest, handler.clone());
        let worker = processor(&p, registry, RetryPolicy::default());

        let receipt = p
            .gateway
            .submit_connection_test("PERM-1", None, &SubmissionContext::default())
            .await
            .unwrap();

        let outcome = worker.process(next_delivery(&p.queue).await, &StopFlag::never()).await;
        assert_eq!(outcome, DeliveryOutcome::Failed);

        let record = p.store.get(receipt.core_job_id).await.unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.message, "bad payload");
        assert_eq!(record.attempts, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handler_panic_is_contained_and_retried() {
        let p = pipeline();
        let registry = HandlerRegistry::new().register(JobType::ConnectionTest, Arc::new(PanickingHandler));
        let worker = processor(&p, registry, RetryPolicy::fixed(2, Duration::ZERO));

        let receipt = p
            .gateway
            .submit_connection_test("PANIC-1", None, &SubmissionContext::default())
            .await
            .unwrap();

        let first = worker.process(next_delivery(&p.queue).await, &StopFlag::never()).await;
        assert!(matches!(first, DeliveryOutcome::Retrying { .. }));
        let second = worker.process(next_delivery(&p.queue).await, &StopFlag::never()).await;
        assert_eq!(second, DeliveryOutcome::Failed);

        let record = p.store.get(receipt.core_job_id).await.unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert!(record.message.starts_with("handler panicked"), "{}", record.message);
    }

    #[tokio::test]
    async fn missing_handler_fails_job() {
        let p = pipeline();
        let worker = processor(&p, HandlerRegistry::new(), RetryPolicy::default());

        let receipt = p.gateway.submit_file_import(&SubmissionContext::default()).await.unwrap();
        assert!(receipt.reference_id.starts_with("CJB3-"));

        let outcome = worker.process(next_delivery(&p.queue).await, &StopFlag::never()).await;
        assert_eq!(outcome, DeliveryOutcome::Failed);
        let record = p.store.get(receipt.core_job_id).await.unwrap();
        assert_eq!(record.message, "No handler registered for job type FileImport");
    }

    #[tokio::test]
    async fn cancelled_job_is_skipped_by_worker() {
        let p = pipeline();
        let ctx = SubmissionContext {
            correlation_id: CorrelationId::new(),
            caller: "ops".to_string(),
        };
        let receipt = p.gateway.submit_connection_test("CANCEL-1", None, &ctx).await.unwrap();

        let cancelled = p.gateway.cancel(receipt.core_job_id, &ctx).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert_eq!(cancelled.message, "Cancelled by ops");

        let worker = processor(&p, connection_test_registry(), RetryPolicy::default());
        let outcome = worker.process(next_delivery(&p.queue).await, &StopFlag::never()).await;
        assert_eq!(outcome, DeliveryOutcome::Skipped);

        let record = p.store.get(receipt.core_job_id).await.unwrap();
        assert_eq!(record.status, JobStatus::Cancelled);
        assert_eq!(record.attempts, 0);
        assert_eq!(p.queue.depth().await.unwrap(), QueueDepth::default());

        // Terminal jobs cannot be cancelled again.
        let err = p.gateway.cancel(receipt.core_job_id, &ctx).await.unwrap_err();
        assert!(matches!(err, IngestionError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn poison_message_is_acknowledged() {
        let p = pipeline();
        p.queue
            .enqueue(QueueMessage {
                job_id: JobId::new(404),
                job_type: JobType::ConnectionTest,
                reference_id: "GHOST".into(),
                correlation_id: CorrelationId::new(),
                enqueued_at: Utc::now(),
            })
            .await
            .unwrap();

        let worker = processor(&p, connection_test_registry(), RetryPolicy::default());
        let outcome = worker.process(next_delivery(&p.queue).await, &StopFlag::never()).await;
        assert_eq!(outcome, DeliveryOutcome::Skipped);
        assert_eq!(p.queue.depth().await.unwrap(), QueueDepth::default());
    }

    #[tokio::test]
    async fn superseded_attempt_result_is_discarded() {
        let p = pipeline();
        let receipt = p
            .gateway
            .submit_connection_test("STALE-1", None, &SubmissionContext::default())
            .await
            .unwrap();

        // A slow handler whose delivery gets taken over by a newer attempt.
        struct Overtaken(Arc<InMemoryJobStore>);

        #[async_trait::async_trait]
        impl JobHandler for Overtaken {
            async fn handle(&self, ctx: &JobContext) -> Result<String, TaskError> {
                self.0
                    .begin_attempt(ctx.job_id)
                    .await
                    .map_err(|e| TaskError::transient(e.to_string()))?;
                Ok("late result".to_string())
            }
        }

        let registry = HandlerRegistry::new().register(JobType::ConnectionTest, Arc::new(Overtaken(p.store.clone())));
        let worker = processor(&p, registry, RetryPolicy::default());
        let outcome = worker.process(next_delivery(&p.queue).await, &StopFlag::never()).await;
        assert_eq!(outcome, DeliveryOutcome::Stale);

        let record = p.store.get(receipt.core_job_id).await.unwrap();
        assert_eq!(record.status, JobStatus::Processing);
        assert_eq!(record.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn handler_outliving_visibility_timeout_runs_once() {
        let p = pipeline();
        let handler = Arc::new(SlowHandler {
            calls: AtomicU32::new(0),
            duration: Duration::from_secs(100),
        });
        let registry = HandlerRegistry::new().register(JobType::ConnectionTest, handler.clone());
        let config = WorkerConfig {
            poll_wait: Duration::from_secs(1),
            ..WorkerConfig::default()
        }
        .with_name("slow-pool")
        .with_concurrency(4);
        let pool = WorkerPool::new(p.store.clone(), p.queue.clone(), registry, config).spawn();

        let receipt = p
            .gateway
            .submit_connection_test("SLOW-1", None, &SubmissionContext::default())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(300)).await;

        let record = p.store.get(receipt.core_job_id).await.unwrap();
        assert_eq!(record.status, JobStatus::Completed, "{}", record.message);
        assert_eq!(record.message, "slow job done");
        assert_eq!(record.attempts, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().stale, 0);
        assert_eq!(p.queue.depth().await.unwrap(), QueueDepth::default());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn worker_pool_drains_queue_and_query_sees_results() {
        let p = pipeline();
        let ctx = SubmissionContext::default();
        for i in 0..5 {
            p.gateway
                .submit_connection_test(&format!("POOL-{i}"), None, &ctx)
                .await
                .unwrap();
        }
        p.gateway.submit_file_import(&ctx).await.unwrap();

        let registry = HandlerRegistry::with_defaults(
            &HandlersConfig {
                connection_test_delay: Duration::ZERO,
                ..Default::default()
            },
            Arc::new(SecurityCatalog::default()),
        );
        let config = WorkerConfig {
            poll_wait: Duration::from_millis(20),
            ..WorkerConfig::default()
        }
        .with_name("test-pool")
        .with_concurrency(3);
        let handle = WorkerPool::new(p.store.clone(), p.queue.clone(), registry, config).spawn();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let stats = p.store.stats().await.unwrap();
            if stats.completed == 6 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "pool did not drain: {stats:?}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handle.stats().completed, 6);
        handle.shutdown().await;

        let queries = QueryService::new(p.store.clone(), PaginationConfig::default());
        let page = queries
            .list(ListParams {
                status: Some("Completed".into()),
                job_type: Some("ConnectionTest".into()),
                sort_direction: Some("desc".into()),
                limit: Some("2".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total_count, 5);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].reference_id, "POOL-4");
        assert_eq!(page.items[1].reference_id, "POOL-3");
    }
}
