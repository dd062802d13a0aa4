//! Ingestion gateway: accepts submissions, persists them and hands them to
//! the queue without waiting for execution.
//!
//! Submission order is `create (Pending) -> Queued -> enqueue`. The record is
//! `Queued` before the message exists, so a worker can never observe a
//! `Pending` job. If anything fails after the record exists, it is marked
//! `Failed` with "enqueue failed" so it neither blocks its reference id nor
//! waits forever for a message. An enqueue failure reaches the caller as
//! [`IngestionError::QueueUnavailable`], a store failure as the store error.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use corejobs_core::{
    ConnectionTestPayload, CorrelationId, DomainError, JobId, JobRecord, JobSpec, JobStatus,
    NewJob, StatusUpdate,
};

use crate::queue::{JobQueue, QueueError, QueueMessage};
use crate::store::{CreateOutcome, JobStore, JobStoreError};

pub const DEFAULT_CONNECTION_TEST_DESCRIPTION: &str = "Test connection job";

const ENQUEUE_FAILED: &str = "enqueue failed";

/// Who submitted, and the request's correlation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionContext {
    pub correlation_id: CorrelationId,
    pub caller: String,
}

impl Default for SubmissionContext {
    fn default() -> Self {
        Self {
            correlation_id: CorrelationId::new(),
            caller: "anonymous".to_string(),
        }
    }
}

/// What the caller gets back from a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionReceipt {
    pub core_job_id: JobId,
    pub reference_id: String,
    pub status: JobStatus,
    pub message: String,
    /// The reference id resolved to an already active job.
    pub duplicate: bool,
    pub correlation_id: CorrelationId,
}

#[derive(Debug, thiserror::Error)]
pub enum IngestionError {
    #[error(transparent)]
    Validation(DomainError),
    #[error("queue unavailable for job {job_id}: {reason}")]
    QueueUnavailable { job_id: JobId, reason: String },
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error(transparent)]
    InvalidTransition(DomainError),
    #[error(transparent)]
    Store(JobStoreError),
}

impl From<JobStoreError> for IngestionError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::NotFound(id) => IngestionError::NotFound(id),
            JobStoreError::InvalidTransition(e) => IngestionError::InvalidTransition(e),
            other => IngestionError::Store(other),
        }
    }
}

#[derive(Clone)]
pub struct IngestionGateway {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
}

impl IngestionGateway {
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<dyn JobQueue>) -> Self {
        Self { store, queue }
    }

    /// Submit a connection test job.
    pub async fn submit_connection_test(
        &self,
        reference_id: &str,
        description: Option<&str>,
        ctx: &SubmissionContext,
    ) -> Result<SubmissionReceipt, IngestionError> {
        let description = description
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .unwrap_or(DEFAULT_CONNECTION_TEST_DESCRIPTION);
        let spec = JobSpec::ConnectionTest(ConnectionTestPayload {
            description: description.to_string(),
        });
        self.submit(spec, reference_id, description, ctx).await
    }

    /// Submit a B3 instruction file import with a generated reference id.
    pub async fn submit_file_import(&self, ctx: &SubmissionContext) -> Result<SubmissionReceipt, IngestionError> {
        let now = Utc::now();
        self.submit(
            JobSpec::FileImport,
            &file_import_reference(now),
            &file_import_description(now),
            ctx,
        )
        .await
    }

    #[instrument(
        skip(self, spec, description, ctx),
        fields(
            job_type = %spec.job_type(),
            reference_id = %reference_id,
            correlation_id = %ctx.correlation_id,
            caller = %ctx.caller
        ),
        err
    )]
    pub async fn submit(
        &self,
        spec: JobSpec,
        reference_id: &str,
        description: &str,
        ctx: &SubmissionContext,
    ) -> Result<SubmissionReceipt, IngestionError> {
        let job = NewJob::new(&spec, reference_id, description).map_err(IngestionError::Validation)?;

        let record = match self.store.create(job).await? {
            CreateOutcome::Existing(existing) => {
                info!(job_id = %existing.id, status = %existing.status, "duplicate reference id; returning existing job");
                return Ok(receipt(&existing, true, "Job with this reference id already submitted", ctx));
            }
            CreateOutcome::Created(record) => record,
        };

        let queued = StatusUpdate::new(JobStatus::Queued, "Job queued for processing");
        let record = match self.store.update_status(record.id, queued).await {
            Ok(record) => record,
            Err(e) => {
                error!(job_id = %record.id, error = %e, "could not queue new job; marking job failed");
                self.mark_undelivered(record.id).await;
                return Err(e.into());
            }
        };

        let message = QueueMessage {
            job_id: record.id,
            job_type: record.job_type,
            reference_id: record.reference_id.clone(),
            correlation_id: ctx.correlation_id,
            enqueued_at: Utc::now(),
        };
        if let Err(e) = self.queue.enqueue(message).await {
            return Err(self.undelivered(&record, e).await);
        }

        info!(job_id = %record.id, "job accepted");
        Ok(receipt(&record, false, accepted_message(&spec), ctx))
    }

    /// Cancel a job that has not started yet.
    #[instrument(skip(self, ctx), fields(job_id = %id, caller = %ctx.caller), err)]
    pub async fn cancel(&self, id: JobId, ctx: &SubmissionContext) -> Result<JobRecord, IngestionError> {
        let update = StatusUpdate::new(JobStatus::Cancelled, format!("Cancelled by {}", ctx.caller));
        match self.store.update_status(id, update).await {
            Ok(record) => Ok(record),
            Err(JobStoreError::InvalidTransition(e)) => {
                warn!(reason = %e, "cancel rejected");
                Err(IngestionError::InvalidTransition(e))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn undelivered(&self, record: &JobRecord, cause: QueueError) -> IngestionError {
        error!(job_id = %record.id, error = %cause, "enqueue failed; marking job failed");
        self.mark_undelivered(record.id).await;
        IngestionError::QueueUnavailable {
            job_id: record.id,
            reason: cause.to_string(),
        }
    }

    async fn mark_undelivered(&self, id: JobId) {
        if let Err(e) = self.store.fail_undelivered(id, ENQUEUE_FAILED).await {
            error!(job_id = %id, error = %e, "could not mark undelivered job as failed");
        }
    }
}

fn receipt(record: &JobRecord, duplicate: bool, message: &str, ctx: &SubmissionContext) -> SubmissionReceipt {
    SubmissionReceipt {
        core_job_id: record.id,
        reference_id: record.reference_id.clone(),
        status: record.status,
        message: message.to_string(),
        duplicate,
        correlation_id: ctx.correlation_id,
    }
}

fn accepted_message(spec: &JobSpec) -> &'static str {
    match spec {
        JobSpec::ConnectionTest(_) => {
            "Test connection job has been queued successfully. Check worker logs to verify message processing."
        }
        JobSpec::FileImport => "B3 instruction file import job has been queued successfully",
    }
}

/// `CJB3-<yyyyMMddHHmmss>-<6 hex>`.
pub fn file_import_reference(now: DateTime<Utc>) -> String {
    let random = Uuid::now_v7().simple().to_string();
    // The tail of a v7 uuid is random; the head is the timestamp.
    let suffix = &random[random.len() - 6..];
    format!("CJB3-{}-{}", now.format("%Y%m%d%H%M%S"), suffix)
}

pub fn file_import_description(now: DateTime<Utc>) -> String {
    format!("B3 import initialization started at {} UTC", now.format("%Y-%m-%d %H:%M:%S"))
}
