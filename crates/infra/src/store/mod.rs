//! Job record store.
//!
//! The store is the source of truth for job state. Every mutation goes
//! through the record's state machine, bumps `lastUpdatedDate` and `version`,
//! and is atomic per record.

pub mod in_memory;
pub mod postgres;

use std::time::Duration;

use serde::Serialize;

use corejobs_core::{DomainError, JobId, JobRecord, JobStatus, NewJob, StatusUpdate};

use crate::query::JobQuery;

pub use in_memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;

/// Resubmissions within this window of a terminal job resolve to it.
pub const DEFAULT_DUPLICATE_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Result of [`JobStore::create`].
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    /// A new `Pending` record.
    Created(JobRecord),
    /// An active record with the same reference id already exists.
    Existing(JobRecord),
}

impl CreateOutcome {
    pub fn record(&self) -> &JobRecord {
        match self {
            CreateOutcome::Created(r) | CreateOutcome::Existing(r) => r,
        }
    }

    pub fn into_record(self) -> JobRecord {
        match self {
            CreateOutcome::Created(r) | CreateOutcome::Existing(r) => r,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, CreateOutcome::Existing(_))
    }
}

/// Job counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: u64,
    pub queued: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub total: u64,
}

impl JobStats {
    pub fn add(&mut self, status: JobStatus, count: u64) {
        let slot = match status {
            JobStatus::Pending => &mut self.pending,
            JobStatus::Queued => &mut self.queued,
            JobStatus::Processing => &mut self.processing,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Cancelled => &mut self.cancelled,
        };
        *slot += count;
        self.total += count;
    }
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error(transparent)]
    InvalidTransition(DomainError),
    #[error("stale attempt for job {id}: expected attempt {expected}, record is on attempt {current}")]
    StaleAttempt { id: JobId, expected: u32, current: u32 },
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<DomainError> for JobStoreError {
    fn from(err: DomainError) -> Self {
        JobStoreError::InvalidTransition(err)
    }
}

/// Durable job record storage.
#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    /// Create a `Pending` record, or return the active record already
    /// holding `job.reference_id`.
    async fn create(&self, job: NewJob) -> Result<CreateOutcome, JobStoreError>;

    async fn get(&self, id: JobId) -> Result<JobRecord, JobStoreError>;

    /// Apply a state machine edge, optionally fenced to an attempt number.
    async fn update_status(&self, id: JobId, update: StatusUpdate) -> Result<JobRecord, JobStoreError>;

    /// Claim the job for a new execution attempt (increments `attempts`).
    async fn begin_attempt(&self, id: JobId) -> Result<JobRecord, JobStoreError>;

    /// Mark a job whose message never reached the queue as `Failed`.
    async fn fail_undelivered(&self, id: JobId, reason: &str) -> Result<JobRecord, JobStoreError>;

    /// Matching records for one page plus the total match count.
    async fn list(&self, query: &JobQuery) -> Result<(Vec<JobRecord>, u64), JobStoreError>;

    async fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Reject an update fenced to an attempt the record has moved past.
pub(crate) fn check_fence(record: &JobRecord, update: &StatusUpdate) -> Result<(), JobStoreError> {
    match update.expected_attempt {
        Some(expected) if expected != record.attempts => Err(JobStoreError::StaleAttempt {
            id: record.id,
            expected,
            current: record.attempts,
        }),
        _ => Ok(()),
    }
}

pub(crate) fn chrono_window(window: Duration) -> chrono::Duration {
    chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX)
}
