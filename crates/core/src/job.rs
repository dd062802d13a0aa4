//! Job record, job kinds and the status state machine.
//!
//! ```text
//! Pending ──► Queued ──► Processing ──► Completed
//!    │          │            │  ▲
//!    │          │            │  └── redelivery (begin_attempt)
//!    │          │            └────► Failed
//!    └──────────┴──► Cancelled
//! ```
//!
//! Everything else is an [`DomainError::InvalidTransition`]. Terminal records
//! never change again.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult, FieldError};
use crate::id::JobId;

/// Maximum length of a caller-supplied reference id.
pub const REFERENCE_ID_MAX_LEN: usize = 50;

/// Maximum length of a job description.
pub const DESCRIPTION_MAX_LEN: usize = 255;

/// Job kind, used to route a job to its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JobType {
    /// API → queue → worker round trip check.
    ConnectionTest,
    /// Instruction file import (B3 instruments).
    FileImport,
}

impl JobType {
    pub const ALL: [JobType; 2] = [JobType::ConnectionTest, JobType::FileImport];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::ConnectionTest => "ConnectionTest",
            JobType::FileImport => "FileImport",
        }
    }
}

impl core::fmt::Display for JobType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim();
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(needle))
            .ok_or_else(|| DomainError::validation("jobType", format!("unknown job type '{needle}'")))
    }
}

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JobStatus {
    /// Record written, not yet handed to the queue
    Pending,
    /// Message enqueued, waiting for a worker
    Queued,
    /// Owned by a worker
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "Pending",
            JobStatus::Queued => "Queued",
            JobStatus::Processing => "Processing",
            JobStatus::Completed => "Completed",
            JobStatus::Failed => "Failed",
            JobStatus::Cancelled => "Cancelled",
        }
    }

    /// Stable numeric code (persisted column value; also accepted by filters).
    pub fn code(&self) -> i16 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Queued => 1,
            JobStatus::Processing => 2,
            JobStatus::Completed => 3,
            JobStatus::Failed => 4,
            JobStatus::Cancelled => 5,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        JobStatus::ALL.into_iter().find(|s| s.code() == code)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether `self -> next` is an edge of the state machine.
    ///
    /// Redelivery (`Processing -> Processing`) is not an edge; it goes
    /// through [`JobRecord::begin_attempt`].
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Queued)
                | (JobStatus::Queued, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
                | (JobStatus::Pending, JobStatus::Cancelled)
                | (JobStatus::Queued, JobStatus::Cancelled)
        )
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    /// Accepts a status name (case-insensitive) or its numeric code.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim();
        if let Ok(code) = needle.parse::<i16>() {
            return JobStatus::from_code(code)
                .ok_or_else(|| DomainError::validation("status", format!("unknown status code {code}")));
        }
        JobStatus::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(needle))
            .ok_or_else(|| DomainError::validation("status", format!("unknown status '{needle}'")))
    }
}

/// Payload of a connection test job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionTestPayload {
    pub description: String,
}

/// A job type together with its payload schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "jobType", content = "payload")]
pub enum JobSpec {
    ConnectionTest(ConnectionTestPayload),
    /// Parameterless: the instrument source is worker configuration.
    FileImport,
}

impl JobSpec {
    pub fn job_type(&self) -> JobType {
        match self {
            JobSpec::ConnectionTest(_) => JobType::ConnectionTest,
            JobSpec::FileImport => JobType::FileImport,
        }
    }

    /// Opaque payload as stored on the record.
    pub fn payload(&self) -> Option<serde_json::Value> {
        match self {
            JobSpec::ConnectionTest(p) => serde_json::to_value(p).ok(),
            JobSpec::FileImport => None,
        }
    }
}

/// A validated submission, ready to be written by a store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub reference_id: String,
    pub job_type: JobType,
    pub payload: Option<serde_json::Value>,
    pub description: String,
}

impl NewJob {
    /// Validate and normalise (trim) a submission.
    ///
    /// Collects every offending field instead of stopping at the first.
    pub fn new(spec: &JobSpec, reference_id: &str, description: &str) -> DomainResult<Self> {
        let mut errors = Vec::new();

        let reference_id = reference_id.trim();
        if reference_id.is_empty() {
            errors.push(FieldError::new("referenceId", "must not be empty"));
        } else if reference_id.chars().count() > REFERENCE_ID_MAX_LEN {
            errors.push(FieldError::new(
                "referenceId",
                format!("must not exceed {REFERENCE_ID_MAX_LEN} characters"),
            ));
        }

        let description = description.trim();
        if description.is_empty() {
            errors.push(FieldError::new("jobDescription", "must not be empty"));
        } else if description.chars().count() > DESCRIPTION_MAX_LEN {
            errors.push(FieldError::new(
                "jobDescription",
                format!("must not exceed {DESCRIPTION_MAX_LEN} characters"),
            ));
        }

        if !errors.is_empty() {
            return Err(DomainError::Validation(errors));
        }

        Ok(Self {
            reference_id: reference_id.to_string(),
            job_type: spec.job_type(),
            payload: spec.payload(),
            description: description.to_string(),
        })
    }
}

/// Requested status change, optionally fenced to the attempt that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: JobStatus,
    pub message: String,
    /// When set, the update only applies if the record is still on this attempt.
    pub expected_attempt: Option<u32>,
}

impl StatusUpdate {
    pub fn new(status: JobStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            expected_attempt: None,
        }
    }

    pub fn for_attempt(mut self, attempt: u32) -> Self {
        self.expected_attempt = Some(attempt);
        self
    }
}

/// Durable state of one submitted unit of asynchronous work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: JobId,
    pub reference_id: String,
    pub job_type: JobType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(rename = "jobDescription")]
    pub description: String,
    pub status: JobStatus,
    pub message: String,
    pub attempts: u32,
    #[serde(rename = "creationDate")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "lastUpdatedDate")]
    pub updated_at: DateTime<Utc>,
    #[serde(rename = "startedDate")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(rename = "finishedDate")]
    pub finished_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl JobRecord {
    /// Create a fresh `Pending` record.
    pub fn new(id: JobId, job: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id,
            reference_id: job.reference_id,
            job_type: job.job_type,
            payload: job.payload,
            description: job.description,
            status: JobStatus::Pending,
            message: "Job created".to_string(),
            attempts: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            version: 1,
        }
    }

    /// Apply a state machine edge.
    pub fn transition(
        &mut self,
        next: JobStatus,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::invalid_transition(self.status, next));
        }
        self.status = next;
        self.message = message.into();
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        self.touch(now);
        Ok(())
    }

    /// Claim the job for a new execution attempt.
    ///
    /// `Queued -> Processing` on first delivery, `Processing -> Processing`
    /// when the queue redelivers after a crash or a transient failure.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        match self.status {
            JobStatus::Queued | JobStatus::Processing => {}
            other => return Err(DomainError::invalid_transition(other, JobStatus::Processing)),
        }
        self.status = JobStatus::Processing;
        self.attempts += 1;
        self.message = format!("Attempt {} started", self.attempts);
        self.started_at.get_or_insert(now);
        self.touch(now);
        Ok(())
    }

    /// Fail a record whose work message never reached the queue.
    ///
    /// Only valid before any execution attempt (`Pending`/`Queued`,
    /// `attempts == 0`), so nothing a worker did can be overwritten.
    pub fn fail_undelivered(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> DomainResult<()> {
        let deliverable = matches!(self.status, JobStatus::Pending | JobStatus::Queued);
        if !deliverable || self.attempts > 0 {
            return Err(DomainError::invalid_transition(self.status, JobStatus::Failed));
        }
        self.status = JobStatus::Failed;
        self.message = reason.into();
        self.finished_at = Some(now);
        self.touch(now);
        Ok(())
    }

    /// Whether a submission with the same reference id should resolve to this record.
    pub fn blocks_resubmission(&self, window: chrono::Duration, now: DateTime<Utc>) -> bool {
        if !self.status.is_terminal() {
            return true;
        }
        let finished = self.finished_at.unwrap_or(self.updated_at);
        now - finished < window
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
        self.version += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn record() -> JobRecord {
        let spec = JobSpec::ConnectionTest(ConnectionTestPayload {
            description: "ping".to_string(),
        });
        let job = NewJob::new(&spec, "TEST-1", "ping").unwrap();
        JobRecord::new(JobId::new(1), job, Utc::now())
    }

    fn status_strategy() -> impl Strategy<Value = JobStatus> {
        prop::sample::select(JobStatus::ALL.to_vec())
    }

    #[test]
    fn happy_path_lifecycle() {
        let mut job = record();
        let now = Utc::now();

        job.transition(JobStatus::Queued, "queued", now).unwrap();
        job.begin_attempt(now).unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.attempts, 1);
        assert!(job.started_at.is_some());

        job.transition(JobStatus::Completed, "done", now).unwrap();
        assert!(job.status.is_terminal());
        assert!(job.finished_at.is_some());
        assert_eq!(job.version, 4);
    }

    #[test]
    fn redelivery_reclaims_processing_job() {
        let mut job = record();
        let now = Utc::now();
        job.transition(JobStatus::Queued, "queued", now).unwrap();
        job.begin_attempt(now).unwrap();
        let first_start = job.started_at;

        job.begin_attempt(now + chrono::Duration::seconds(5)).unwrap();
        assert_eq!(job.attempts, 2);
        assert_eq!(job.started_at, first_start);
    }

    #[test]
    fn begin_attempt_rejects_terminal_and_pending() {
        let mut job = record();
        assert!(job.begin_attempt(Utc::now()).is_err());

        job.transition(JobStatus::Cancelled, "cancelled", Utc::now()).unwrap();
        let err = job.begin_attempt(Utc::now()).unwrap_err();
        assert_eq!(
            err,
            DomainError::invalid_transition(JobStatus::Cancelled, JobStatus::Processing)
        );
    }

    #[test]
    fn fail_undelivered_only_before_first_attempt() {
        let mut job = record();
        job.transition(JobStatus::Queued, "queued", Utc::now()).unwrap();
        job.fail_undelivered("enqueue failed", Utc::now()).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.message, "enqueue failed");

        let mut job = record();
        job.transition(JobStatus::Queued, "queued", Utc::now()).unwrap();
        job.begin_attempt(Utc::now()).unwrap();
        assert!(job.fail_undelivered("enqueue failed", Utc::now()).is_err());
    }

    #[test]
    fn validation_collects_all_fields() {
        let err = NewJob::new(&JobSpec::FileImport, "   ", &"x".repeat(300)).unwrap_err();
        let fields: Vec<_> = err.fields().iter().map(|f| f.field).collect();
        assert_eq!(fields, vec!["referenceId", "jobDescription"]);
    }

    #[test]
    fn validation_trims_inputs() {
        let job = NewJob::new(&JobSpec::FileImport, "  REF-9 ", " import ").unwrap();
        assert_eq!(job.reference_id, "REF-9");
        assert_eq!(job.description, "import");
        assert_eq!(job.job_type, JobType::FileImport);
        assert!(job.payload.is_none());
    }

    #[test]
    fn status_parses_names_and_codes() {
        assert_eq!("queued".parse::<JobStatus>().unwrap(), JobStatus::Queued);
        assert_eq!("3".parse::<JobStatus>().unwrap(), JobStatus::Completed);
        assert!("9".parse::<JobStatus>().is_err());
        assert!("running".parse::<JobStatus>().is_err());
    }

    #[test]
    fn resubmission_window() {
        let mut job = record();
        let now = Utc::now();
        let window = chrono::Duration::minutes(5);
        assert!(job.blocks_resubmission(window, now));

        job.transition(JobStatus::Cancelled, "cancelled", now).unwrap();
        assert!(job.blocks_resubmission(window, now + chrono::Duration::minutes(1)));
        assert!(!job.blocks_resubmission(window, now + chrono::Duration::minutes(6)));
        assert!(!job.blocks_resubmission(chrono::Duration::zero(), now));
    }

    #[test]
    fn record_serializes_with_wire_names() {
        let job = record();
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["referenceId"], "TEST-1");
        assert_eq!(json["jobType"], "ConnectionTest");
        assert_eq!(json["status"], "Pending");
        assert!(json.get("creationDate").is_some());
        assert!(json.get("lastUpdatedDate").is_some());
    }

    proptest! {
        #[test]
        fn only_listed_edges_are_legal(from in status_strategy(), to in status_strategy()) {
            let legal = [
                (JobStatus::Pending, JobStatus::Queued),
                (JobStatus::Queued, JobStatus::Processing),
                (JobStatus::Processing, JobStatus::Completed),
                (JobStatus::Processing, JobStatus::Failed),
                (JobStatus::Pending, JobStatus::Cancelled),
                (JobStatus::Queued, JobStatus::Cancelled),
            ];
            prop_assert_eq!(from.can_transition_to(to), legal.contains(&(from, to)));
        }

        #[test]
        fn terminal_states_never_move(to in status_strategy()) {
            for from in JobStatus::ALL.into_iter().filter(JobStatus::is_terminal) {
                prop_assert!(!from.can_transition_to(to));
            }
        }

        #[test]
        fn status_code_round_trips(status in status_strategy()) {
            prop_assert_eq!(JobStatus::from_code(status.code()), Some(status));
        }
    }
}
