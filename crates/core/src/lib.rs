//! `corejobs-core`: job pipeline domain building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the job record and its status state machine, and submission
//! validation.

pub mod error;
pub mod id;
pub mod job;

pub use error::{DomainError, DomainResult, FieldError};
pub use id::{CorrelationId, JobId};
pub use job::{
    ConnectionTestPayload, JobRecord, JobSpec, JobStatus, JobType, NewJob, StatusUpdate,
    DESCRIPTION_MAX_LEN, REFERENCE_ID_MAX_LEN,
};
