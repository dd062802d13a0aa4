//! Job handlers: the per-job-type work the pool executes.
//!
//! Handlers run under at-least-once delivery and must be idempotent: a job
//! may be handed to a handler again after a crash or a transient failure.

pub mod file_import;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;

use corejobs_core::{CorrelationId, JobId, JobRecord, JobType};

use crate::config::HandlersConfig;

pub use connection_test::ConnectionTestHandler;
pub use file_import::{
    CsvInstrumentSource, FileImportHandler, ImportCheckpoints, Instrument, InstrumentFile,
    InstrumentSource, SecurityCatalog, StaticInstrumentSource,
};

/// Handler failure classification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// Worth retrying (I/O hiccup, dependency unavailable, interrupted).
    #[error("transient: {0}")]
    Transient(String),
    /// Retrying cannot help (bad payload, missing input).
    #[error("permanent: {0}")]
    Permanent(String),
}

impl TaskError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn message(&self) -> &str {
        match self {
            TaskError::Transient(m) | TaskError::Permanent(m) => m,
        }
    }
}

/// Cooperative stop signal handed to handlers.
#[derive(Debug, Clone)]
pub struct StopFlag(Option<watch::Receiver<bool>>);

impl StopFlag {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self(Some(rx))
    }

    /// A flag that is never raised.
    pub fn never() -> Self {
        Self(None)
    }

    pub fn is_raised(&self) -> bool {
        self.0.as_ref().is_some_and(|rx| *rx.borrow())
    }
}

/// Everything a handler knows about the job it is running.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub reference_id: String,
    pub job_type: JobType,
    /// 1-based execution attempt.
    pub attempt: u32,
    pub payload: Option<serde_json::Value>,
    pub correlation_id: CorrelationId,
    pub stop: StopFlag,
}

impl JobContext {
    pub fn from_record(record: &JobRecord, correlation_id: CorrelationId, stop: StopFlag) -> Self {
        Self {
            job_id: record.id,
            reference_id: record.reference_id.clone(),
            job_type: record.job_type,
            attempt: record.attempts,
            payload: record.payload.clone(),
            correlation_id,
            stop,
        }
    }

    /// Deserialize the payload, failing permanently when it is absent or malformed.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, TaskError> {
        let value = self
            .payload
            .clone()
            .ok_or_else(|| TaskError::permanent("job has no payload"))?;
        serde_json::from_value(value).map_err(|e| TaskError::permanent(format!("invalid payload: {e}")))
    }
}

/// Executes one job type. Returns a success summary for the job message.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: &JobContext) -> Result<String, TaskError>;
}

/// `JobType` → handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in handlers wired from configuration.
    pub fn with_defaults(config: &HandlersConfig, catalog: Arc<SecurityCatalog>) -> Self {
        let source: Arc<dyn InstrumentSource> = match &config.import_file {
            Some(path) => Arc::new(CsvInstrumentSource::new(path.clone())),
            None => Arc::new(StaticInstrumentSource::default()),
        };
        Self::new()
            .register(
                JobType::ConnectionTest,
                Arc::new(ConnectionTestHandler::new(config.connection_test_delay)),
            )
            .register(
                JobType::FileImport,
                Arc::new(FileImportHandler::new(
                    source,
                    catalog,
                    Arc::new(ImportCheckpoints::default()),
                    config.import_batch_size,
                )),
            )
    }

    pub fn register(mut self, job_type: JobType, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(job_type, handler);
        self
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&job_type).cloned()
    }

    pub fn job_types(&self) -> Vec<JobType> {
        let mut types: Vec<_> = self.handlers.keys().copied().collect();
        types.sort();
        types
    }
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_job_type() {
        let registry = HandlerRegistry::with_defaults(
            &HandlersConfig::default(),
            Arc::new(SecurityCatalog::default()),
        );
        assert_eq!(registry.job_types(), JobType::ALL.to_vec());
    }

    #[test]
    fn stop_flag_follows_the_channel() {
        let (tx, rx) = watch::channel(false);
        let flag = StopFlag::new(rx);
        assert!(!flag.is_raised());
        tx.send(true).unwrap();
        assert!(flag.is_raised());
        assert!(!StopFlag::never().is_raised());
    }
}
