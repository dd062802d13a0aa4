use corejobs_core::CorrelationId;
use corejobs_infra::ingestion::SubmissionContext;

/// Per-request context (correlation id + caller identity).
///
/// Inserted by [`crate::middleware::request_context_middleware`]; present on
/// every `/api` route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    correlation_id: CorrelationId,
    caller: String,
}

impl RequestContext {
    pub fn new(correlation_id: CorrelationId, caller: impl Into<String>) -> Self {
        Self {
            correlation_id,
            caller: caller.into(),
        }
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn caller(&self) -> &str {
        &self.caller
    }

    pub fn submission(&self) -> SubmissionContext {
        SubmissionContext {
            correlation_id: self.correlation_id,
            caller: self.caller.clone(),
        }
    }
}
