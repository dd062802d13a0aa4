use serde::{Deserialize, Serialize};

use corejobs_infra::queue::QueueDepth;
use corejobs_infra::store::JobStats;

// -------------------------
// Request DTOs
// -------------------------

/// Body of `POST /api/jobs-ingestion/test-connection`.
///
/// Fields are optional here so that missing values come back as field
/// validation errors rather than a body rejection.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestConnectionRequest {
    pub reference_id: Option<String>,
    pub job_description: Option<String>,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub jobs: JobStats,
    pub queue: QueueDepth,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}
