use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use corejobs_core::DomainError;
use corejobs_infra::ingestion::IngestionError;
use corejobs_infra::query::QueryError;
use corejobs_infra::queue::QueueError;
use corejobs_infra::store::JobStoreError;

pub fn ingestion_error_to_response(err: IngestionError) -> axum::response::Response {
    match err {
        IngestionError::Validation(e) => validation_error(&e),
        IngestionError::QueueUnavailable { job_id, reason } => {
            tracing::error!(job_id = %job_id, reason = %reason, "submission rejected: queue unavailable");
            json_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "queue_unavailable",
                format!("job {job_id} could not be queued and was marked failed"),
            )
        }
        IngestionError::NotFound(id) => json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found")),
        IngestionError::InvalidTransition(e) => json_error(StatusCode::CONFLICT, "invalid_transition", e.to_string()),
        IngestionError::Store(e) => store_error_to_response(e),
    }
}

pub fn query_error_to_response(err: QueryError) -> axum::response::Response {
    match err {
        QueryError::Validation(e) => validation_error(&e),
        QueryError::InvalidSortField { .. } => {
            json_error(StatusCode::BAD_REQUEST, "invalid_sort_field", err.to_string())
        }
        QueryError::NotFound(id) => json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found")),
        QueryError::Store(e) => store_error_to_response(e),
    }
}

pub fn store_error_to_response(err: JobStoreError) -> axum::response::Response {
    match err {
        JobStoreError::NotFound(id) => json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found")),
        JobStoreError::InvalidTransition(e) => json_error(StatusCode::CONFLICT, "invalid_transition", e.to_string()),
        other => {
            tracing::error!(error = %other, "job store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", other.to_string())
        }
    }
}

pub fn queue_error_to_response(err: QueueError) -> axum::response::Response {
    tracing::error!(error = %err, "queue failure");
    json_error(StatusCode::SERVICE_UNAVAILABLE, "queue_unavailable", err.to_string())
}

/// 400 with the offending fields listed.
pub fn validation_error(err: &DomainError) -> axum::response::Response {
    if let DomainError::InvalidId(msg) = err {
        return json_error(StatusCode::BAD_REQUEST, "invalid_id", msg.clone());
    }
    (
        StatusCode::BAD_REQUEST,
        axum::Json(json!({
            "error": "validation_error",
            "message": err.to_string(),
            "fields": err.fields(),
        })),
    )
        .into_response()
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
