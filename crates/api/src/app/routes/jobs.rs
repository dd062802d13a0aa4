use std::sync::Arc;

use axum::{
    extract::{rejection::QueryRejection, Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use corejobs_core::JobId;
use corejobs_infra::query::ListParams;
use corejobs_infra::queue::JobQueue;
use corejobs_infra::store::JobStore;

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::RequestContext;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_jobs))
        .route("/stats", get(job_stats))
        .route("/:id", get(get_job))
        .route("/:id/cancel", post(cancel_job))
}

pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> axum::response::Response {
    let Query(params) = match params {
        Ok(p) => p,
        Err(rejection) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_query", rejection.body_text());
        }
    };

    match services.queries.list(params).await {
        Ok(page) => (StatusCode::OK, Json(page)).into_response(),
        Err(e) => errors::query_error_to_response(e),
    }
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: JobId = match id.parse() {
        Ok(v) => v,
        Err(e) => return errors::validation_error(&e),
    };

    match services.queries.get(id).await {
        Ok(record) => (StatusCode::OK, Json(record)).into_response(),
        Err(e) => errors::query_error_to_response(e),
    }
}

pub async fn cancel_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: JobId = match id.parse() {
        Ok(v) => v,
        Err(e) => return errors::validation_error(&e),
    };

    match services.gateway.cancel(id, &ctx.submission()).await {
        Ok(record) => (StatusCode::OK, Json(record)).into_response(),
        Err(e) => errors::ingestion_error_to_response(e),
    }
}

pub async fn job_stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    let jobs = match services.store.stats().await {
        Ok(s) => s,
        Err(e) => return errors::store_error_to_response(e),
    };
    let queue = match services.queue.depth().await {
        Ok(d) => d,
        Err(e) => return errors::queue_error_to_response(e),
    };

    (StatusCode::OK, Json(dto::StatsResponse { jobs, queue })).into_response()
}
