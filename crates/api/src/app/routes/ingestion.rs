use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::RequestContext;

pub fn router() -> Router {
    Router::new()
        .route("/test-connection", post(test_connection))
        .route("/import-b3-instruction-file", post(import_b3_instruction_file))
}

pub async fn test_connection(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    body: Result<Json<dto::TestConnectionRequest>, JsonRejection>,
) -> axum::response::Response {
    let body = match body {
        Ok(Json(body)) => body,
        Err(rejection) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_body", rejection.body_text());
        }
    };

    let reference_id = body.reference_id.as_deref().unwrap_or_default();
    match services
        .gateway
        .submit_connection_test(reference_id, body.job_description.as_deref(), &ctx.submission())
        .await
    {
        Ok(receipt) => (StatusCode::ACCEPTED, Json(receipt)).into_response(),
        Err(e) => errors::ingestion_error_to_response(e),
    }
}

pub async fn import_b3_instruction_file(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
) -> axum::response::Response {
    match services.gateway.submit_file_import(&ctx.submission()).await {
        Ok(receipt) => (StatusCode::ACCEPTED, Json(receipt)).into_response(),
        Err(e) => errors::ingestion_error_to_response(e),
    }
}
