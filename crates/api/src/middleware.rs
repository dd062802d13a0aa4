use axum::{
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use corejobs_core::CorrelationId;

use crate::context::RequestContext;

pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";
pub const USER_ID_HEADER: &str = "x-user-id";

const ANONYMOUS: &str = "anonymous";

/// Attach a [`RequestContext`] to the request and echo the correlation id
/// on the response.
///
/// A missing or malformed `X-Correlation-ID` gets a fresh id; `X-User-Id`
/// stands in for an authenticated caller.
pub async fn request_context_middleware(
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let correlation_id = extract_correlation_id(req.headers());
    let caller = extract_caller(req.headers());

    req.extensions_mut()
        .insert(RequestContext::new(correlation_id, caller));

    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&correlation_id.to_string()) {
        response.headers_mut().insert(CORRELATION_ID_HEADER, value);
    }
    response
}

fn extract_correlation_id(headers: &HeaderMap) -> CorrelationId {
    headers
        .get(CORRELATION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v.trim()).ok())
        .map(CorrelationId::from_uuid)
        .unwrap_or_default()
}

fn extract_caller(headers: &HeaderMap) -> String {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(ANONYMOUS)
        .to_string()
}
