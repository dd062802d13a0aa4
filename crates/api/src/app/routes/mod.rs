use axum::Router;

pub mod ingestion;
pub mod jobs;
pub mod system;

/// Router for everything under `/api`.
pub fn router() -> Router {
    Router::new()
        .nest("/jobs-ingestion", ingestion::router())
        .nest("/corejobs", jobs::router())
}
