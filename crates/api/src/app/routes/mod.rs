use axum::{Router, routing::get};

pub mod events;
pub mod jobs;
pub mod progress;
pub mod system;

/// Router for all job endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/progress", get(progress::latest))
        .route("/jobs", get(jobs::list).post(jobs::enqueue))
        .route("/jobs/latest", get(jobs::latest))
        .route("/jobs/events", get(events::stream))
        .route("/jobs/:id", get(jobs::get))
        .route("/jobs/:id/progress", get(progress::by_id))
}

/// Parse a job id path segment.
pub(crate) fn parse_job_id(raw: &str) -> Result<pricekeep_core::JobId, axum::response::Response> {
    raw.parse()
        .map_err(|e: pricekeep_core::DomainError| super::errors::bad_request(e.to_string()))
}
