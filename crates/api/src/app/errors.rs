use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use pricekeep_infra::EnqueueError;
use pricekeep_infra::jobs::JobStoreError;
use pricekeep_infra::progress::ProgressStoreError;

pub fn enqueue_error_to_response(err: EnqueueError) -> Response {
    match err {
        EnqueueError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        EnqueueError::QueueUnavailable(msg) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "queue_unavailable", msg)
        }
    }
}

pub fn store_error_to_response(err: JobStoreError) -> Response {
    match err {
        JobStoreError::NotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found"))
        }
        other => json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", other.to_string()),
    }
}

pub fn progress_error_to_response(err: ProgressStoreError) -> Response {
    json_error(StatusCode::SERVICE_UNAVAILABLE, "progress_unavailable", err.to_string())
}

pub fn bad_request(message: impl Into<String>) -> Response {
    json_error(StatusCode::BAD_REQUEST, "validation_error", message)
}

pub fn not_found(message: impl Into<String>) -> Response {
    json_error(StatusCode::NOT_FOUND, "not_found", message)
}

pub fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
