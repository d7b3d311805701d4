use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use tracing::debug;

use pricekeep_infra::jobs::JobRecordStore;
use pricekeep_infra::progress::ProgressStore;

use crate::app::dto::{ProgressView, snapshot_from_record};
use crate::app::errors::{not_found, progress_error_to_response, store_error_to_response};
use crate::app::services::AppServices;

use super::parse_job_id;

/// `GET /progress`: the most recently started run, Idle before any.
pub async fn latest(Extension(services): Extension<Arc<AppServices>>) -> Response {
    match services.jobs.progress.latest().await {
        Ok(snapshot) => Json(ProgressView::at(snapshot, Utc::now())).into_response(),
        Err(e) => progress_error_to_response(e),
    }
}

/// `GET /jobs/:id/progress`
///
/// Falls back to the durable record when the live view no longer holds the
/// job, so finished runs stay queryable.
pub async fn by_id(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.jobs.progress.get(id).await {
        Ok(Some(snapshot)) => return Json(ProgressView::at(snapshot, Utc::now())).into_response(),
        Ok(None) => {}
        Err(e) => debug!(job_id = %id, error = %e, "live progress unavailable"),
    }

    match services.jobs.records.get(id).await {
        Ok(Some(record)) => {
            Json(ProgressView::at(snapshot_from_record(&record), Utc::now())).into_response()
        }
        Ok(None) => not_found(format!("job {id} not found")),
        Err(e) => store_error_to_response(e),
    }
}
