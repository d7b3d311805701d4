use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path, Query, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::info;

use pricekeep_infra::jobs::JobRecordStore;

use crate::app::dto::{EnqueueRequest, LatestQuery, ListQuery};
use crate::app::errors::{
    bad_request, enqueue_error_to_response, not_found, store_error_to_response,
};
use crate::app::services::AppServices;

use super::parse_job_id;

/// `POST /jobs`: validate and enqueue; never waits for the run.
pub async fn enqueue(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<EnqueueRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    let (job_type, payload) = match request.into_parts() {
        Ok(parts) => parts,
        Err(resp) => return resp,
    };

    match services.jobs.dispatcher().enqueue(job_type, payload).await {
        Ok(handle) => {
            info!(job_id = %handle.id, job_type = %job_type, "job accepted");
            (StatusCode::ACCEPTED, Json(handle)).into_response()
        }
        Err(e) => enqueue_error_to_response(e),
    }
}

/// `GET /jobs?type=&status=&limit=`: newest first.
pub async fn list(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<ListQuery>,
) -> Response {
    let filter = match query.into_filter() {
        Ok(filter) => filter,
        Err(resp) => return resp,
    };

    match services.jobs.records.list(&filter).await {
        Ok(records) => Json(records).into_response(),
        Err(e) => store_error_to_response(e),
    }
}

/// `GET /jobs/latest?type=`
pub async fn latest(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<LatestQuery>,
) -> Response {
    let job_type = match query.job_type() {
        Ok(t) => t,
        Err(resp) => return resp,
    };

    match services.jobs.records.latest(job_type).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => not_found(format!("no {job_type} job has run yet")),
        Err(e) => store_error_to_response(e),
    }
}

/// `GET /jobs/:id`
pub async fn get(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.jobs.records.get(id).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => not_found(format!("job {id} not found")),
        Err(e) => store_error_to_response(e),
    }
}
