use axum::response::Response;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use pricekeep_core::{JobRecord, JobStatus, JobType, JsonMap, ProgressSnapshot, ProgressStatus};
use pricekeep_infra::jobs::RecordFilter;

use super::errors::bad_request;

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub payload: JsonValue,
}

impl EnqueueRequest {
    /// Job type and payload object; a missing payload is an empty object.
    pub fn into_parts(self) -> Result<(JobType, JsonMap), Response> {
        let job_type = self
            .job_type
            .parse::<JobType>()
            .map_err(|e| bad_request(e.to_string()))?;
        let payload = match self.payload {
            JsonValue::Object(map) => map,
            JsonValue::Null => JsonMap::new(),
            _ => return Err(bad_request("payload must be a JSON object")),
        };
        Ok((job_type, payload))
    }
}

/// Snapshot plus time since the run started.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressView {
    #[serde(flatten)]
    pub snapshot: ProgressSnapshot,
    pub elapsed_ms: u64,
}

impl ProgressView {
    pub fn at(snapshot: ProgressSnapshot, now: DateTime<Utc>) -> Self {
        let elapsed_ms = u64::try_from(snapshot.elapsed(now).as_millis()).unwrap_or(u64::MAX);
        Self {
            snapshot,
            elapsed_ms,
        }
    }
}

/// Progress reconstructed from the durable record once the live view moved on.
pub fn snapshot_from_record(record: &JobRecord) -> ProgressSnapshot {
    let (status, percent) = match record.status {
        JobStatus::Pending => (ProgressStatus::Preparing, 0),
        JobStatus::Running => (ProgressStatus::Running, 0),
        JobStatus::Succeeded => (ProgressStatus::Completed, 100),
        JobStatus::Failed => (ProgressStatus::Error, 0),
    };

    ProgressSnapshot {
        job_id: Some(record.id),
        job_type: Some(record.job_type),
        status,
        percent,
        current_step: record.status.as_str().to_string(),
        start_time: record.started_at,
        updated_at: record.finished_at.or(record.started_at).or(Some(record.created_at)),
        error: record.error_message.clone(),
        ..ProgressSnapshot::idle()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    #[serde(rename = "type")]
    pub job_type: Option<String>,
    pub status: Option<String>,
    pub limit: Option<usize>,
}

impl ListQuery {
    pub fn into_filter(self) -> Result<RecordFilter, Response> {
        let mut filter = RecordFilter::default();
        if let Some(raw) = self.job_type {
            filter = filter.job_type(raw.parse().map_err(|e: pricekeep_core::DomainError| {
                bad_request(e.to_string())
            })?);
        }
        if let Some(raw) = self.status {
            filter = filter.status(raw.parse().map_err(|e: pricekeep_core::DomainError| {
                bad_request(e.to_string())
            })?);
        }
        if let Some(limit) = self.limit {
            filter = filter.limit(limit);
        }
        Ok(filter)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LatestQuery {
    #[serde(rename = "type")]
    pub job_type: Option<String>,
}

impl LatestQuery {
    pub fn job_type(&self) -> Result<JobType, Response> {
        let raw = self
            .job_type
            .as_deref()
            .ok_or_else(|| bad_request("query parameter 'type' is required"))?;
        raw.parse().map_err(|e: pricekeep_core::DomainError| bad_request(e.to_string()))
    }
}
