//! Wire envelope for queued jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pricekeep_core::{JobId, JobRequest, JobType, JsonMap};

/// A job request once it has been accepted by the queue.
///
/// Serialized as `{id, type, payload, requestedAt}`; this is the only contract
/// between the dispatcher process and the worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedJob {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub payload: JsonMap,
    pub requested_at: DateTime<Utc>,
}

impl QueuedJob {
    /// Assign a fresh id to `request`.
    pub fn assign(request: JobRequest) -> Self {
        Self {
            id: JobId::new(),
            job_type: request.job_type,
            payload: request.payload,
            requested_at: request.requested_at,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// One hand-out of a queued job to a consumer.
///
/// `receipt` is transport specific (a stream entry id for Redis, the job id for
/// the in-memory queue) and is what [`JobQueue::ack`](crate::JobQueue::ack)
/// needs to settle the delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub job: QueuedJob,
    pub receipt: String,
    /// 1 on first hand-out, higher on redelivery.
    pub attempt: u32,
}

impl Delivery {
    pub fn id(&self) -> JobId {
        self.job.id
    }

    pub fn is_redelivery(&self) -> bool {
        self.attempt > 1
    }
}
