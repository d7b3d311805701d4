//! Job dispatch (request side of the job system).
//!
//! ```text
//! enqueue(type, payload)
//!   ↓
//! 1. Validate payload against the schema of `type`   (fails fast, nothing written)
//!   ↓
//! 2. Push the request to the queue                    (the only write)
//!   ↓
//! 3. Return JobHandle { id, status: "enqueued" }
//! ```
//!
//! The dispatcher never waits for execution and never touches the record or
//! progress stores, so a failed push leaves no partial state behind.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, instrument, warn};

use pricekeep_core::{DomainError, JobHandle, JobPayload, JobRequest, JobType, JsonMap};
use pricekeep_queue::{JobQueue, QueueError};

#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    /// Malformed payload or unknown job type; the queue was not touched.
    #[error("{0}")]
    Validation(String),
    /// The broker could not accept the job.
    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),
}

impl From<DomainError> for EnqueueError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg)
            | DomainError::InvalidId(msg)
            | DomainError::InvalidTransition(msg) => EnqueueError::Validation(msg),
        }
    }
}

impl From<QueueError> for EnqueueError {
    fn from(err: QueueError) -> Self {
        EnqueueError::QueueUnavailable(err.to_string())
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    queue: Arc<dyn JobQueue>,
}

impl Dispatcher {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self { queue }
    }

    /// Validate and enqueue a job; returns as soon as the queue accepted it.
    #[instrument(skip_all, fields(job_type = %job_type), err)]
    pub async fn enqueue(
        &self,
        job_type: JobType,
        payload: JsonMap,
    ) -> Result<JobHandle, EnqueueError> {
        JobPayload::parse(job_type, &payload)?;

        let queued = self
            .queue
            .push(JobRequest {
                job_type,
                payload,
                requested_at: Utc::now(),
            })
            .await
            .map_err(|e| {
                warn!(error = %e, "failed to push job");
                EnqueueError::from(e)
            })?;

        debug!(job_id = %queued.id, "job enqueued");
        Ok(JobHandle::enqueued(queued.id))
    }

    /// Like [`enqueue`](Self::enqueue), for callers holding the wire type name
    /// and an arbitrary JSON payload.
    pub async fn enqueue_raw(
        &self,
        type_name: &str,
        payload: serde_json::Value,
    ) -> Result<JobHandle, EnqueueError> {
        let job_type: JobType = type_name.parse()?;
        let payload = match payload {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => JsonMap::new(),
            _ => {
                return Err(EnqueueError::Validation(
                    "payload must be a JSON object".to_string(),
                ));
            }
        };
        self.enqueue(job_type, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pricekeep_core::HandleStatus;
    use pricekeep_queue::{Delivery, InMemoryJobQueue, QueuedJob};
    use serde_json::json;

    struct OfflineQueue;

    #[async_trait]
    impl JobQueue for OfflineQueue {
        async fn push(&self, _request: JobRequest) -> Result<QueuedJob, QueueError> {
            Err(QueueError::Unavailable("connection refused".to_string()))
        }

        async fn receive(&self, _job_type: JobType) -> Result<Delivery, QueueError> {
            Err(QueueError::Unavailable("connection refused".to_string()))
        }

        async fn ack(&self, _delivery: &Delivery) -> Result<(), QueueError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn valid_request_is_queued_and_handle_returned() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let dispatcher = Dispatcher::new(queue.clone());

        let handle = dispatcher
            .enqueue_raw("email_send", json!({"to": "a@x.com"}))
            .await
            .unwrap();
        assert_eq!(handle.status, HandleStatus::Enqueued);
        assert_eq!(queue.len(JobType::EmailSend), 1);

        let delivery = queue.receive(JobType::EmailSend).await.unwrap();
        assert_eq!(delivery.id(), handle.id);
    }

    #[tokio::test]
    async fn invalid_payload_never_reaches_the_queue() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let dispatcher = Dispatcher::new(queue.clone());

        let err = dispatcher
            .enqueue_raw("email_send", json!({"subject": "no recipient"}))
            .await
            .unwrap_err();
        assert!(matches!(err, EnqueueError::Validation(_)));

        let err = dispatcher.enqueue_raw("scrape", json!({})).await.unwrap_err();
        assert!(matches!(err, EnqueueError::Validation(msg) if msg.contains("unknown job type")));

        let err = dispatcher
            .enqueue_raw("backup", json!("not an object"))
            .await
            .unwrap_err();
        assert!(matches!(err, EnqueueError::Validation(_)));

        assert!(queue.is_empty(JobType::EmailSend));
        assert!(queue.is_empty(JobType::Backup));
    }

    #[tokio::test]
    async fn broker_failure_surfaces_as_queue_unavailable() {
        let dispatcher = Dispatcher::new(Arc::new(OfflineQueue));
        let err = dispatcher
            .enqueue(JobType::Backup, JsonMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EnqueueError::QueueUnavailable(_)));
    }
}
