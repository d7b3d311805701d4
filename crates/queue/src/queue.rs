//! Queue abstraction.
//!
//! ```text
//! Dispatcher ── push ──▶ JobQueue ── receive(type) ──▶ Worker(type) ── ack ──▶ JobQueue
//! ```
//!
//! Each job type is an independent lane: `receive` only hands out jobs of the
//! requested type, so a slow backup never delays an email.
//!
//! ## Delivery guarantees
//!
//! - `push` either durably accepts the job or fails; there is no partial state.
//! - `receive` waits until a job of that type is available.
//! - A delivery that is never acked is redelivered when a consumer for that
//!   type restarts (pending-entry recovery), or once it sits idle past the
//!   broker's claim timeout. Long runs call `touch` to stay un-idle.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use pricekeep_core::{JobRequest, JobType};

use crate::envelope::{Delivery, QueuedJob};

#[derive(Debug, Error)]
pub enum QueueError {
    /// The broker could not be reached or refused the operation.
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    #[error("failed to serialize job: {0}")]
    Serialization(String),

    #[error("failed to deserialize job: {0}")]
    Deserialization(String),

    /// The queue was shut down; no further deliveries will arrive.
    #[error("queue closed")]
    Closed,
}

impl QueueError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, QueueError::Unavailable(_))
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Accept `request`, assigning its job id.
    async fn push(&self, request: JobRequest) -> Result<QueuedJob, QueueError>;

    /// Wait for the next job of `job_type`.
    async fn receive(&self, job_type: JobType) -> Result<Delivery, QueueError>;

    /// Settle a delivery so it is never handed out again.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Mark a delivery as still being worked on, deferring idle reclaim.
    async fn touch(&self, _delivery: &Delivery) -> Result<(), QueueError> {
        Ok(())
    }
}

#[async_trait]
impl<Q> JobQueue for Arc<Q>
where
    Q: JobQueue + ?Sized,
{
    async fn push(&self, request: JobRequest) -> Result<QueuedJob, QueueError> {
        (**self).push(request).await
    }

    async fn receive(&self, job_type: JobType) -> Result<Delivery, QueueError> {
        (**self).receive(job_type).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        (**self).ack(delivery).await
    }

    async fn touch(&self, delivery: &Delivery) -> Result<(), QueueError> {
        (**self).touch(delivery).await
    }
}
