//! Domain error model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::id::JobId;
use crate::job::JobType;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic failures (validation, bad identifiers,
/// illegal state transitions). Infrastructure concerns belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed payload).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A job record was asked to move to a status it cannot reach from its current one.
    #[error("invalid status transition: {0}")]
    InvalidTransition(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_transition(msg: impl Into<String>) -> Self {
        Self::InvalidTransition(msg.into())
    }
}

/// Failure raised by a job handler.
///
/// `retryable` tells the broker whether redelivery makes sense; the worker
/// records the failure either way and never retries on its own.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{reason}")]
pub struct ExecutionError {
    pub reason: String,
    pub retryable: bool,
}

impl ExecutionError {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retryable: true,
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retryable: false,
        }
    }
}

/// A `Running` job that has shown no activity for longer than the grace period.
///
/// Produced by monitoring only; nothing heals these automatically.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
#[error("job {job_id} ({job_type}) has been running without activity since {last_activity} (grace {grace_secs}s)")]
pub struct StaleRunError {
    pub job_id: JobId,
    pub job_type: JobType,
    pub last_activity: DateTime<Utc>,
    pub grace_secs: u64,
}
