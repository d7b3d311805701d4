//! Domain building blocks for background jobs.
//!
//! This crate contains **pure domain** types (no infrastructure concerns): job
//! identity, requests, durable records, live progress snapshots, payload schemas
//! and the error taxonomy shared by the dispatcher, worker and handlers.

pub mod error;
pub mod id;
pub mod job;
pub mod payload;
pub mod progress;

pub use error::{DomainError, DomainResult, ExecutionError, StaleRunError};
pub use id::JobId;
pub use job::{HandleStatus, JobHandle, JobRecord, JobRequest, JobStatus, JobType};
pub use payload::{BackupPayload, EmailSendPayload, JobPayload, PriceSyncPayload, validate_email};
pub use progress::{ProgressSnapshot, ProgressStatus, ProgressUpdate};

/// JSON object used as the opaque key-value payload of a job request.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;
