//! Job requests, handles and durable execution records.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;
use crate::JsonMap;

/// Kind of background job; each kind has exactly one handler and one worker loop.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Database backup/export uploaded to artifact storage.
    Backup,
    /// Bulk price synchronization against the external price source.
    PriceSync,
    /// Transactional email dispatch.
    EmailSend,
}

impl JobType {
    pub const ALL: [JobType; 3] = [JobType::Backup, JobType::PriceSync, JobType::EmailSend];

    /// Wire name, also used for stream keys and table values.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Backup => "backup",
            JobType::PriceSync => "price_sync",
            JobType::EmailSend => "email_send",
        }
    }
}

impl core::fmt::Display for JobType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backup" => Ok(JobType::Backup),
            "price_sync" => Ok(JobType::PriceSync),
            "email_send" => Ok(JobType::EmailSend),
            other => Err(DomainError::validation(format!(
                "unknown job type '{other}' (expected one of: backup, price_sync, email_send)"
            ))),
        }
    }
}

/// A request to run one job. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub payload: JsonMap,
    pub requested_at: DateTime<Utc>,
}

impl JobRequest {
    pub fn new(job_type: JobType, payload: JsonMap) -> Self {
        Self {
            job_type,
            payload,
            requested_at: Utc::now(),
        }
    }
}

/// Status carried by a freshly returned [`JobHandle`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleStatus {
    Enqueued,
}

/// Returned synchronously by the dispatcher. Says nothing about completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: JobId,
    pub status: HandleStatus,
}

impl JobHandle {
    pub fn enqueued(id: JobId) -> Self {
        Self {
            id,
            status: HandleStatus::Enqueued,
        }
    }
}

/// Durable execution status: `Pending → Running → {Succeeded | Failed}`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            other => Err(DomainError::validation(format!("unknown job status '{other}'"))),
        }
    }
}

/// Durable audit entry for one execution.
///
/// Only the worker mutates records, and only through the transition methods
/// below; records are never deleted automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub payload_summary: Option<String>,
    pub result_summary: Option<String>,
    pub error_message: Option<String>,
}

impl JobRecord {
    /// A record for a job that has been picked up but not started.
    pub fn pending(
        id: JobId,
        job_type: JobType,
        created_at: DateTime<Utc>,
        payload_summary: Option<String>,
    ) -> Self {
        Self {
            id,
            job_type,
            status: JobStatus::Pending,
            created_at,
            started_at: None,
            finished_at: None,
            payload_summary,
            result_summary: None,
            error_message: None,
        }
    }

    /// Mark the record as running.
    pub fn start(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        if self.status != JobStatus::Pending {
            return Err(DomainError::invalid_transition(format!(
                "job {} cannot start from {}",
                self.id, self.status
            )));
        }
        self.status = JobStatus::Running;
        self.started_at = Some(at);
        Ok(())
    }

    /// Mark a running record as succeeded.
    pub fn succeed(&mut self, at: DateTime<Utc>, summary: impl Into<String>) -> DomainResult<()> {
        let finished_at = self.finish_time(at)?;
        self.status = JobStatus::Succeeded;
        self.finished_at = Some(finished_at);
        self.result_summary = Some(summary.into());
        Ok(())
    }

    /// Mark a running record as failed.
    pub fn fail(&mut self, at: DateTime<Utc>, error: impl Into<String>) -> DomainResult<()> {
        let finished_at = self.finish_time(at)?;
        self.status = JobStatus::Failed;
        self.finished_at = Some(finished_at);
        self.error_message = Some(error.into());
        Ok(())
    }

    /// Time between start and finish, when both are known.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(started), Some(finished)) => Some(finished - started),
            _ => None,
        }
    }

    // `finishedAt` never precedes `startedAt`, even across clock skew between processes.
    fn finish_time(&self, at: DateTime<Utc>) -> DomainResult<DateTime<Utc>> {
        if self.status != JobStatus::Running {
            return Err(DomainError::invalid_transition(format!(
                "job {} cannot finish from {}",
                self.id, self.status
            )));
        }
        Ok(match self.started_at {
            Some(started) if started > at => started,
            _ => at,
        })
    }
}
