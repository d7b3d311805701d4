//! Live progress snapshots.
//!
//! A snapshot is a best-effort view of one execution in flight. It is not
//! transactionally linked to the durable [`JobRecord`](crate::JobRecord): a
//! reader may see a snapshot that is slightly ahead of or behind the record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::JobId;
use crate::job::JobType;
use crate::JsonMap;

/// Phase reported by the live progress view.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    /// Nothing has run yet in this process (or store).
    #[default]
    Idle,
    Preparing,
    Running,
    /// Uploading / writing results.
    Finalizing,
    Completed,
    Error,
}

impl ProgressStatus {
    /// True while an execution is in flight.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ProgressStatus::Preparing | ProgressStatus::Running | ProgressStatus::Finalizing
        )
    }
}

/// Partial progress update pushed by a handler; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub status: Option<ProgressStatus>,
    pub percent: Option<u8>,
    pub current_step: Option<String>,
    pub estimated_time_ms: Option<u64>,
    pub result_info: Option<JsonMap>,
}

impl ProgressUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: ProgressStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn percent(mut self, percent: u8) -> Self {
        self.percent = Some(percent);
        self
    }

    pub fn step(mut self, step: impl Into<String>) -> Self {
        self.current_step = Some(step.into());
        self
    }

    pub fn estimated(mut self, estimated: std::time::Duration) -> Self {
        self.estimated_time_ms = Some(estimated.as_millis() as u64);
        self
    }

    pub fn result_info(mut self, info: JsonMap) -> Self {
        self.result_info = Some(info);
        self
    }
}

/// Progress of the current (or most recent) execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub job_id: Option<JobId>,
    pub job_type: Option<JobType>,
    pub status: ProgressStatus,
    pub percent: u8,
    pub current_step: String,
    pub start_time: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub estimated_time_ms: Option<u64>,
    pub error: Option<String>,
    pub result_info: Option<JsonMap>,
}

impl Default for ProgressSnapshot {
    fn default() -> Self {
        Self::idle()
    }
}

impl ProgressSnapshot {
    /// The snapshot observed before any run has started.
    pub fn idle() -> Self {
        Self {
            job_id: None,
            job_type: None,
            status: ProgressStatus::Idle,
            percent: 0,
            current_step: String::new(),
            start_time: None,
            updated_at: None,
            estimated_time_ms: None,
            error: None,
            result_info: None,
        }
    }

    /// Fresh snapshot for a run that is about to start.
    pub fn preparing(job_id: JobId, job_type: JobType, at: DateTime<Utc>) -> Self {
        Self {
            job_id: Some(job_id),
            job_type: Some(job_type),
            status: ProgressStatus::Preparing,
            percent: 0,
            current_step: "preparing".to_string(),
            start_time: Some(at),
            updated_at: Some(at),
            ..Self::idle()
        }
    }

    /// Merge a partial update into this snapshot.
    ///
    /// Percent is clamped to 100 but not forced to be monotonic; reporting
    /// non-decreasing values is the handler's contract.
    pub fn apply(&mut self, update: &ProgressUpdate, at: DateTime<Utc>) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(percent) = update.percent {
            self.percent = percent.min(100);
        }
        if let Some(step) = &update.current_step {
            self.current_step = step.clone();
        }
        if let Some(estimated) = update.estimated_time_ms {
            self.estimated_time_ms = Some(estimated);
        }
        if let Some(info) = &update.result_info {
            self.result_info = Some(info.clone());
        }
        self.updated_at = Some(at);
    }

    /// Terminal success view.
    pub fn complete(&mut self, at: DateTime<Utc>, result_info: Option<JsonMap>) {
        self.status = ProgressStatus::Completed;
        self.percent = 100;
        self.current_step = "completed".to_string();
        self.estimated_time_ms = None;
        if result_info.is_some() {
            self.result_info = result_info;
        }
        self.updated_at = Some(at);
    }

    /// Terminal failure view; percent stays where the handler left it.
    pub fn fail(&mut self, at: DateTime<Utc>, message: impl Into<String>) {
        self.status = ProgressStatus::Error;
        self.error = Some(message.into());
        self.estimated_time_ms = None;
        self.updated_at = Some(at);
    }

    /// `now - startTime`, or zero when no run has started.
    pub fn elapsed(&self, now: DateTime<Utc>) -> std::time::Duration {
        self.start_time
            .map(|start| (now - start).to_std().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Most recent sign of life for this run.
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.updated_at.or(self.start_time)
    }
}
