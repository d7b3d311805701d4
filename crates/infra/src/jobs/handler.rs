//! Handler contract.

use std::sync::Arc;

use async_trait::async_trait;

use pricekeep_core::{ExecutionError, JobType, JsonMap};

use super::reporter::ProgressReporter;

/// What a successful handler run leaves behind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobOutput {
    /// Short text stored as the record's `resultSummary`.
    pub summary: String,
    /// Structured details exposed as the progress `resultInfo`.
    pub info: JsonMap,
}

impl JobOutput {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            info: JsonMap::new(),
        }
    }

    pub fn with_info(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.info.insert(key.into(), value.into());
        self
    }
}

/// The unit of work for one job type.
///
/// Handlers report progress with non-decreasing percents and should report
/// 100 before returning `Ok`. They never touch the record store.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> JobType;

    async fn execute(
        &self,
        payload: &JsonMap,
        report: &ProgressReporter,
    ) -> Result<JobOutput, ExecutionError>;
}

#[async_trait]
impl<H> JobHandler for Arc<H>
where
    H: JobHandler + ?Sized,
{
    fn job_type(&self) -> JobType {
        (**self).job_type()
    }

    async fn execute(
        &self,
        payload: &JsonMap,
        report: &ProgressReporter,
    ) -> Result<JobOutput, ExecutionError> {
        (**self).execute(payload, report).await
    }
}
