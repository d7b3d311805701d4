//! Fire-and-forget progress reporting.
//!
//! Handlers push [`ProgressUpdate`]s into an unbounded channel; a forwarder
//! task applies them to the progress store in order. A slow or failing store
//! never blocks a handler, and updates are dropped once nobody is forwarding.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use pricekeep_core::{JobId, ProgressStatus, ProgressUpdate};

use crate::progress::ProgressStore;

#[derive(Debug, Clone)]
pub struct ProgressReporter {
    job_id: JobId,
    tx: mpsc::UnboundedSender<ProgressUpdate>,
}

impl ProgressReporter {
    /// A reporter plus the receiving end, for callers that forward updates themselves.
    pub fn channel(job_id: JobId) -> (Self, mpsc::UnboundedReceiver<ProgressUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { job_id, tx }, rx)
    }

    /// A reporter whose updates go nowhere.
    pub fn detached(job_id: JobId) -> Self {
        Self::channel(job_id).0
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn report(&self, update: ProgressUpdate) {
        // Closed channel means the run is over; late updates are irrelevant.
        let _ = self.tx.send(update);
    }

    pub fn running(&self, percent: u8, step: impl Into<String>) {
        self.report(
            ProgressUpdate::new()
                .status(ProgressStatus::Running)
                .percent(percent)
                .step(step),
        );
    }

    pub fn finalizing(&self, percent: u8, step: impl Into<String>) {
        self.report(
            ProgressUpdate::new()
                .status(ProgressStatus::Finalizing)
                .percent(percent)
                .step(step),
        );
    }
}

/// Background task applying one run's updates to a progress store.
#[derive(Debug)]
pub struct ProgressForwarder {
    task: JoinHandle<u64>,
}

impl ProgressForwarder {
    /// Spawn a forwarder for `job_id` and return the reporter feeding it.
    pub fn spawn(job_id: JobId, store: Arc<dyn ProgressStore>) -> (ProgressReporter, Self) {
        let (reporter, mut rx) = ProgressReporter::channel(job_id);

        let task = tokio::spawn(async move {
            let mut last_percent = 0u8;
            let mut applied = 0u64;

            while let Some(update) = rx.recv().await {
                if let Some(percent) = update.percent {
                    if percent < last_percent {
                        warn!(
                            job_id = %job_id,
                            from = last_percent,
                            to = percent,
                            "progress percent went backwards"
                        );
                    }
                    last_percent = percent;
                }

                match store.update(job_id, &update, Utc::now()).await {
                    Ok(Some(_)) => applied += 1,
                    Ok(None) => debug!(job_id = %job_id, "no progress snapshot to update"),
                    Err(e) => warn!(job_id = %job_id, error = %e, "progress update failed"),
                }
            }
            applied
        });

        (reporter, Self { task })
    }

    /// Wait until every queued update has been applied.
    ///
    /// Completes once all reporters are dropped. Gives up after `timeout` when
    /// a handler leaked a reporter clone into a task that outlives the run.
    pub async fn drain(self, timeout: Duration) -> u64 {
        let abort = self.task.abort_handle();
        match tokio::time::timeout(timeout, self.task).await {
            Ok(Ok(applied)) => applied,
            Ok(Err(e)) => {
                warn!(error = %e, "progress forwarder task failed");
                0
            }
            Err(_) => {
                warn!("progress forwarder did not drain in time; abandoning remaining updates");
                abort.abort();
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::KeyedProgressStore;
    use pricekeep_core::{JobType, ProgressSnapshot};

    #[tokio::test]
    async fn forwards_updates_in_order() {
        let store = Arc::new(KeyedProgressStore::new());
        let id = JobId::new();
        store
            .set(id, ProgressSnapshot::preparing(id, JobType::Backup, Utc::now()))
            .await
            .unwrap();

        let (reporter, forwarder) = ProgressForwarder::spawn(id, store.clone());
        for p in [10, 20, 30] {
            reporter.running(p, format!("step {p}"));
        }
        reporter.finalizing(90, "uploading");
        drop(reporter);

        assert_eq!(forwarder.drain(Duration::from_secs(1)).await, 4);
        let snap = store.get(id).await.unwrap().unwrap();
        assert_eq!(snap.percent, 90);
        assert_eq!(snap.status, ProgressStatus::Finalizing);
        assert_eq!(snap.current_step, "uploading");
    }

    #[tokio::test]
    async fn detached_reporter_never_fails() {
        let reporter = ProgressReporter::detached(JobId::new());
        reporter.running(50, "ignored");
    }

    #[tokio::test]
    async fn drain_gives_up_on_leaked_reporters() {
        let store = Arc::new(KeyedProgressStore::new());
        let (reporter, forwarder) = ProgressForwarder::spawn(JobId::new(), store);
        let leaked = reporter.clone();
        drop(reporter);

        assert_eq!(forwarder.drain(Duration::from_millis(20)).await, 0);
        leaked.running(10, "after the run");
    }
}
