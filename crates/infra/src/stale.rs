//! Detection of runs that hold the concurrency guard without making progress.
//!
//! A handler that hangs keeps its job `Running` forever and blocks every later
//! job of the same type. The detector only reports such runs; recovering them is
//! an operator decision.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use pricekeep_core::StaleRunError;

use crate::jobs::{JobRecordStore, JobStoreError};
use crate::progress::ProgressStore;

pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(60);

pub struct StaleRunDetector {
    records: Arc<dyn JobRecordStore>,
    progress: Arc<dyn ProgressStore>,
    grace: Duration,
}

impl StaleRunDetector {
    pub fn new(
        records: Arc<dyn JobRecordStore>,
        progress: Arc<dyn ProgressStore>,
        grace: Duration,
    ) -> Self {
        Self {
            records,
            progress,
            grace,
        }
    }

    /// Running records whose last activity is older than the grace period.
    ///
    /// Last activity is the later of `startedAt` and the run's latest progress
    /// write, including writes the progress view no longer shows. A progress
    /// store error only loses that refinement.
    pub async fn scan(&self, now: DateTime<Utc>) -> Result<Vec<StaleRunError>, JobStoreError> {
        let grace = chrono::Duration::from_std(self.grace)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let mut stale = Vec::new();

        for record in self.records.running().await? {
            let Some(started_at) = record.started_at else {
                continue;
            };

            let progressed_at = match self.progress.last_activity(record.id).await {
                Ok(at) => at,
                Err(e) => {
                    debug!(job_id = %record.id, error = %e, "progress unavailable for stale check");
                    None
                }
            };
            let last_activity = progressed_at.map_or(started_at, |p| p.max(started_at));

            if now - last_activity > grace {
                let err = StaleRunError {
                    job_id: record.id,
                    job_type: record.job_type,
                    last_activity,
                    grace_secs: self.grace.as_secs(),
                };
                warn!(job_id = %err.job_id, job_type = %err.job_type, "{err}");
                stale.push(err);
            }
        }

        Ok(stale)
    }

    /// Scan every `interval` until `shutdown` fires.
    pub fn spawn(self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.scan(Utc::now()).await {
                            warn!(error = %e, "stale run scan failed");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{InMemoryJobRecordStore, StartOutcome};
    use crate::progress::{KeyedProgressStore, LocalProgressStore};
    use pricekeep_core::{JobId, JobRecord, JobType, ProgressSnapshot, ProgressUpdate};

    async fn running_since(
        records: &InMemoryJobRecordStore,
        job_type: JobType,
        started_at: DateTime<Utc>,
    ) -> JobId {
        let id = JobId::new();
        records
            .ensure_pending(JobRecord::pending(id, job_type, started_at, None))
            .await
            .unwrap();
        let outcome = records
            .try_start(id, job_type, started_at, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(matches!(outcome, StartOutcome::Started(_)));
        id
    }

    #[tokio::test]
    async fn reports_runs_without_recent_activity() {
        let records = Arc::new(InMemoryJobRecordStore::new());
        let progress = Arc::new(KeyedProgressStore::new());
        let now = Utc::now();

        let hung = running_since(&records, JobType::Backup, now - chrono::Duration::hours(2)).await;
        let busy = running_since(&records, JobType::PriceSync, now - chrono::Duration::hours(2)).await;
        let fresh = running_since(&records, JobType::EmailSend, now - chrono::Duration::minutes(1)).await;

        // The long-running price sync keeps reporting progress.
        progress
            .set(
                busy,
                ProgressSnapshot::preparing(busy, JobType::PriceSync, now - chrono::Duration::hours(2)),
            )
            .await
            .unwrap();
        progress
            .update(
                busy,
                &ProgressUpdate::new().percent(40),
                now - chrono::Duration::minutes(3),
            )
            .await
            .unwrap();

        let detector = StaleRunDetector::new(records, progress, Duration::from_secs(900));
        let stale = detector.scan(now).await.unwrap();

        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].job_id, hung);
        assert_eq!(stale[0].grace_secs, 900);
        assert!(stale.iter().all(|s| s.job_id != fresh));
    }

    #[tokio::test]
    async fn run_hidden_behind_a_newer_slot_owner_is_not_stale() {
        let records = Arc::new(InMemoryJobRecordStore::new());
        let progress = Arc::new(LocalProgressStore::new());
        let now = Utc::now();
        let two_hours_ago = now - chrono::Duration::hours(2);

        let sync = running_since(&records, JobType::PriceSync, two_hours_ago).await;
        progress
            .set(sync, ProgressSnapshot::preparing(sync, JobType::PriceSync, two_hours_ago))
            .await
            .unwrap();

        // A later email run takes over the single slot.
        let email = running_since(&records, JobType::EmailSend, now - chrono::Duration::minutes(1)).await;
        progress
            .set(
                email,
                ProgressSnapshot::preparing(email, JobType::EmailSend, now - chrono::Duration::minutes(1)),
            )
            .await
            .unwrap();

        // The price sync keeps reporting, though the slot drops its writes.
        progress
            .update(
                sync,
                &ProgressUpdate::new().percent(70),
                now - chrono::Duration::minutes(2),
            )
            .await
            .unwrap();
        assert!(progress.get(sync).await.unwrap().is_none());

        let detector = StaleRunDetector::new(records, progress, Duration::from_secs(900));
        assert!(detector.scan(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn spawned_detector_stops_on_shutdown() {
        let detector = StaleRunDetector::new(
            Arc::new(InMemoryJobRecordStore::new()),
            Arc::new(KeyedProgressStore::new()),
            Duration::from_secs(900),
        );
        let shutdown = CancellationToken::new();
        let handle = detector.spawn(Duration::from_millis(10), shutdown.clone());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
