//! Single-slot progress store for the single-process mode.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use pricekeep_core::{JobId, ProgressSnapshot, ProgressUpdate};

use super::{ProgressStore, ProgressStoreError, starts_run};

/// One process-wide snapshot shared by every job type.
///
/// `get(id)` only answers for the run that currently owns the slot. The time
/// of every write is still tracked per active run, so `last_activity` sees runs
/// that lost the slot.
#[derive(Debug, Default)]
pub struct LocalProgressStore {
    slot: RwLock<ProgressSnapshot>,
    activity: Mutex<HashMap<JobId, DateTime<Utc>>>,
}

impl LocalProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> ProgressStoreError {
        ProgressStoreError::Storage("progress slot lock poisoned".to_string())
    }

    fn touch(&self, id: JobId, at: Option<DateTime<Utc>>) -> Result<(), ProgressStoreError> {
        let mut activity = self.activity.lock().map_err(|_| Self::poisoned())?;
        match at {
            Some(at) => {
                activity.insert(id, at);
            }
            None => {
                activity.remove(&id);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ProgressStore for LocalProgressStore {
    async fn latest(&self) -> Result<ProgressSnapshot, ProgressStoreError> {
        Ok(self.slot.read().map_err(|_| Self::poisoned())?.clone())
    }

    async fn get(&self, id: JobId) -> Result<Option<ProgressSnapshot>, ProgressStoreError> {
        let slot = self.slot.read().map_err(|_| Self::poisoned())?;
        Ok((slot.job_id == Some(id)).then(|| slot.clone()))
    }

    async fn set(&self, id: JobId, snapshot: ProgressSnapshot) -> Result<(), ProgressStoreError> {
        let seen = snapshot
            .status
            .is_active()
            .then(|| snapshot.last_activity().unwrap_or_else(Utc::now));
        self.touch(id, seen)?;

        let mut slot = self.slot.write().map_err(|_| Self::poisoned())?;
        if slot.job_id == Some(id) || starts_run(&snapshot) {
            *slot = ProgressSnapshot {
                job_id: Some(id),
                ..snapshot
            };
        } else {
            tracing::debug!(job_id = %id, "dropping progress for a run that no longer owns the slot");
        }
        Ok(())
    }

    async fn update(
        &self,
        id: JobId,
        update: &ProgressUpdate,
        at: DateTime<Utc>,
    ) -> Result<Option<ProgressSnapshot>, ProgressStoreError> {
        self.touch(id, Some(at))?;

        let mut slot = self.slot.write().map_err(|_| Self::poisoned())?;
        if slot.job_id != Some(id) {
            return Ok(None);
        }
        slot.apply(update, at);
        Ok(Some(slot.clone()))
    }

    async fn last_activity(&self, id: JobId) -> Result<Option<DateTime<Utc>>, ProgressStoreError> {
        let activity = self.activity.lock().map_err(|_| Self::poisoned())?;
        Ok(activity.get(&id).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pricekeep_core::{JobType, ProgressStatus};

    #[tokio::test]
    async fn starts_idle() {
        let store = LocalProgressStore::new();
        let snap = store.latest().await.unwrap();
        assert_eq!(snap.status, ProgressStatus::Idle);
        assert_eq!(snap.percent, 0);
        assert!(snap.start_time.is_none());
    }

    #[tokio::test]
    async fn newer_run_owns_the_slot() {
        let store = LocalProgressStore::new();
        let (a, b) = (JobId::new(), JobId::new());
        let now = Utc::now();

        store
            .set(a, ProgressSnapshot::preparing(a, JobType::Backup, now))
            .await
            .unwrap();
        store
            .set(b, ProgressSnapshot::preparing(b, JobType::EmailSend, now))
            .await
            .unwrap();

        // Late writes for `a` are ignored.
        assert!(
            store
                .update(a, &ProgressUpdate::new().percent(50), now)
                .await
                .unwrap()
                .is_none()
        );
        let mut done = ProgressSnapshot::preparing(a, JobType::Backup, now);
        done.complete(now, None);
        store.set(a, done).await.unwrap();

        let latest = store.latest().await.unwrap();
        assert_eq!(latest.job_id, Some(b));
        assert_eq!(latest.status, ProgressStatus::Preparing);
        assert!(store.get(a).await.unwrap().is_none());
        assert!(store.get(b).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn activity_is_tracked_for_runs_that_lost_the_slot() {
        let store = LocalProgressStore::new();
        let (a, b) = (JobId::new(), JobId::new());
        let start = Utc::now() - chrono::Duration::minutes(30);

        store
            .set(a, ProgressSnapshot::preparing(a, JobType::PriceSync, start))
            .await
            .unwrap();
        store
            .set(b, ProgressSnapshot::preparing(b, JobType::Backup, start))
            .await
            .unwrap();

        let recent = Utc::now();
        store
            .update(a, &ProgressUpdate::new().percent(60), recent)
            .await
            .unwrap();
        assert!(store.get(a).await.unwrap().is_none());
        assert_eq!(store.last_activity(a).await.unwrap(), Some(recent));
        assert_eq!(store.last_activity(b).await.unwrap(), Some(start));

        // A terminal write ends the run's activity.
        let mut done = ProgressSnapshot::preparing(a, JobType::PriceSync, start);
        done.complete(recent, None);
        store.set(a, done).await.unwrap();
        assert!(store.last_activity(a).await.unwrap().is_none());
    }
}
