//! In-memory progress store keyed by job id.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use pricekeep_core::{JobId, ProgressSnapshot, ProgressUpdate};

use super::{ProgressStore, ProgressStoreError, starts_run};

const DEFAULT_CAPACITY: usize = 1_000;

#[derive(Debug, Default)]
struct Inner {
    by_id: HashMap<JobId, ProgressSnapshot>,
    latest: Option<JobId>,
}

/// Per-run snapshots plus a pointer to the most recently started run.
///
/// Keeps at most `capacity` runs; the oldest started runs are evicted first.
#[derive(Debug)]
pub struct KeyedProgressStore {
    inner: RwLock<Inner>,
    capacity: usize,
}

impl Default for KeyedProgressStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl KeyedProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|i| i.by_id.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned() -> ProgressStoreError {
        ProgressStoreError::Storage("progress map lock poisoned".to_string())
    }

    fn evict(inner: &mut Inner, capacity: usize) {
        while inner.by_id.len() > capacity {
            let oldest = inner
                .by_id
                .iter()
                .filter(|(id, _)| Some(**id) != inner.latest)
                .min_by_key(|(id, snap)| (snap.start_time, **id))
                .map(|(id, _)| *id);
            match oldest {
                Some(id) => {
                    inner.by_id.remove(&id);
                }
                None => break,
            }
        }
    }
}

#[async_trait]
impl ProgressStore for KeyedProgressStore {
    async fn latest(&self) -> Result<ProgressSnapshot, ProgressStoreError> {
        let inner = self.inner.read().map_err(|_| Self::poisoned())?;
        Ok(inner
            .latest
            .and_then(|id| inner.by_id.get(&id).cloned())
            .unwrap_or_default())
    }

    async fn get(&self, id: JobId) -> Result<Option<ProgressSnapshot>, ProgressStoreError> {
        let inner = self.inner.read().map_err(|_| Self::poisoned())?;
        Ok(inner.by_id.get(&id).cloned())
    }

    async fn set(&self, id: JobId, snapshot: ProgressSnapshot) -> Result<(), ProgressStoreError> {
        let mut inner = self.inner.write().map_err(|_| Self::poisoned())?;
        if starts_run(&snapshot) || inner.latest.is_none() {
            inner.latest = Some(id);
        }
        inner.by_id.insert(
            id,
            ProgressSnapshot {
                job_id: Some(id),
                ..snapshot
            },
        );
        Self::evict(&mut inner, self.capacity);
        Ok(())
    }

    async fn update(
        &self,
        id: JobId,
        update: &ProgressUpdate,
        at: DateTime<Utc>,
    ) -> Result<Option<ProgressSnapshot>, ProgressStoreError> {
        let mut inner = self.inner.write().map_err(|_| Self::poisoned())?;
        Ok(inner.by_id.get_mut(&id).map(|snap| {
            snap.apply(update, at);
            snap.clone()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pricekeep_core::{JobType, ProgressStatus};

    #[tokio::test]
    async fn tracks_runs_independently() {
        let store = KeyedProgressStore::new();
        let (a, b) = (JobId::new(), JobId::new());
        let now = Utc::now();

        store
            .set(a, ProgressSnapshot::preparing(a, JobType::PriceSync, now))
            .await
            .unwrap();
        store
            .set(b, ProgressSnapshot::preparing(b, JobType::EmailSend, now))
            .await
            .unwrap();
        store
            .update(a, &ProgressUpdate::new().status(ProgressStatus::Running).percent(40), now)
            .await
            .unwrap();

        assert_eq!(store.get(a).await.unwrap().unwrap().percent, 40);
        assert_eq!(store.get(b).await.unwrap().unwrap().percent, 0);
        assert_eq!(store.latest().await.unwrap().job_id, Some(b));

        // Completing the older run keeps `b` as latest.
        let mut done = store.get(a).await.unwrap().unwrap();
        done.complete(now, None);
        store.set(a, done).await.unwrap();
        assert_eq!(store.latest().await.unwrap().job_id, Some(b));
        assert_eq!(store.get(a).await.unwrap().unwrap().status, ProgressStatus::Completed);
    }

    #[tokio::test]
    async fn update_of_unknown_run_is_none() {
        let store = KeyedProgressStore::new();
        let res = store
            .update(JobId::new(), &ProgressUpdate::new().percent(10), Utc::now())
            .await
            .unwrap();
        assert!(res.is_none());
        assert_eq!(store.latest().await.unwrap().status, ProgressStatus::Idle);
    }

    #[tokio::test]
    async fn evicts_oldest_runs_beyond_capacity() {
        let store = KeyedProgressStore::with_capacity(2);
        let base = Utc::now();
        let ids: Vec<JobId> = (0..3).map(|_| JobId::new()).collect();

        for (i, id) in ids.iter().enumerate() {
            let at = base + chrono::Duration::seconds(i as i64);
            store
                .set(*id, ProgressSnapshot::preparing(*id, JobType::Backup, at))
                .await
                .unwrap();
        }

        assert_eq!(store.len(), 2);
        assert!(store.get(ids[0]).await.unwrap().is_none());
        assert_eq!(store.latest().await.unwrap().job_id, Some(ids[2]));
    }
}
