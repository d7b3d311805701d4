//! Job record storage.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use pricekeep_core::{JobId, JobRecord, JobStatus, JobType};

/// Default page size for record listings.
pub const DEFAULT_LIST_LIMIT: usize = 50;

/// Upper bound on a single record listing.
pub const MAX_LIST_LIMIT: usize = 500;

/// Outcome of [`JobRecordStore::try_start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// The record moved `Pending → Running`.
    Started(JobRecord),
    /// The record was `Running` but its lease had lapsed (the previous worker died).
    Resumed(JobRecord),
    /// The record already reached a terminal status; nothing changed.
    Finished(JobRecord),
    /// A job of the same type is `Running` under a live lease; nothing changed.
    ///
    /// `running` is the requested id itself when that job is still executing on
    /// another worker, and `None` when the other run finished between the check
    /// and the report.
    Busy { running: Option<JobId> },
}

/// True when a run last seen at `last` has gone quiet for longer than `lease`.
pub fn lease_expired(last: Option<DateTime<Utc>>, at: DateTime<Utc>, lease: Duration) -> bool {
    let lease = TimeDelta::from_std(lease).unwrap_or(TimeDelta::MAX);
    last.is_none_or(|last| at.signed_duration_since(last) > lease)
}

/// Filter for listing records, newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFilter {
    pub job_type: Option<JobType>,
    pub status: Option<JobStatus>,
    pub limit: usize,
}

impl Default for RecordFilter {
    fn default() -> Self {
        Self {
            job_type: None,
            status: None,
            limit: DEFAULT_LIST_LIMIT,
        }
    }
}

impl RecordFilter {
    pub fn job_type(mut self, job_type: JobType) -> Self {
        self.job_type = Some(job_type);
        self
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Clamp to `1..=MAX_LIST_LIMIT`.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit.clamp(1, MAX_LIST_LIMIT);
        self
    }

    fn matches(&self, record: &JobRecord) -> bool {
        self.job_type.is_none_or(|t| record.job_type == t)
            && self.status.is_none_or(|s| record.status == s)
    }
}

/// Job record store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job record not found: {0}")]
    NotFound(JobId),
    #[error("invalid record transition: {0}")]
    InvalidTransition(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Durable audit trail of job executions.
///
/// Only the worker writes records. The store is the arbiter of the
/// per-type concurrency guard: [`try_start`](Self::try_start) must be atomic
/// with respect to other callers of the same store.
///
/// A running record holds a lease that its worker renews with
/// [`heartbeat`](Self::heartbeat). Only a record whose lease lapsed may be
/// resumed by another worker.
#[async_trait]
pub trait JobRecordStore: Send + Sync {
    /// Insert `record` unless a record with the same id exists; returns the stored record.
    async fn ensure_pending(&self, record: JobRecord) -> Result<JobRecord, JobStoreError>;

    /// Move a pending record to `Running`, unless a record of `job_type` is
    /// running with a heartbeat younger than `lease`.
    async fn try_start(
        &self,
        id: JobId,
        job_type: JobType,
        at: DateTime<Utc>,
        lease: Duration,
    ) -> Result<StartOutcome, JobStoreError>;

    /// Renew the lease of a running record. `false` when it is no longer running.
    async fn heartbeat(&self, id: JobId, at: DateTime<Utc>) -> Result<bool, JobStoreError>;

    /// Persist the terminal state of a running record.
    async fn finish(&self, record: &JobRecord) -> Result<(), JobStoreError>;

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError>;

    /// Records matching `filter`, newest `created_at` first.
    async fn list(&self, filter: &RecordFilter) -> Result<Vec<JobRecord>, JobStoreError>;

    /// Most recently created record of `job_type`.
    async fn latest(&self, job_type: JobType) -> Result<Option<JobRecord>, JobStoreError> {
        let records = self
            .list(&RecordFilter::default().job_type(job_type).limit(1))
            .await?;
        Ok(records.into_iter().next())
    }

    /// Every record currently `Running` (used by stale-run detection).
    async fn running(&self) -> Result<Vec<JobRecord>, JobStoreError> {
        self.list(
            &RecordFilter::default()
                .status(JobStatus::Running)
                .limit(MAX_LIST_LIMIT),
        )
        .await
    }
}

#[async_trait]
impl<S> JobRecordStore for Arc<S>
where
    S: JobRecordStore + ?Sized,
{
    async fn ensure_pending(&self, record: JobRecord) -> Result<JobRecord, JobStoreError> {
        (**self).ensure_pending(record).await
    }

    async fn try_start(
        &self,
        id: JobId,
        job_type: JobType,
        at: DateTime<Utc>,
        lease: Duration,
    ) -> Result<StartOutcome, JobStoreError> {
        (**self).try_start(id, job_type, at, lease).await
    }

    async fn heartbeat(&self, id: JobId, at: DateTime<Utc>) -> Result<bool, JobStoreError> {
        (**self).heartbeat(id, at).await
    }

    async fn finish(&self, record: &JobRecord) -> Result<(), JobStoreError> {
        (**self).finish(record).await
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        (**self).get(id).await
    }

    async fn list(&self, filter: &RecordFilter) -> Result<Vec<JobRecord>, JobStoreError> {
        (**self).list(filter).await
    }

    async fn latest(&self, job_type: JobType) -> Result<Option<JobRecord>, JobStoreError> {
        (**self).latest(job_type).await
    }

    async fn running(&self) -> Result<Vec<JobRecord>, JobStoreError> {
        (**self).running().await
    }
}

/// In-memory record store for tests/dev.
///
/// The write lock makes `try_start` atomic within the process. Heartbeats are
/// only taken while holding it, in that order.
#[derive(Debug, Default)]
pub struct InMemoryJobRecordStore {
    records: RwLock<HashMap<JobId, JobRecord>>,
    heartbeats: Mutex<HashMap<JobId, DateTime<Utc>>>,
}

impl InMemoryJobRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn poisoned() -> JobStoreError {
        JobStoreError::Storage("record store lock poisoned".to_string())
    }
}

#[async_trait]
impl JobRecordStore for InMemoryJobRecordStore {
    async fn ensure_pending(&self, record: JobRecord) -> Result<JobRecord, JobStoreError> {
        let mut records = self.records.write().map_err(|_| Self::poisoned())?;
        Ok(records.entry(record.id).or_insert(record).clone())
    }

    async fn try_start(
        &self,
        id: JobId,
        job_type: JobType,
        at: DateTime<Utc>,
        lease: Duration,
    ) -> Result<StartOutcome, JobStoreError> {
        let mut records = self.records.write().map_err(|_| Self::poisoned())?;
        let mut heartbeats = self.heartbeats.lock().map_err(|_| Self::poisoned())?;

        let record = records.get(&id).ok_or(JobStoreError::NotFound(id))?;
        if record.status.is_terminal() {
            return Ok(StartOutcome::Finished(record.clone()));
        }

        if let Some(other) = records
            .values()
            .find(|r| r.job_type == job_type && r.status == JobStatus::Running && r.id != id)
        {
            return Ok(StartOutcome::Busy {
                running: Some(other.id),
            });
        }
        if record.status == JobStatus::Running {
            let last = heartbeats.get(&id).copied().or(record.started_at);
            if !lease_expired(last, at, lease) {
                return Ok(StartOutcome::Busy { running: Some(id) });
            }
            let record = record.clone();
            heartbeats.insert(id, at);
            return Ok(StartOutcome::Resumed(record));
        }

        let record = records.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        record
            .start(at)
            .map_err(|e| JobStoreError::InvalidTransition(e.to_string()))?;
        heartbeats.insert(id, at);
        Ok(StartOutcome::Started(record.clone()))
    }

    async fn heartbeat(&self, id: JobId, at: DateTime<Utc>) -> Result<bool, JobStoreError> {
        let records = self.records.read().map_err(|_| Self::poisoned())?;
        let running = records
            .get(&id)
            .is_some_and(|r| r.status == JobStatus::Running);
        if running {
            let mut heartbeats = self.heartbeats.lock().map_err(|_| Self::poisoned())?;
            heartbeats.insert(id, at);
        }
        Ok(running)
    }

    async fn finish(&self, record: &JobRecord) -> Result<(), JobStoreError> {
        if !record.status.is_terminal() {
            return Err(JobStoreError::InvalidTransition(format!(
                "job {} finished with non-terminal status {}",
                record.id, record.status
            )));
        }

        let mut records = self.records.write().map_err(|_| Self::poisoned())?;
        let stored = records
            .get_mut(&record.id)
            .ok_or(JobStoreError::NotFound(record.id))?;
        if stored.status != JobStatus::Running {
            return Err(JobStoreError::InvalidTransition(format!(
                "job {} is {}, not running",
                record.id, stored.status
            )));
        }
        *stored = record.clone();
        self.heartbeats
            .lock()
            .map_err(|_| Self::poisoned())?
            .remove(&record.id);
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        let records = self.records.read().map_err(|_| Self::poisoned())?;
        Ok(records.get(&id).cloned())
    }

    async fn list(&self, filter: &RecordFilter) -> Result<Vec<JobRecord>, JobStoreError> {
        let records = self.records.read().map_err(|_| Self::poisoned())?;
        let mut result: Vec<_> = records
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();

        // Ids are time ordered, so they break ties between equal timestamps.
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        result.truncate(filter.limit);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASE: Duration = Duration::from_secs(60);

    fn pending(job_type: JobType) -> JobRecord {
        JobRecord::pending(JobId::new(), job_type, Utc::now(), None)
    }

    #[tokio::test]
    async fn ensure_pending_is_idempotent() {
        let store = InMemoryJobRecordStore::new();
        let rec = pending(JobType::Backup);

        store.ensure_pending(rec.clone()).await.unwrap();
        store.try_start(rec.id, rec.job_type, Utc::now(), LEASE).await.unwrap();

        // A redelivery must not reset the record.
        let again = store.ensure_pending(rec.clone()).await.unwrap();
        assert_eq!(again.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn guard_allows_one_running_record_per_type() {
        let store = InMemoryJobRecordStore::new();
        let a = store.ensure_pending(pending(JobType::PriceSync)).await.unwrap();
        let b = store.ensure_pending(pending(JobType::PriceSync)).await.unwrap();
        let email = store.ensure_pending(pending(JobType::EmailSend)).await.unwrap();

        assert!(matches!(
            store.try_start(a.id, a.job_type, Utc::now(), LEASE).await.unwrap(),
            StartOutcome::Started(_)
        ));
        assert_eq!(
            store.try_start(b.id, b.job_type, Utc::now(), LEASE).await.unwrap(),
            StartOutcome::Busy {
                running: Some(a.id)
            }
        );
        // Other types are unaffected.
        assert!(matches!(
            store.try_start(email.id, email.job_type, Utc::now(), LEASE).await.unwrap(),
            StartOutcome::Started(_)
        ));

        let mut done = store.get(a.id).await.unwrap().unwrap();
        done.succeed(Utc::now(), "ok").unwrap();
        store.finish(&done).await.unwrap();

        assert!(matches!(
            store.try_start(b.id, b.job_type, Utc::now(), LEASE).await.unwrap(),
            StartOutcome::Started(_)
        ));
    }

    #[tokio::test]
    async fn running_record_under_a_live_lease_is_busy_for_itself() {
        let store = InMemoryJobRecordStore::new();
        let rec = store.ensure_pending(pending(JobType::Backup)).await.unwrap();
        let started = Utc::now();
        store.try_start(rec.id, rec.job_type, started, LEASE).await.unwrap();

        let later = started + TimeDelta::seconds(45);
        assert_eq!(
            store.try_start(rec.id, rec.job_type, later, LEASE).await.unwrap(),
            StartOutcome::Busy {
                running: Some(rec.id)
            }
        );

        // A heartbeat pushes the lease out past the original deadline.
        assert!(store.heartbeat(rec.id, later).await.unwrap());
        let after_heartbeat = started + TimeDelta::seconds(90);
        assert!(matches!(
            store.try_start(rec.id, rec.job_type, after_heartbeat, LEASE).await.unwrap(),
            StartOutcome::Busy { .. }
        ));
    }

    #[tokio::test]
    async fn running_record_with_a_lapsed_lease_is_resumed() {
        let store = InMemoryJobRecordStore::new();
        let rec = store.ensure_pending(pending(JobType::Backup)).await.unwrap();
        let started = Utc::now();
        store.try_start(rec.id, rec.job_type, started, LEASE).await.unwrap();

        let abandoned = started + TimeDelta::seconds(61);
        assert!(matches!(
            store.try_start(rec.id, rec.job_type, abandoned, LEASE).await.unwrap(),
            StartOutcome::Resumed(r) if r.id == rec.id
        ));
        // Resuming renews the lease for the new owner.
        assert!(matches!(
            store.try_start(rec.id, rec.job_type, abandoned + TimeDelta::seconds(1), LEASE).await.unwrap(),
            StartOutcome::Busy { running: Some(id) } if id == rec.id
        ));
    }

    #[tokio::test]
    async fn finished_record_is_reported_not_restarted() {
        let store = InMemoryJobRecordStore::new();
        let rec = store.ensure_pending(pending(JobType::Backup)).await.unwrap();
        store.try_start(rec.id, rec.job_type, Utc::now(), LEASE).await.unwrap();

        let mut done = store.get(rec.id).await.unwrap().unwrap();
        done.fail(Utc::now(), "boom").unwrap();
        store.finish(&done).await.unwrap();

        assert_eq!(
            store.try_start(rec.id, rec.job_type, Utc::now(), LEASE).await.unwrap(),
            StartOutcome::Finished(done)
        );
        assert!(!store.heartbeat(rec.id, Utc::now()).await.unwrap());
    }

    #[test]
    fn lease_expiry_is_strictly_after_the_lease() {
        let at = Utc::now();
        assert!(lease_expired(None, at, LEASE));
        assert!(!lease_expired(Some(at - TimeDelta::seconds(60)), at, LEASE));
        assert!(lease_expired(Some(at - TimeDelta::seconds(61)), at, LEASE));
    }

    #[tokio::test]
    async fn finish_rejects_records_that_are_not_running() {
        let store = InMemoryJobRecordStore::new();
        let rec = store.ensure_pending(pending(JobType::Backup)).await.unwrap();

        let mut forged = rec.clone();
        forged.status = JobStatus::Succeeded;
        assert!(matches!(
            store.finish(&forged).await,
            Err(JobStoreError::InvalidTransition(_))
        ));
        assert!(matches!(
            store.finish(&rec).await,
            Err(JobStoreError::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn list_is_newest_first_and_filtered() {
        let store = InMemoryJobRecordStore::new();
        let base = Utc::now();
        for (i, t) in [JobType::Backup, JobType::EmailSend, JobType::Backup]
            .into_iter()
            .enumerate()
        {
            let rec = JobRecord::pending(
                JobId::new(),
                t,
                base + chrono::Duration::seconds(i as i64),
                None,
            );
            store.ensure_pending(rec).await.unwrap();
        }

        let backups = store
            .list(&RecordFilter::default().job_type(JobType::Backup))
            .await
            .unwrap();
        assert_eq!(backups.len(), 2);
        assert!(backups[0].created_at > backups[1].created_at);

        let latest = store.latest(JobType::Backup).await.unwrap().unwrap();
        assert_eq!(latest.id, backups[0].id);
        assert!(store.latest(JobType::PriceSync).await.unwrap().is_none());

        let one = store.list(&RecordFilter::default().limit(0)).await.unwrap();
        assert_eq!(one.len(), 1);
    }
}
