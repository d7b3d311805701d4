//! Live progress storage.
//!
//! Progress is a best-effort view: writes may be lost, reads never wait on a
//! running job. The durable history lives in the job record store.
//!
//! ## Slot ownership
//!
//! A `Preparing` snapshot marks the start of a run and always takes over the
//! "latest" view. Any other write for a job that no longer owns the view is
//! kept per id (keyed stores) or dropped (the single-slot local store), so a
//! late completion of an older run never hides a newer one. A dropped write
//! still counts towards the run's `last_activity`.

pub mod keyed;
pub mod local;
#[cfg(feature = "redis")]
pub mod redis;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use pricekeep_core::{JobId, ProgressSnapshot, ProgressStatus, ProgressUpdate};

pub use keyed::KeyedProgressStore;
pub use local::LocalProgressStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisProgressStore;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProgressStoreError {
    #[error("progress storage error: {0}")]
    Storage(String),
    #[error("progress serialization error: {0}")]
    Serialization(String),
}

#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Snapshot of the most recently started run; Idle when nothing ran yet.
    async fn latest(&self) -> Result<ProgressSnapshot, ProgressStoreError>;

    /// Snapshot of one run, if the store still has it.
    async fn get(&self, id: JobId) -> Result<Option<ProgressSnapshot>, ProgressStoreError>;

    /// Replace the snapshot of `id`.
    async fn set(&self, id: JobId, snapshot: ProgressSnapshot) -> Result<(), ProgressStoreError>;

    /// Merge `update` into the snapshot of `id`.
    ///
    /// Returns the merged snapshot, or `None` when the store has nothing for `id`.
    async fn update(
        &self,
        id: JobId,
        update: &ProgressUpdate,
        at: DateTime<Utc>,
    ) -> Result<Option<ProgressSnapshot>, ProgressStoreError>;

    /// Most recent progress write seen for `id`, even one the latest view dropped.
    async fn last_activity(&self, id: JobId) -> Result<Option<DateTime<Utc>>, ProgressStoreError> {
        Ok(self.get(id).await?.and_then(|s| s.last_activity()))
    }
}

#[async_trait]
impl<S> ProgressStore for Arc<S>
where
    S: ProgressStore + ?Sized,
{
    async fn latest(&self) -> Result<ProgressSnapshot, ProgressStoreError> {
        (**self).latest().await
    }

    async fn get(&self, id: JobId) -> Result<Option<ProgressSnapshot>, ProgressStoreError> {
        (**self).get(id).await
    }

    async fn set(&self, id: JobId, snapshot: ProgressSnapshot) -> Result<(), ProgressStoreError> {
        (**self).set(id, snapshot).await
    }

    async fn update(
        &self,
        id: JobId,
        update: &ProgressUpdate,
        at: DateTime<Utc>,
    ) -> Result<Option<ProgressSnapshot>, ProgressStoreError> {
        (**self).update(id, update, at).await
    }

    async fn last_activity(&self, id: JobId) -> Result<Option<DateTime<Utc>>, ProgressStoreError> {
        (**self).last_activity(id).await
    }
}

/// True when `snapshot` opens a new run and should take over the latest view.
pub(crate) fn starts_run(snapshot: &ProgressSnapshot) -> bool {
    snapshot.status == ProgressStatus::Preparing
}
