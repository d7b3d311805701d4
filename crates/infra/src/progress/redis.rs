//! Redis-backed progress store shared by the API and worker processes.
//!
//! ## Keys
//!
//! - `pricekeep:progress:<job_id>`: JSON snapshot, expires after the TTL
//! - `pricekeep:progress:latest`: id of the most recently started run
//!
//! Writes for one run are serialized by the worker's progress forwarder, so the
//! read-merge-write in `update` does not need a transaction.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::instrument;

use pricekeep_core::{JobId, ProgressSnapshot, ProgressUpdate};

use super::{ProgressStore, ProgressStoreError, starts_run};

const DEFAULT_PREFIX: &str = "pricekeep:progress";

#[derive(Debug, Clone)]
pub struct RedisProgressStore {
    client: Arc<redis::Client>,
    prefix: String,
    ttl: Duration,
}

impl RedisProgressStore {
    pub fn new(redis_url: impl AsRef<str>, ttl: Duration) -> Result<Self, ProgressStoreError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| ProgressStoreError::Storage(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            prefix: DEFAULT_PREFIX.to_string(),
            ttl,
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn key(&self, id: JobId) -> String {
        format!("{}:{}", self.prefix, id)
    }

    fn latest_key(&self) -> String {
        format!("{}:latest", self.prefix)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, ProgressStoreError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| ProgressStoreError::Storage(format!("redis connection failed: {e}")))
    }

    async fn read(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        id: JobId,
    ) -> Result<Option<ProgressSnapshot>, ProgressStoreError> {
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.key(id))
            .query_async(conn)
            .await
            .map_err(|e| ProgressStoreError::Storage(format!("GET failed: {e}")))?;

        raw.map(|json| {
            serde_json::from_str(&json)
                .map_err(|e| ProgressStoreError::Serialization(e.to_string()))
        })
        .transpose()
    }

    async fn write(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        id: JobId,
        snapshot: &ProgressSnapshot,
        take_latest: bool,
    ) -> Result<(), ProgressStoreError> {
        let json = serde_json::to_string(snapshot)
            .map_err(|e| ProgressStoreError::Serialization(e.to_string()))?;
        let ttl_secs = self.ttl.as_secs().max(1);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SET")
            .arg(self.key(id))
            .arg(json)
            .arg("EX")
            .arg(ttl_secs)
            .ignore();
        if take_latest {
            pipe.cmd("SET")
                .arg(self.latest_key())
                .arg(id.to_string())
                .arg("EX")
                .arg(ttl_secs)
                .ignore();
        }

        let _: () = pipe
            .query_async(conn)
            .await
            .map_err(|e| ProgressStoreError::Storage(format!("SET failed: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl ProgressStore for RedisProgressStore {
    #[instrument(skip(self), err)]
    async fn latest(&self) -> Result<ProgressSnapshot, ProgressStoreError> {
        let mut conn = self.connection().await?;
        let latest: Option<String> = redis::cmd("GET")
            .arg(self.latest_key())
            .query_async(&mut conn)
            .await
            .map_err(|e| ProgressStoreError::Storage(format!("GET failed: {e}")))?;

        let Some(id) = latest.and_then(|raw| raw.parse::<JobId>().ok()) else {
            return Ok(ProgressSnapshot::idle());
        };
        Ok(self.read(&mut conn, id).await?.unwrap_or_default())
    }

    #[instrument(skip_all, fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<ProgressSnapshot>, ProgressStoreError> {
        let mut conn = self.connection().await?;
        self.read(&mut conn, id).await
    }

    #[instrument(skip_all, fields(job_id = %id, status = ?snapshot.status), err)]
    async fn set(&self, id: JobId, snapshot: ProgressSnapshot) -> Result<(), ProgressStoreError> {
        let mut conn = self.connection().await?;
        let snapshot = ProgressSnapshot {
            job_id: Some(id),
            ..snapshot
        };
        self.write(&mut conn, id, &snapshot, starts_run(&snapshot))
            .await
    }

    #[instrument(skip_all, fields(job_id = %id), err)]
    async fn update(
        &self,
        id: JobId,
        update: &ProgressUpdate,
        at: DateTime<Utc>,
    ) -> Result<Option<ProgressSnapshot>, ProgressStoreError> {
        let mut conn = self.connection().await?;
        let Some(mut snapshot) = self.read(&mut conn, id).await? else {
            return Ok(None);
        };
        snapshot.apply(update, at);
        self.write(&mut conn, id, &snapshot, false).await?;
        Ok(Some(snapshot))
    }
}
