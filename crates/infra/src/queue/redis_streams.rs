//! Redis Streams-backed job queue (durable, at-least-once delivery).
//!
//! ## Layout
//!
//! - **Stream key**: `pricekeep:jobs:<type>`, one stream per job type
//! - **Consumer group**: `pricekeep:workers:<type>`, shared by every worker of a type
//! - **Entry fields**: `id`, `type`, `payload` (the JSON `QueuedJob`)
//!
//! ## Delivery
//!
//! A consumer first re-reads its own pending entries (delivered before a crash,
//! never acked), then claims entries other consumers left idle for longer than
//! the claim timeout, and only then blocks for new entries. `touch` resets an
//! entry's idle time while its run is alive. `ack` removes the entry from the
//! pending list and the stream.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamClaimReply, StreamId, StreamReadReply};
use tracing::{debug, error, instrument, warn};

use pricekeep_core::{JobRequest, JobType};
use pricekeep_queue::{Delivery, JobQueue, QueueError, QueuedJob};

const DEFAULT_PREFIX: &str = "pricekeep";

/// How long a `receive` blocks on the stream before re-checking for shutdown.
const DEFAULT_BLOCK: Duration = Duration::from_secs(5);

/// Entries idle this long in another consumer's pending list are taken over.
const DEFAULT_CLAIM_IDLE: Duration = Duration::from_secs(300);

#[derive(Debug)]
pub struct RedisStreamsJobQueue {
    client: Arc<redis::Client>,
    prefix: String,
    consumer: String,
    block: Duration,
    claim_idle: Duration,
    groups_ready: Mutex<HashSet<JobType>>,
    own_pending_drained: Mutex<HashSet<JobType>>,
    closed: AtomicBool,
}

impl RedisStreamsJobQueue {
    /// `consumer` must be unique per worker process.
    pub fn new(redis_url: impl AsRef<str>, consumer: impl Into<String>) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            prefix: DEFAULT_PREFIX.to_string(),
            consumer: consumer.into(),
            block: DEFAULT_BLOCK,
            claim_idle: DEFAULT_CLAIM_IDLE,
            groups_ready: Mutex::default(),
            own_pending_drained: Mutex::default(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    pub fn with_claim_idle(mut self, claim_idle: Duration) -> Self {
        self.claim_idle = claim_idle;
        self
    }

    /// Make pending and future `receive` calls return [`QueueError::Closed`]
    /// once their current block times out.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn stream_key(&self, job_type: JobType) -> String {
        format!("{}:jobs:{}", self.prefix, job_type)
    }

    fn group_name(&self, job_type: JobType) -> String {
        format!("{}:workers:{}", self.prefix, job_type)
    }

    async fn connection(&self) -> Result<MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::Unavailable(format!("redis connection failed: {e}")))
    }

    fn flagged(set: &Mutex<HashSet<JobType>>, job_type: JobType) -> bool {
        set.lock().map(|s| s.contains(&job_type)).unwrap_or(false)
    }

    fn flag(set: &Mutex<HashSet<JobType>>, job_type: JobType) {
        if let Ok(mut s) = set.lock() {
            s.insert(job_type);
        }
    }

    /// Create the consumer group (and stream) if missing.
    async fn ensure_group(
        &self,
        conn: &mut MultiplexedConnection,
        job_type: JobType,
    ) -> Result<(), QueueError> {
        if Self::flagged(&self.groups_ready, job_type) {
            return Ok(());
        }

        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(self.stream_key(job_type))
            .arg(self.group_name(job_type))
            .arg("0")
            .arg("MKSTREAM")
            .query_async(conn)
            .await;

        match created {
            Ok(_) => {}
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => {
                return Err(QueueError::Unavailable(format!("XGROUP CREATE failed: {e}")));
            }
        }

        Self::flag(&self.groups_ready, job_type);
        Ok(())
    }

    /// `XREADGROUP` one entry starting after `from` (`0` = own pending, `>` = new).
    async fn read_group(
        &self,
        conn: &mut MultiplexedConnection,
        job_type: JobType,
        from: &str,
        block: Option<Duration>,
    ) -> Result<Option<StreamId>, QueueError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(self.group_name(job_type))
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(1);
        if let Some(block) = block {
            cmd.arg("BLOCK").arg(block.as_millis() as u64);
        }
        cmd.arg("STREAMS").arg(self.stream_key(job_type)).arg(from);

        let reply: Option<StreamReadReply> = cmd
            .query_async(conn)
            .await
            .map_err(|e| QueueError::Unavailable(format!("XREADGROUP failed: {e}")))?;

        Ok(reply
            .and_then(|r| r.keys.into_iter().next())
            .and_then(|k| k.ids.into_iter().next()))
    }

    /// Take over one entry another consumer left idle past the claim timeout.
    async fn claim_idle(
        &self,
        conn: &mut MultiplexedConnection,
        job_type: JobType,
    ) -> Result<Option<(StreamId, u32)>, QueueError> {
        let idle_ms = self.claim_idle.as_millis() as u64;
        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(self.stream_key(job_type))
            .arg(self.group_name(job_type))
            .arg("IDLE")
            .arg(idle_ms)
            .arg("-")
            .arg("+")
            .arg(1)
            .query_async(conn)
            .await
            .map_err(|e| QueueError::Unavailable(format!("XPENDING failed: {e}")))?;

        let Some((entry_id, owner, _, deliveries)) = pending.into_iter().next() else {
            return Ok(None);
        };

        let claimed: StreamClaimReply = redis::cmd("XCLAIM")
            .arg(self.stream_key(job_type))
            .arg(self.group_name(job_type))
            .arg(&self.consumer)
            .arg(idle_ms)
            .arg(&entry_id)
            .query_async(conn)
            .await
            .map_err(|e| QueueError::Unavailable(format!("XCLAIM failed: {e}")))?;

        let Some(entry) = claimed.ids.into_iter().next() else {
            // Another consumer claimed it first.
            return Ok(None);
        };
        warn!(entry_id = %entry_id, previous_owner = %owner, "claimed idle job entry");
        Ok(Some((entry, deliveries as u32 + 1)))
    }

    fn parse_entry(entry: &StreamId) -> Result<QueuedJob, QueueError> {
        let payload: String = entry
            .get("payload")
            .ok_or_else(|| QueueError::Deserialization(format!("entry {} has no payload", entry.id)))?;
        QueuedJob::from_json(&payload).map_err(|e| QueueError::Deserialization(e.to_string()))
    }

    async fn settle(
        &self,
        conn: &mut MultiplexedConnection,
        job_type: JobType,
        receipt: &str,
    ) -> Result<(), QueueError> {
        let stream = self.stream_key(job_type);
        let _: () = redis::pipe()
            .atomic()
            .cmd("XACK")
            .arg(&stream)
            .arg(self.group_name(job_type))
            .arg(receipt)
            .ignore()
            .cmd("XDEL")
            .arg(&stream)
            .arg(receipt)
            .ignore()
            .query_async(conn)
            .await
            .map_err(|e| QueueError::Unavailable(format!("XACK failed: {e}")))?;
        Ok(())
    }

    /// Turn a raw entry into a delivery; unreadable entries are dropped.
    async fn deliver(
        &self,
        conn: &mut MultiplexedConnection,
        job_type: JobType,
        entry: StreamId,
        attempt: u32,
    ) -> Result<Option<Delivery>, QueueError> {
        match Self::parse_entry(&entry) {
            Ok(job) => Ok(Some(Delivery {
                job,
                receipt: entry.id,
                attempt,
            })),
            Err(e) => {
                error!(entry_id = %entry.id, error = %e, "dropping unreadable job entry");
                self.settle(conn, job_type, &entry.id).await?;
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl JobQueue for RedisStreamsJobQueue {
    #[instrument(skip_all, fields(job_type = %request.job_type), err)]
    async fn push(&self, request: JobRequest) -> Result<QueuedJob, QueueError> {
        let job = QueuedJob::assign(request);
        let payload = job
            .to_json()
            .map_err(|e| QueueError::Serialization(e.to_string()))?;

        let mut conn = self.connection().await?;
        let entry_id: String = redis::cmd("XADD")
            .arg(self.stream_key(job.job_type))
            .arg("*")
            .arg("id")
            .arg(job.id.to_string())
            .arg("type")
            .arg(job.job_type.as_str())
            .arg("payload")
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Unavailable(format!("XADD failed: {e}")))?;

        debug!(job_id = %job.id, entry_id = %entry_id, "job appended to stream");
        Ok(job)
    }

    async fn receive(&self, job_type: JobType) -> Result<Delivery, QueueError> {
        // A dedicated connection: a blocking XREADGROUP would stall every other
        // command sharing a multiplexed one.
        let mut conn = self.connection().await?;
        self.ensure_group(&mut conn, job_type).await?;

        while !Self::flagged(&self.own_pending_drained, job_type) {
            match self.read_group(&mut conn, job_type, "0", None).await? {
                Some(entry) => {
                    if let Some(delivery) = self.deliver(&mut conn, job_type, entry, 2).await? {
                        debug!(job_id = %delivery.id(), "redelivering own pending entry");
                        return Ok(delivery);
                    }
                }
                None => Self::flag(&self.own_pending_drained, job_type),
            }
        }

        if let Some((entry, attempt)) = self.claim_idle(&mut conn, job_type).await? {
            if let Some(delivery) = self.deliver(&mut conn, job_type, entry, attempt).await? {
                return Ok(delivery);
            }
        }

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(QueueError::Closed);
            }
            let Some(entry) = self
                .read_group(&mut conn, job_type, ">", Some(self.block))
                .await?
            else {
                continue;
            };
            if let Some(delivery) = self.deliver(&mut conn, job_type, entry, 1).await? {
                return Ok(delivery);
            }
        }
    }

    #[instrument(skip_all, fields(job_id = %delivery.id(), receipt = %delivery.receipt), err)]
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        self.settle(&mut conn, delivery.job.job_type, &delivery.receipt)
            .await
    }

    /// Re-claim the entry for ourselves with `JUSTID`, resetting its idle time.
    #[instrument(skip_all, fields(job_id = %delivery.id(), receipt = %delivery.receipt), err)]
    async fn touch(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let job_type = delivery.job.job_type;
        let mut conn = self.connection().await?;
        let claimed: Vec<String> = redis::cmd("XCLAIM")
            .arg(self.stream_key(job_type))
            .arg(self.group_name(job_type))
            .arg(&self.consumer)
            .arg(0)
            .arg(&delivery.receipt)
            .arg("JUSTID")
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Unavailable(format!("XCLAIM failed: {e}")))?;
        if claimed.is_empty() {
            warn!("entry is no longer pending; it was acked elsewhere");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_per_job_type() {
        let queue = RedisStreamsJobQueue::new("redis://localhost:6379", "worker-1").unwrap();
        assert_eq!(queue.stream_key(JobType::PriceSync), "pricekeep:jobs:price_sync");
        assert_eq!(queue.group_name(JobType::Backup), "pricekeep:workers:backup");

        let queue = queue.with_prefix("test");
        assert_eq!(queue.stream_key(JobType::EmailSend), "test:jobs:email_send");
    }

    #[test]
    fn invalid_url_is_reported_as_unavailable() {
        let err = RedisStreamsJobQueue::new("not a url", "worker-1").unwrap_err();
        assert!(err.is_unavailable());
    }
}
