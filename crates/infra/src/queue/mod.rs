//! Job queue backends beyond the in-memory one in `pricekeep-queue`.

#[cfg(feature = "redis")]
pub mod redis_streams;

pub use pricekeep_queue::{Delivery, InMemoryJobQueue, JobQueue, QueueError, QueuedJob};

#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsJobQueue;
