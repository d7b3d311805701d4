//! Job queue mechanics (transport only).
//!
//! The queue carries [`QueuedJob`] envelopes from the dispatcher to the
//! per-type worker loops. Delivery is **at-least-once**: a delivery that is not
//! acked is handed out again after a consumer restart, so consumers must be
//! idempotent on the job id.

pub mod envelope;
pub mod in_memory;
pub mod queue;

pub use envelope::{Delivery, QueuedJob};
pub use in_memory::InMemoryJobQueue;
pub use queue::{JobQueue, QueueError};
