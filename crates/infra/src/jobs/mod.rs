//! Job execution: record stores, the handler contract, progress reporting and
//! the per-type worker loop.
//!
//! ## Components
//!
//! - `JobRecordStore`: durable audit trail and the one-running-per-type guard
//! - `JobHandler`: the unit of work for a job type
//! - `ProgressReporter` / `ProgressForwarder`: fire-and-forget progress updates
//! - `Worker`: pulls deliveries for one type and drives them to a terminal state

pub mod handler;
pub mod postgres;
pub mod reporter;
pub mod store;
pub mod worker;

pub use handler::{JobHandler, JobOutput};
pub use postgres::PostgresJobRecordStore;
pub use reporter::{ProgressForwarder, ProgressReporter};
pub use store::{
    InMemoryJobRecordStore, JobRecordStore, JobStoreError, RecordFilter, StartOutcome,
    DEFAULT_LIST_LIMIT, MAX_LIST_LIMIT,
};
pub use worker::{ProcessOutcome, Worker, WorkerError, WorkerHandle, WorkerSettings};
