//! Infrastructure layer: queue backends, record and progress stores, handlers,
//! the per-type worker and the wiring that ties them to configuration.

pub mod bootstrap;
pub mod config;
pub mod dispatcher;
pub mod handlers;
pub mod jobs;
pub mod notify;
pub mod progress;
pub mod queue;
pub mod stale;


pub use bootstrap::{BootstrapError, JobSystem};
pub use config::{ConfigError, WorkerConfig};
pub use dispatcher::{Dispatcher, EnqueueError};
pub use notify::{BroadcastNotifier, CompletionNotifier, JobCompletion};
pub use stale::StaleRunDetector;
