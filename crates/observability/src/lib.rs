//! Log setup shared by the API and worker binaries.

pub mod tracing;

pub use self::tracing::{DEFAULT_FILTER, LogFormat, UnknownLogFormat, init_with};

/// Install the global subscriber with the format from `LOG_FORMAT`.
///
/// Later calls leave the first subscriber in place.
pub fn init() {
    self::tracing::init();
}
