//! Tracing/logging initialization.
//!
//! JSON lines by default so job events (`job_id`, `job_type`, `worker`) can be
//! filtered by field; `LOG_FORMAT=pretty` for local development. The filter
//! comes from `RUST_LOG` and falls back to [`DEFAULT_FILTER`].

use std::str::FromStr;

use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "info,sqlx=warn";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown log format '{0}' (expected json or pretty)")]
pub struct UnknownLogFormat(pub String);

impl FromStr for LogFormat {
    type Err = UnknownLogFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "text" => Ok(LogFormat::Pretty),
            _ => Err(UnknownLogFormat(s.to_string())),
        }
    }
}

/// Initialize tracing using `LOG_FORMAT` (default JSON).
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    let format = match std::env::var("LOG_FORMAT") {
        Ok(raw) => raw.parse().unwrap_or_else(|e: UnknownLogFormat| {
            eprintln!("{e}; using json");
            LogFormat::Json
        }),
        Err(_) => LogFormat::Json,
    };
    init_with(format);
}

/// Initialize tracing with an explicit format. Returns false if a global
/// subscriber was already installed.
pub fn init_with(format: LogFormat) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false);

    match format {
        LogFormat::Json => builder.json().try_init().is_ok(),
        LogFormat::Pretty => builder.pretty().try_init().is_ok(),
    }
}
