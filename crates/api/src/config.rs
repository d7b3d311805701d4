use std::net::SocketAddr;

use pricekeep_infra::config::{ConfigError, WorkerConfig, parse_or};

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

#[derive(Debug, Clone, PartialEq)]
pub struct ApiConfig {
    pub bind_addr: SocketAddr,
    /// Run one worker per job type inside the API process.
    pub run_workers_in_process: bool,
    pub worker: WorkerConfig,
}

impl ApiConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// `BIND_ADDR` and `RUN_WORKERS_IN_PROCESS` on top of [`WorkerConfig`].
    ///
    /// In-process workers default to on in in-memory mode, since nothing else
    /// could consume the queue there, and to off in persistent mode.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let worker = WorkerConfig::from_lookup(&lookup)?;
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let bind_addr = match get("BIND_ADDR") {
            Some(raw) => raw.parse().map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
                key: "BIND_ADDR",
                reason: e.to_string(),
                value: raw,
            })?,
            None => default_bind_addr(),
        };
        let run_workers_in_process = parse_or(
            &get,
            "RUN_WORKERS_IN_PROCESS",
            !worker.use_persistent_stores,
        )?;

        Ok(Self {
            bind_addr,
            run_workers_in_process,
            worker,
        })
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            run_workers_in_process: true,
            worker: WorkerConfig::default(),
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}
