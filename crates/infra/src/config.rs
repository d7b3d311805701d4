//! Environment configuration for the job system.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} must be set when USE_PERSISTENT_STORES=true")]
    Missing { key: &'static str },
    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Settings shared by the worker binary and the API's in-process workers.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Postgres records + Redis queue/progress instead of in-memory backends.
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
    pub redis_url: String,
    /// Pause before re-checking a busy job type.
    pub guard_retry_interval: Duration,
    /// Heartbeat silence after which a running job may be taken over.
    pub run_lease: Duration,
    /// Inactivity after which a running job is reported as stale.
    pub stale_grace: Duration,
    pub backup_dir: PathBuf,
    /// Tables included in backups; empty means all tables.
    pub backup_tables: Vec<String>,
    pub price_source_url: Option<String>,
    pub progress_ttl: Duration,
    /// Redis consumer name; must be unique per worker process.
    pub consumer_name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            use_persistent_stores: false,
            database_url: None,
            redis_url: DEFAULT_REDIS_URL.to_string(),
            guard_retry_interval: Duration::from_millis(1000),
            run_lease: Duration::from_secs(120),
            stale_grace: Duration::from_secs(900),
            backup_dir: PathBuf::from("./backups"),
            backup_tables: Vec::new(),
            price_source_url: None,
            progress_ttl: Duration::from_secs(86_400),
            consumer_name: format!("worker-{}", std::process::id()),
        }
    }
}

impl WorkerConfig {
    /// Load from the process environment (after an optional `.env`).
    ///
    /// | Env Var                   | Default                  |
    /// |---------------------------|--------------------------|
    /// | `USE_PERSISTENT_STORES`   | `false`                  |
    /// | `DATABASE_URL`            | required when persistent |
    /// | `REDIS_URL`               | `redis://localhost:6379` |
    /// | `WORKER_GUARD_RETRY_MS`   | `1000`                   |
    /// | `WORKER_LEASE_SECS`       | `120`                    |
    /// | `WORKER_STALE_GRACE_SECS` | `900`                    |
    /// | `BACKUP_DIR`              | `./backups`              |
    /// | `BACKUP_TABLES`           | all tables               |
    /// | `PRICE_SOURCE_URL`        | unset                    |
    /// | `PROGRESS_TTL_SECS`       | `86400`                  |
    /// | `WORKER_CONSUMER_NAME`    | `worker-<pid>`           |
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let use_persistent_stores = parse_or(&get, "USE_PERSISTENT_STORES", false)?;
        let database_url = get("DATABASE_URL");
        if use_persistent_stores && database_url.is_none() {
            return Err(ConfigError::Missing { key: "DATABASE_URL" });
        }

        Ok(Self {
            use_persistent_stores,
            database_url,
            redis_url: get("REDIS_URL").unwrap_or(defaults.redis_url),
            guard_retry_interval: Duration::from_millis(parse_or(
                &get,
                "WORKER_GUARD_RETRY_MS",
                defaults.guard_retry_interval.as_millis() as u64,
            )?),
            run_lease: Duration::from_secs(parse_or(
                &get,
                "WORKER_LEASE_SECS",
                defaults.run_lease.as_secs(),
            )?),
            stale_grace: Duration::from_secs(parse_or(
                &get,
                "WORKER_STALE_GRACE_SECS",
                defaults.stale_grace.as_secs(),
            )?),
            backup_dir: get("BACKUP_DIR").map(PathBuf::from).unwrap_or(defaults.backup_dir),
            backup_tables: get("BACKUP_TABLES")
                .map(|raw| split_list(&raw))
                .unwrap_or_default(),
            price_source_url: get("PRICE_SOURCE_URL"),
            progress_ttl: Duration::from_secs(parse_or(
                &get,
                "PROGRESS_TTL_SECS",
                defaults.progress_ttl.as_secs(),
            )?),
            consumer_name: get("WORKER_CONSUMER_NAME").unwrap_or(defaults.consumer_name),
        })
    }
}

/// Parse `key` with `FromStr`, or `default` when unset.
pub fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
            value,
        }),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = WorkerConfig::from_lookup(lookup(&[])).unwrap();
        assert!(!config.use_persistent_stores);
        assert_eq!(config.redis_url, DEFAULT_REDIS_URL);
        assert_eq!(config.guard_retry_interval, Duration::from_millis(1000));
        assert_eq!(config.run_lease, Duration::from_secs(120));
        assert_eq!(config.stale_grace, Duration::from_secs(900));
        assert_eq!(config.progress_ttl, Duration::from_secs(86_400));
        assert!(config.backup_tables.is_empty());
    }

    #[test]
    fn values_are_parsed() {
        let config = WorkerConfig::from_lookup(lookup(&[
            ("USE_PERSISTENT_STORES", "true"),
            ("DATABASE_URL", "postgres://localhost/pricekeep"),
            ("WORKER_GUARD_RETRY_MS", "250"),
            ("WORKER_LEASE_SECS", "45"),
            ("BACKUP_TABLES", "products, prices,,stores "),
            ("PRICE_SOURCE_URL", "http://prices.local"),
        ]))
        .unwrap();

        assert!(config.use_persistent_stores);
        assert_eq!(config.guard_retry_interval, Duration::from_millis(250));
        assert_eq!(config.run_lease, Duration::from_secs(45));
        assert_eq!(config.backup_tables, vec!["products", "prices", "stores"]);
        assert_eq!(config.price_source_url.as_deref(), Some("http://prices.local"));
    }

    #[test]
    fn persistent_mode_requires_database_url() {
        let err = WorkerConfig::from_lookup(lookup(&[("USE_PERSISTENT_STORES", "true")])).unwrap_err();
        assert_eq!(err, ConfigError::Missing { key: "DATABASE_URL" });
    }

    #[test]
    fn invalid_numbers_are_reported_with_their_key() {
        let err = WorkerConfig::from_lookup(lookup(&[("WORKER_GUARD_RETRY_MS", "soon")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { key: "WORKER_GUARD_RETRY_MS", ref value, .. } if value == "soon"
        ));
    }
}
