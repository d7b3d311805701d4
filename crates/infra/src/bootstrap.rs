//! Wiring of queue, stores, handlers and workers from a [`WorkerConfig`].
//!
//! Two modes:
//!
//! - in-memory (default): everything lives in this process; the API runs the
//!   workers itself
//! - persistent (`USE_PERSISTENT_STORES=true`, needs the `redis` feature):
//!   Postgres job records, Redis Streams queue and Redis progress, so API and
//!   worker processes can run separately

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pricekeep_core::JobType;
use pricekeep_queue::{InMemoryJobQueue, JobQueue};

use crate::config::WorkerConfig;
use crate::dispatcher::Dispatcher;
use crate::handlers::{
    BackupHandler, EmailSendHandler, FilesystemArtifactStorage, HttpPriceSource,
    InMemoryBackupSource, InMemoryPriceCatalog, LogEmailTransport, PriceSource, PriceSyncHandler,
    UnconfiguredPriceSource,
};
use crate::jobs::{
    InMemoryJobRecordStore, JobHandler, JobRecordStore, Worker, WorkerHandle, WorkerSettings,
};
use crate::notify::BroadcastNotifier;
use crate::progress::{LocalProgressStore, ProgressStore};
use crate::stale::StaleRunDetector;

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("database error: {0}")]
    Database(String),
    #[error("queue error: {0}")]
    Queue(String),
    #[error("progress store error: {0}")]
    Progress(String),
    #[error("price source error: {0}")]
    PriceSource(String),
}

/// Everything needed to enqueue, execute and observe jobs.
#[derive(Clone)]
pub struct JobSystem {
    pub queue: Arc<dyn JobQueue>,
    pub records: Arc<dyn JobRecordStore>,
    pub progress: Arc<dyn ProgressStore>,
    pub notifier: Arc<BroadcastNotifier>,
    handlers: BTreeMap<JobType, Arc<dyn JobHandler>>,
    config: WorkerConfig,
}

impl JobSystem {
    /// Build the backends selected by `config`.
    pub async fn from_config(config: &WorkerConfig) -> Result<Self, BootstrapError> {
        if config.use_persistent_stores {
            #[cfg(feature = "redis")]
            {
                return Self::persistent(config).await;
            }
            #[cfg(not(feature = "redis"))]
            {
                warn!(
                    "USE_PERSISTENT_STORES=true but redis feature not enabled, falling back to in-memory"
                );
            }
        }
        Self::in_memory(config)
    }

    /// Single-process backends; nothing survives a restart.
    pub fn in_memory(config: &WorkerConfig) -> Result<Self, BootstrapError> {
        let price_source = price_source(config)?;
        let handlers: Vec<Arc<dyn JobHandler>> = vec![
            Arc::new(BackupHandler::new(
                Arc::new(InMemoryBackupSource::new()),
                Arc::new(FilesystemArtifactStorage::new(&config.backup_dir)),
            )),
            Arc::new(PriceSyncHandler::new(
                Arc::new(InMemoryPriceCatalog::new()),
                price_source,
            )),
            Arc::new(EmailSendHandler::new(Arc::new(LogEmailTransport))),
        ];

        info!(mode = "in-memory", "job system ready");
        Ok(Self::assemble(
            Arc::new(InMemoryJobQueue::new()),
            Arc::new(InMemoryJobRecordStore::new()),
            Arc::new(LocalProgressStore::new()),
            handlers,
            config,
        ))
    }

    #[cfg(feature = "redis")]
    async fn persistent(config: &WorkerConfig) -> Result<Self, BootstrapError> {
        use crate::handlers::{PostgresBackupSource, PostgresPriceCatalog, PriceCatalog};
        use crate::jobs::PostgresJobRecordStore;
        use crate::progress::RedisProgressStore;
        use crate::queue::RedisStreamsJobQueue;

        let database_url = config
            .database_url
            .as_deref()
            .ok_or_else(|| BootstrapError::Database("DATABASE_URL is not set".to_string()))?;
        let pool = sqlx::PgPool::connect(database_url)
            .await
            .map_err(|e| BootstrapError::Database(e.to_string()))?;

        let records = PostgresJobRecordStore::new(pool.clone());
        records
            .migrate()
            .await
            .map_err(|e| BootstrapError::Database(e.to_string()))?;
        let catalog = PostgresPriceCatalog::new(pool.clone());
        catalog
            .migrate()
            .await
            .map_err(|e| BootstrapError::Database(e.to_string()))?;

        let queue = RedisStreamsJobQueue::new(&config.redis_url, &config.consumer_name)
            .map_err(|e| BootstrapError::Queue(e.to_string()))?;
        let progress = RedisProgressStore::new(&config.redis_url, config.progress_ttl)
            .map_err(|e| BootstrapError::Progress(e.to_string()))?;

        let catalog: Arc<dyn PriceCatalog> = Arc::new(catalog);
        let handlers: Vec<Arc<dyn JobHandler>> = vec![
            Arc::new(BackupHandler::new(
                Arc::new(PostgresBackupSource::new(pool, config.backup_tables.clone())),
                Arc::new(FilesystemArtifactStorage::new(&config.backup_dir)),
            )),
            Arc::new(PriceSyncHandler::new(catalog, price_source(config)?)),
            Arc::new(EmailSendHandler::new(Arc::new(LogEmailTransport))),
        ];

        info!(mode = "persistent", consumer = %config.consumer_name, "job system ready");
        Ok(Self::assemble(
            Arc::new(queue),
            Arc::new(records),
            Arc::new(progress),
            handlers,
            config,
        ))
    }

    /// Explicit backends, e.g. for tests.
    pub fn assemble(
        queue: Arc<dyn JobQueue>,
        records: Arc<dyn JobRecordStore>,
        progress: Arc<dyn ProgressStore>,
        handlers: Vec<Arc<dyn JobHandler>>,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            queue,
            records,
            progress,
            notifier: Arc::new(BroadcastNotifier::default()),
            handlers: handlers.into_iter().map(|h| (h.job_type(), h)).collect(),
            config: config.clone(),
        }
    }

    /// Replace the handler for its job type.
    pub fn with_handler(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(handler.job_type(), handler);
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(self.queue.clone())
    }

    /// One worker per registered job type, all stopped by `shutdown`.
    pub fn spawn_workers(&self, shutdown: &CancellationToken) -> Vec<WorkerHandle> {
        let settings = WorkerSettings::default()
            .with_guard_retry_interval(self.config.guard_retry_interval)
            .with_lease(self.config.run_lease);

        self.handlers
            .values()
            .map(|handler| {
                Worker::new(
                    handler.clone(),
                    self.queue.clone(),
                    self.records.clone(),
                    self.progress.clone(),
                )
                .with_notifier(self.notifier.clone())
                .with_settings(settings.clone())
                .with_shutdown(shutdown.child_token())
                .spawn()
            })
            .collect()
    }

    pub fn stale_detector(&self) -> StaleRunDetector {
        StaleRunDetector::new(
            self.records.clone(),
            self.progress.clone(),
            self.config.stale_grace,
        )
    }
}

fn price_source(config: &WorkerConfig) -> Result<Arc<dyn PriceSource>, BootstrapError> {
    match &config.price_source_url {
        Some(url) => Ok(Arc::new(
            HttpPriceSource::new(url).map_err(|e| BootstrapError::PriceSource(e.to_string()))?,
        )),
        None => {
            warn!("PRICE_SOURCE_URL not set; price sync jobs will fail as unreachable");
            Ok(Arc::new(UnconfiguredPriceSource))
        }
    }
}
