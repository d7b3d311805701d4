use std::sync::Mutex;

use tokio_util::sync::CancellationToken;
use tracing::info;

use pricekeep_infra::jobs::WorkerHandle;
use pricekeep_infra::stale::DEFAULT_SCAN_INTERVAL;
use pricekeep_infra::{BootstrapError, JobSystem};

use crate::config::ApiConfig;

/// Shared state behind every request handler.
pub struct AppServices {
    pub jobs: JobSystem,
    shutdown: CancellationToken,
    workers: Mutex<Vec<WorkerHandle>>,
}

impl AppServices {
    /// Wrap `jobs`, starting its workers and stale-run detector when asked to.
    pub fn new(jobs: JobSystem, run_workers: bool) -> Self {
        let shutdown = CancellationToken::new();
        let workers = if run_workers {
            let workers = jobs.spawn_workers(&shutdown);
            jobs.stale_detector()
                .spawn(DEFAULT_SCAN_INTERVAL, shutdown.child_token());
            info!(workers = workers.len(), "in-process workers started");
            workers
        } else {
            Vec::new()
        };

        Self {
            jobs,
            shutdown,
            workers: Mutex::new(workers),
        }
    }

    /// Stop in-process workers, letting in-flight runs finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let workers = self
            .workers
            .lock()
            .map(|mut w| std::mem::take(&mut *w))
            .unwrap_or_default();
        for worker in workers {
            worker.shutdown().await;
        }
    }
}

pub async fn build_services(config: &ApiConfig) -> Result<AppServices, BootstrapError> {
    let jobs = JobSystem::from_config(&config.worker).await?;
    Ok(AppServices::new(jobs, config.run_workers_in_process))
}
