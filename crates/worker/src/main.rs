//! Standalone job worker: one consumer per job type against the shared
//! queue and stores (`USE_PERSISTENT_STORES=true`).

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pricekeep_infra::stale::DEFAULT_SCAN_INTERVAL;
use pricekeep_infra::{JobSystem, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pricekeep_observability::init();

    let config = WorkerConfig::from_env().context("invalid configuration")?;
    if !config.use_persistent_stores {
        warn!("running with in-memory stores; this worker only sees jobs enqueued by itself");
    }

    let system = JobSystem::from_config(&config)
        .await
        .context("failed to start job system")?;

    let shutdown = CancellationToken::new();
    let workers = system.spawn_workers(&shutdown);
    let detector = system
        .stale_detector()
        .spawn(DEFAULT_SCAN_INTERVAL, shutdown.child_token());
    info!(workers = workers.len(), consumer = %config.consumer_name, "worker started");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested; waiting for in-flight jobs");

    shutdown.cancel();
    for worker in workers {
        worker.shutdown().await;
    }
    detector.await.context("stale run detector panicked")?;

    info!("worker stopped");
    Ok(())
}
