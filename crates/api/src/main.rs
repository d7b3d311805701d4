use std::sync::Arc;

use anyhow::Context;

use pricekeep_api::app::{build_app, services::build_services};
use pricekeep_api::config::ApiConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pricekeep_observability::init();

    let config = ApiConfig::from_env().context("invalid configuration")?;
    let services = Arc::new(
        build_services(&config)
            .await
            .context("failed to start job system")?,
    );
    let app = build_app(services.clone());

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    services.shutdown().await;
    Ok(())
}
