use std::sync::Arc;

use anyhow::Context;

use simplebank_api::app::{build_app, build_services};
use simplebank_api::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    simplebank_observability::init();

    let config = AppConfig::from_env()?;
    let services = Arc::new(build_services(&config).await?);
    let workers = services.spawn_workers(config.outbox_poll_interval);

    let app = build_app(services);
    let listener = tokio::net::TcpListener::bind(config.server_address)
        .await
        .with_context(|| format!("failed to bind {}", config.server_address))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for worker in workers {
        worker.shutdown().await;
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
