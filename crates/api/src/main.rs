use std::sync::Arc;

use anyhow::Context;

use contentflow_infra::ContentflowConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    contentflow_observability::init();

    let config = ContentflowConfig::from_env().context("failed to load configuration")?;

    let services = Arc::new(contentflow_api::app::services::build_services(&config));
    let maintenance = Arc::clone(&services.scheduler).spawn();

    let app = contentflow_api::app::build_app(services);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    maintenance.shutdown().await;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
