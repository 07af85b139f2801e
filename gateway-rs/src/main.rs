// gateway-rs/src/main.rs
// Gateway binary: loads configuration, wires the resilience layer and
// serves the router on GATEWAY_BIND_ADDR (default 0.0.0.0:8000).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use gateway::{create_router, describe_metrics, AppState};
use metrics_exporter_prometheus::PrometheusBuilder;
use resilience::{ResilienceConfig, ResilienceLayer};
use tracing::info;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8000";

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let config_path = std::env::var_os("RESILIENCE_CONFIG").map(PathBuf::from);
    let config =
        ResilienceConfig::load(config_path.as_deref()).context("failed to load configuration")?;
    resilience::init(&config).context("failed to initialize logging")?;

    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install metrics recorder")?;
    describe_metrics();

    let layer = ResilienceLayer::from_config(config)
        .await
        .context("failed to build resilience layer")?;
    let state = Arc::new(AppState::new(layer, metrics));
    let app = create_router(state, Router::new());

    let addr: SocketAddr = std::env::var("GATEWAY_BIND_ADDR")
        .unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string())
        .parse()
        .context("invalid GATEWAY_BIND_ADDR")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    info!(%addr, "Gateway listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}
