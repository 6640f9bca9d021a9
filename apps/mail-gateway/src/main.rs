use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use mail_gateway::{build_router, telemetry, AppConfig, AppState};
use shell_bridge::DefaultConnector;
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = AppConfig::load().context("invalid configuration")?;
    let _log_guard = telemetry::init_tracing(&cfg.log_filter, cfg.log_path.as_deref().map(Path::new));

    let connector = DefaultConnector::new(cfg.shell_program.clone(), cfg.connect_timeout())
        .context("failed to build remoting client")?;
    let state = AppState::new(&cfg, Arc::new(connector))?;
    let app = build_router(state.clone());

    let addr = cfg.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(
        %addr,
        infrastructures = state.infrastructures().len(),
        default_infrastructure = %state.infrastructures().default_descriptor().id,
        "starting mail gateway"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    state.shutdown().await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
