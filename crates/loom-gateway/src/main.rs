//! Loom gateway binary: `.env`, configuration and logging, then serve until Ctrl-C.

use loom_core::{HttpProvider, LoomConfig, RestRpcClient};
use loom_gateway::{build_app, AppState};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[loom-gateway] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        tracing::error!(target: "loom::gateway", error = %e, "gateway stopped");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = LoomConfig::load()?;
    let provider = HttpProvider::new(config.providers.clone(), config.engine.error_body_limit)?;
    let rpc = Arc::new(RestRpcClient::new(&config.rpc)?);
    let addr = config.bind_addr();

    let app = build_app(AppState::new(config, Arc::new(provider), rpc.clone(), rpc));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(target: "loom::gateway", %addr, version = loom_core::version(), "loom gateway listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!(target: "loom::gateway", "shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(target: "loom::gateway", error = %e, "ctrl-c handler unavailable");
        std::future::pending::<()>().await;
    }
    tracing::info!(target: "loom::gateway", "shutdown initiated (Ctrl+C received)");
}
