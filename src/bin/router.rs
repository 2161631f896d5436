use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use cachegrid::config::source::FileConfigSource;
use cachegrid::router::{RouterState, build_router};

#[derive(Parser)]
#[command(name = "cachegrid-router")]
#[command(about = "Router: authenticates, places, and fans out client requests to storage workers")]
struct Cli {
    /// Host to bind to.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Path to the configuration artifact (JSON document), polled for changes.
    #[arg(long, default_value = "cachegrid.json")]
    config_path: String,

    /// Poll interval for configuration changes, in seconds.
    #[arg(long, default_value_t = 5)]
    config_poll_interval_secs: u64,

    /// Virtual nodes per worker on the placement ring.
    #[arg(long, default_value_t = cachegrid::ring::DEFAULT_VIRTUAL_NODES)]
    virtual_nodes: u32,

    /// Drain grace given to a worker channel after its endpoint is removed, in seconds.
    #[arg(long, default_value_t = 5)]
    drain_grace_secs: u64,

    /// Per-attempt deadline for a worker RPC, in milliseconds.
    #[arg(long, default_value_t = 500)]
    attempt_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let instance_id = Uuid::new_v4();
    let cli = Cli::parse();
    let source = Arc::new(FileConfigSource::new(cli.config_path.clone(), Duration::from_secs(cli.config_poll_interval_secs)));

    let state = RouterState::build(
        source,
        cli.virtual_nodes,
        Duration::from_secs(cli.drain_grace_secs),
        Duration::from_millis(cli.attempt_timeout_ms),
    )
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "initial configuration load failed, refusing to start");
        e
    })?;

    let router = build_router(state);
    let addr: std::net::SocketAddr = format!("{}:{}", cli.host, cli.port).parse().context("parsing --host/--port")?;

    let listener = tokio::net::TcpListener::bind(addr).await.context("binding router listener")?;
    tracing::info!(%addr, %instance_id, "router listening");
    axum::serve(listener, router).with_graceful_shutdown(shutdown_signal()).await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
