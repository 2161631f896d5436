use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use cachegrid::store::{ResourceCaps, TtlStore};
use cachegrid::worker::{build_router, serve_with_graceful_shutdown};

#[derive(Parser)]
#[command(name = "cachegrid-worker")]
#[command(about = "Storage worker: serves Get/Set/Delete/Stats over HTTP, backed by one TTL store")]
struct Cli {
    /// Host to bind to.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 9000)]
    port: u16,

    /// Sweeper cadence, in seconds.
    #[arg(long, default_value_t = 60)]
    sweep_interval_secs: u64,

    /// Optional hard cap on key count; unset means unbounded.
    #[arg(long)]
    max_keys: Option<u64>,

    /// Optional hard cap on approximate memory usage, in megabytes.
    #[arg(long)]
    max_memory_mb: Option<u64>,

    /// Grace period given to in-flight requests on shutdown, in seconds.
    #[arg(long, default_value_t = 5)]
    shutdown_grace_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let instance_id = Uuid::new_v4();
    let cli = Cli::parse();
    let caps = ResourceCaps {
        max_keys: cli.max_keys,
        max_memory_bytes: cli.max_memory_mb.map(|mb| mb * 1024 * 1024),
    };

    let store = Arc::new(TtlStore::with_caps(caps));
    let sweeper = cachegrid::store::spawn_sweeper(store.clone(), Duration::from_secs(cli.sweep_interval_secs));

    let router = build_router(store, caps);
    let addr: SocketAddr = format!("{}:{}", cli.host, cli.port).parse().context("parsing --host/--port")?;

    tracing::info!(%addr, %instance_id, "worker starting");
    serve_with_graceful_shutdown(router, addr, shutdown_signal(), Duration::from_secs(cli.shutdown_grace_secs)).await?;

    sweeper.abort();
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
