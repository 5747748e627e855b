mod owned;
mod registry;
mod server;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "weft-tracker", about = "Weft tracker: peer directory and ownership registry")]
struct Cli {
    /// Host to bind to
    #[arg(long, env = "WEFT_TRACKER_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to bind to
    #[arg(long, env = "WEFT_TRACKER_PORT", default_value = "8888")]
    port: u16,

    /// Directory holding the owned-file registry
    #[arg(long, env = "WEFT_TRACKER_DATA", default_value = "weft-tracker-data")]
    data_dir: PathBuf,

    /// Seconds without a heartbeat before a peer is considered dead
    #[arg(long, default_value = "30")]
    peer_timeout: u64,

    /// Janitor period in seconds
    #[arg(long, default_value = "10")]
    janitor_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let owned = owned::OwnedRegistry::load(cli.data_dir.join("owned_files.json"))
        .await
        .context("loading owned-file registry")?;
    let tracker = Arc::new(server::Tracker {
        registry: registry::Registry::new(Duration::from_secs(cli.peer_timeout)),
        owned,
        max_frame_bytes: weft_protocol::wire::DEFAULT_MAX_FRAME,
    });

    let listener = TcpListener::bind((cli.host.as_str(), cli.port))
        .await
        .with_context(|| format!("binding tracker to {}:{}", cli.host, cli.port))?;
    tracing::info!(host = %cli.host, port = cli.port, "tracker listening");

    // Janitor: evict peers whose heartbeat went stale.
    {
        let tracker = tracker.clone();
        let period = Duration::from_secs(cli.janitor_interval);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let evicted = tracker.registry.evict_stale();
                if !evicted.is_empty() {
                    tracing::info!(evicted = evicted.len(), "janitor pass complete");
                }
            }
        });
    }

    tokio::select! {
        result = server::serve(tracker, listener) => {
            result.context("tracker server failed")?;
        }
        _ = shutdown_signal() => {
            tracing::info!("shutting down gracefully");
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}
