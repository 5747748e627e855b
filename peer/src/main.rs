mod cache;
mod client;
mod config;
mod executor;
mod history;
mod identity;
mod memory;
mod node;
mod os;
mod ownership;
mod quota;
mod scheduler;
mod server;
mod storage;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use weft_protocol::PeerAddr;

#[derive(Parser)]
#[command(name = "weft-peer", about = "Weft peer node: compute, memory and file services")]
struct Cli {
    /// Port this peer listens on
    #[arg(long, env = "WEFT_PEER_PORT", default_value = "9000")]
    port: u16,

    /// Address other nodes can reach this peer at
    #[arg(long, env = "WEFT_PEER_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Tracker host
    #[arg(long, env = "WEFT_TRACKER_HOST", default_value = "127.0.0.1")]
    tracker_host: String,

    /// Tracker port
    #[arg(long, env = "WEFT_TRACKER_PORT", default_value = "8888")]
    tracker_port: u16,

    /// Directory for identity, file storage and owned storage
    #[arg(long, env = "WEFT_PEER_DATA", default_value = "weft-peer-data")]
    data_dir: PathBuf,

    /// Scheduling discipline: FCFS, SJF, PRIORITY or RR
    #[arg(long, default_value = "FCFS")]
    scheduler: String,

    /// Block allocator fit: FIRST_FIT, BEST_FIT, WORST_FIT or NEXT_FIT
    #[arg(long, default_value = "FIRST_FIT")]
    fit: String,

    /// Block allocator arena size in bytes
    #[arg(long, default_value = "1048576")]
    arena_bytes: u64,

    /// Socket timeout in seconds
    #[arg(long, default_value = "30")]
    socket_timeout: u64,

    /// Default task timeout in seconds
    #[arg(long, default_value = "60")]
    task_timeout: u64,

    /// Heartbeat interval in seconds
    #[arg(long, default_value = "10")]
    heartbeat_interval: u64,

    /// Soft cap on concurrently handled connections
    #[arg(long, default_value = "256")]
    max_connections: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let cfg = config::Config {
        advertise_host: cli.host,
        port: cli.port,
        tracker: PeerAddr::new(cli.tracker_host, cli.tracker_port),
        data_dir: cli.data_dir,
        discipline: cli.scheduler.parse().map_err(anyhow::Error::msg)?,
        fit_algorithm: cli.fit.parse().map_err(anyhow::Error::msg)?,
        arena_bytes: cli.arena_bytes,
        socket_timeout: Duration::from_secs(cli.socket_timeout),
        task_timeout: Duration::from_secs(cli.task_timeout),
        heartbeat_interval: Duration::from_secs(cli.heartbeat_interval),
        max_file_bytes: 100 * 1024 * 1024,
        max_frame_bytes: weft_protocol::wire::DEFAULT_MAX_FRAME,
        max_connections: cli.max_connections,
        chunk_bytes: 1024 * 1024,
    };

    let listener = TcpListener::bind(("0.0.0.0", cfg.port))
        .await
        .with_context(|| format!("binding peer port {}", cfg.port))?;

    let node = node::PeerNode::new(cfg).await?;
    tracing::info!(
        identity = %node.identity,
        address = %node.endpoint(),
        tracker = %node.client.tracker_addr(),
        discipline = %node.scheduler.discipline(),
        "starting weft peer"
    );
    node.start(Arc::new(executor::ExprRunner)).await;

    tokio::select! {
        result = server::serve(node.clone(), listener) => {
            result.context("peer server failed")?;
        }
        _ = shutdown_signal() => {
            tracing::info!("shutting down gracefully");
            if let Err(e) = node.client.unregister(&node.identity).await {
                tracing::debug!(error = %e, "unregister failed during shutdown");
            }
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
