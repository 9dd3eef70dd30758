//! Backend worker process.
//!
//! Serves `POST /invoke`; each invocation dials the edge named in the
//! `initial` payload and answers requests with the echo handler until the
//! worker goes idle or reaches its hard lifetime.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;

use duplex_router::config::{load_worker_config, WorkerConfig};
use duplex_router::lifecycle::{spawn_signal_handler, Shutdown};
use duplex_router::observability::logging;
use duplex_router::worker::{EchoHandler, WorkerServer};

#[derive(Parser)]
#[command(name = "duplex-worker")]
#[command(about = "Backend worker answering multiplexed requests over one websocket", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Delay between echo chunks in milliseconds
    #[arg(long, default_value_t = 1000)]
    tick_ms: u64,

    /// Number of delayed echo chunks per response
    #[arg(long, default_value_t = 3)]
    ticks: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_tracing("duplex_router=debug,tower_http=info");
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_worker_config(path)?,
        None => WorkerConfig::default(),
    };

    let handler = EchoHandler::new(Duration::from_millis(cli.tick_ms), cli.ticks);
    tracing::info!(
        bind_address = %config.bind_address,
        instance_id = %handler.instance_id(),
        idle_grace_ms = config.lifecycle.idle_grace_ms,
        hard_lifetime_ms = config.lifecycle.hard_lifetime_ms,
        "duplex-worker starting"
    );

    let listener = TcpListener::bind(&config.bind_address).await?;

    let shutdown = Shutdown::new();
    spawn_signal_handler(&shutdown);

    let server = WorkerServer::new(config, Arc::new(handler));
    server.run(listener, shutdown.subscribe()).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
