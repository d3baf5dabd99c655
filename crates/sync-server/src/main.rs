//! sync-server: Note sync coordinator.
//!
//! Accepts client WebSocket connections, runs one coordinator per user, and
//! answers batch sync RPCs and live note updates.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sync_server::{ServerConfig, SyncServer};

#[derive(Parser, Debug)]
#[command(name = "sync-server")]
#[command(about = "Note sync coordinator")]
struct Args {
    /// Address to listen on for client connections
    #[arg(short, long, env = "NOTE_SYNC_LISTEN", default_value = sync_server::config::DEFAULT_LISTEN)]
    listen: String,

    /// Directory for per-user note stores (in-memory if omitted)
    #[arg(short, long, env = "NOTE_SYNC_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Seconds a new connection has to complete its handshake
    #[arg(long, env = "NOTE_SYNC_HANDSHAKE_TIMEOUT_SECS", default_value_t = 10)]
    handshake_timeout_secs: u64,

    /// Enable verbose logging
    #[arg(long, env = "NOTE_SYNC_VERBOSE")]
    verbose: bool,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            listen: self.listen,
            data_dir: self.data_dir,
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,sync_server=debug"
    } else {
        "info,sync_server=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = args.into_config();
    info!("Starting sync-server");
    match &config.data_dir {
        Some(dir) => info!("Storing notes under {:?}", dir),
        None => info!("Storing notes in memory"),
    }

    let listener = SyncServer::bind(&config.listen).await?;
    let server = SyncServer::new(config);

    info!("Server running. Press Ctrl+C to stop.");

    tokio::select! {
        result = server.serve(listener) => {
            if let Err(e) = &result {
                error!("Server stopped: {}", e);
            }
            result?;
        }

        // Handle graceful shutdown
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    info!("Shutting down");
    Ok(())
}
