//! RFMP daemon binary.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: N0CALL via the TNC at 127.0.0.1:8001, db in ~/rfmpd/
//! rfmpd
//!
//! # Explicit config file, verbose logging, no TNC
//! rfmpd --config rfmpd.toml --log-level debug --offline
//! ```

use std::path::PathBuf;

use clap::Parser;
use rfmpd::config::Config;
use rfmpd::daemon::Daemon;
use rfmpd::store::RedbStore;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{EnvFilter, fmt};

/// RFMP store-and-forward daemon
#[derive(Parser, Debug)]
#[command(name = "rfmpd")]
#[command(about = "Gossip-style microblog daemon over AX.25/KISS")]
#[command(version)]
struct Args {
    /// Configuration file path (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Run without a TNC connection
    #[arg(long)]
    offline: bool,

    /// Override the database path
    #[arg(long)]
    database: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let mut config = Config::load(args.config.as_deref())?;
    if args.offline {
        config.network.offline_mode = true;
    }
    if let Some(database) = &args.database {
        config.storage.database_path = database.display().to_string();
    }

    let database_path = config.database_path();
    tracing::info!(path = %database_path.display(), "opening store");
    let store = RedbStore::open(&database_path)?;

    let daemon = Daemon::new(config, store)?;
    daemon.start().await;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");

    daemon.stop().await;
    Ok(())
}
