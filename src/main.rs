//! ptpool Daemon - a pool of warm Packet Tracer containers behind a lease API
//!
//! The daemon keeps a configured range of host ports populated with paused
//! Packet Tracer containers, leases them to clients on request and repairs
//! drift between its records and the container runtime.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use ptpool_daemon::config::Configuration;

mod cmd;

#[derive(Parser)]
#[command(name = "ptpool-daemon")]
#[command(about = "Packet Tracer instance pool management daemon")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Configuration::load(&cli.config)?;

    // Initialize logging, to the configured file when one is set
    let log_level = if cli.debug || config.debug { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("ptpool_daemon={}", log_level).into());

    match &config.log.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {:?}", path))?;
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(env_filter).init();
        }
    }

    info!("Starting ptpool daemon v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = cmd::root::run(Arc::new(config)).await {
        error!("Daemon error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
