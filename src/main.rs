//! # tether
//!
//! Relay server binary: loads configuration, installs telemetry and serves
//! until ctrl-c.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tether_server::{load_config, verifier_from_config};
use tether_telemetry::init_telemetry;

/// Account-scoped WebSocket relay.
#[derive(Parser, Debug)]
#[command(name = "tether", about = "Account-scoped WebSocket relay")]
struct Cli {
    /// JSON configuration file. Environment variables (`TETHER_*`) override it.
    #[arg(long, env = "TETHER_CONFIG")]
    config: Option<PathBuf>,

    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let mut config = load_config(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    let telemetry = init_telemetry(&config.telemetry).context("Failed to initialise telemetry")?;
    let verifier = verifier_from_config(&config.auth).context("Failed to build token verifier")?;

    let server = tether_server::start(&config, verifier, telemetry.metrics())
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr()))?;
    tracing::info!(port = server.port(), "tether relay ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    server.shutdown().await;
    Ok(())
}
