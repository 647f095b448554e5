//! termgate
//!
//! A WebSocket gateway serving terminal sessions, local PTYs or remote SSH
//! shells, one target per namespace behind a pluggable authenticator.

mod auth;
mod backend;
mod config;
mod gateway;
mod provision;
mod pty;
mod ssh;
mod transport;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{Level, info};
use tracing_subscriber::EnvFilter;

use crate::config::GatewayConfig;
use crate::gateway::Gateway;
use crate::provision::AddAuthArgs;

/// termgate - terminal sessions over WebSocket
#[derive(Parser, Debug)]
#[command(name = "termgate", version, about)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/termgate/gateway.toml")]
    config: PathBuf,

    /// Generate default configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Override listen address (host:port)
    #[arg(short, long)]
    listen: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Add a challenge-response authentication entry to the config file
    AddAuth(AddAuthArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new(Level::DEBUG.to_string())
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Some(Command::AddAuth(args)) = &cli.command {
        let created = provision::add_auth(&cli.config, args)?;
        println!("{}", created);
        println!("Saved to {}", cli.config.display());
        return Ok(());
    }

    if cli.generate_config {
        let content = toml::to_string_pretty(&GatewayConfig::sample())?;
        println!("{}", content);
        return Ok(());
    }

    let config = GatewayConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    let addr: SocketAddr = match &cli.listen {
        Some(listen) => listen
            .parse()
            .with_context(|| format!("Invalid listen address: {}", listen))?,
        None => config.listen_addr()?,
    };

    // Nothing is bound until every target checks out.
    let gateway = Gateway::from_config(&config).context("Invalid configuration")?;

    info!("Starting termgate");
    info!("  Listen address: {}", addr);
    info!("  Config: {}", cli.config.display());
    if config.cors.is_empty() {
        info!("  CORS: any origin");
    } else {
        info!("  CORS: {}", config.cors.join(", "));
    }

    transport::ws::serve(addr, Arc::new(gateway), config.cors.clone()).await
}
