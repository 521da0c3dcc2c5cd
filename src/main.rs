//! Warden Engine - container & agent execution engine
//!
//! Mediates between a browser UI and CLI AI agents (Claude/Cursor/Codex)
//! running inside per-user Docker containers, streaming output back over a
//! duplex channel.

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use warden_engine::cmd;

#[derive(Parser)]
#[command(name = "warden-engine")]
#[command(about = "Container & agent execution engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<cmd::Commands>,

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

    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("warden_engine={}", log_level).into()),
        )
        .init();

    info!("Starting Warden Engine v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Some(cmd::Commands::Diagnostics) => {
            cmd::diagnostics::run().await?;
        }
        None => {
            if let Err(e) = cmd::root::run(&cli.config).await {
                error!("Engine error: {}", e);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
