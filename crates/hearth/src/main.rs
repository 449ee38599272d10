//! Hearth - operator CLI for server-side session stores
//!
//! Main entry point for the Hearth CLI.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

use commands::{config, delete, inspect, reap};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// Hearth - inspect and maintain session stores
#[derive(Parser)]
#[command(name = "hearth")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output as JSON (for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    /// Session manager config file (default: <config-dir>/hearth/hearth.toml)
    #[arg(short, long, global = true, env = "HEARTH_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the effective configuration as TOML
    Config(config::ConfigArgs),

    /// Print a stored session snapshot
    Inspect(inspect::InspectArgs),

    /// Delete a stored session snapshot
    Delete(delete::DeleteArgs),

    /// Destroy expired sessions
    ///
    /// A file store is scanned in full. Remote stores are not scanned: their
    /// keys expire through the TTL set on each save, so only sessions
    /// resident in this process are checked, and a fresh process has none.
    Reap(reap::ReapArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing: console (human-readable) + rotating JSON file
    let filter = if cli.verbose {
        "hearth=debug,hearth_session=debug,info"
    } else {
        "hearth=info,hearth_session=warn,warn"
    };

    let log_dir = dirs::data_local_dir()
        .map(|d| d.join("hearth").join("logs"))
        .unwrap_or_else(|| PathBuf::from("logs"));
    let file_appender = tracing_appender::rolling::daily(&log_dir, "hearth.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::prelude::*;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(tracing_subscriber::EnvFilter::new(filter)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(tracing_subscriber::EnvFilter::new(
                    "hearth=trace,hearth_session=trace,info",
                )),
        )
        .init();

    let ctx = commands::Context {
        config: commands::load_config(cli.config.as_deref())?,
        json_output: cli.json,
        verbose: cli.verbose,
    };

    match cli.command {
        Commands::Config(args) => config::run(args, &ctx).await,
        Commands::Inspect(args) => inspect::run(args, &ctx).await,
        Commands::Delete(args) => delete::run(args, &ctx).await,
        Commands::Reap(args) => reap::run(args, &ctx).await,
    }
}
