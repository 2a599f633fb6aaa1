//! parcel CLI - Inspect and deliver stored telemetry payloads
//!
//! Provides commands for:
//! - Viewing stored payloads and storage usage
//! - Flushing stored payloads to the configured collector
//! - Purging stored or quarantined payloads
//! - Showing and validating configuration

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use parcel_core::config::Config;
use tracing_subscriber::EnvFilter;

mod commands;
mod output;

use commands::{
    config::ConfigCommand, flush::FlushCommand, purge::PurgeCommand, status::StatusCommand, CommandContext,
};
use output::OutputFormat;

#[derive(Debug, Parser)]
#[command(name = "parcel", version, about = "Durable telemetry delivery")]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,

    /// Verbose output (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Use alternate config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Show stored payloads and storage usage
    Status(StatusCommand),
    /// Deliver every stored payload now
    Flush(FlushCommand),
    /// Delete stored payloads
    Purge(PurgeCommand),
    /// View and validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let ctx = CommandContext {
        format: if cli.json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        },
        config_path: cli.config.unwrap_or_else(Config::default_path),
    };

    match cli.command {
        Commands::Status(cmd) => cmd.execute(&ctx).await,
        Commands::Flush(cmd) => cmd.execute(&ctx).await,
        Commands::Purge(cmd) => cmd.execute(&ctx).await,
        Commands::Config(cmd) => cmd.execute(&ctx).await,
    }
}
