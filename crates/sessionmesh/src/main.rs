//! SessionMesh - replicated in-memory session store
//!
//! Main entry point for the SessionMesh CLI.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use sessionmesh_config::LoggingSection;
use tracing_appender::non_blocking::WorkerGuard;

mod commands;

use commands::{config, place, simulate};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// SessionMesh - replicated in-memory session store
#[derive(Parser)]
#[command(name = "sessionmesh")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output as JSON (for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    /// Config file to use instead of discovery
    #[arg(long, global = true, env = "SESSIONMESH_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run an in-process cluster and exercise replication, failover and expiry
    Simulate(simulate::SimulateArgs),

    /// Show which members own and back up the given session ids
    Place(place::PlaceArgs),

    /// Configuration management
    Config(config::ConfigArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = commands::Context {
        config_file: cli.config,
        json_output: cli.json,
        verbose: cli.verbose,
    };

    // Logging follows the config when it loads; a broken config is reported
    // by the command itself.
    let logging = ctx
        .load_config()
        .map(|loaded| loaded.config.logging())
        .unwrap_or_default();
    let _guard = init_tracing(ctx.verbose, &logging);

    match cli.command {
        Commands::Simulate(args) => simulate::run(args, &ctx).await,
        Commands::Place(args) => place::run(args, &ctx).await,
        Commands::Config(args) => config::run(args, &ctx).await,
    }
}

/// Console (human-readable, stderr) plus an optional daily JSON file.
fn init_tracing(verbose: bool, logging: &LoggingSection) -> Option<WorkerGuard> {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::prelude::*;

    let filter = if verbose {
        "sessionmesh=debug,sessionmesh_store=debug,sessionmesh_config=debug,info".to_string()
    } else {
        let level = &logging.level;
        format!("sessionmesh={level},sessionmesh_store={level},warn")
    };
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter));

    let (file_layer, guard) = if logging.file {
        let log_dir = logging
            .dir
            .clone()
            .or_else(|| sessionmesh_config::config_dir().map(|d| d.join("logs")))
            .unwrap_or_else(|| PathBuf::from("logs"));
        let file_appender = tracing_appender::rolling::daily(&log_dir, "sessionmesh.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_filter(EnvFilter::new(
                "sessionmesh=trace,sessionmesh_store=trace,sessionmesh_config=trace,info",
            ));
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .with(file_layer)
        .init();

    guard
}
