//! loadgrid — dry-run planner for distributed load-test ramps.
//!
//! Loads a scenario file, drives the dispatcher through each stage and
//! prints every plan it emits.
//!
//! # Usage
//!
//! ```text
//! loadgrid plan --config demos/ramp.toml --format json
//! loadgrid plan --config demos/ramp.toml --realtime
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "loadgrid",
    about = "LoadGrid — distributed load-test dispatch planner",
    version,
    propagate_version = true,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the tick sequence a scenario produces.
    ///
    /// Stages run in order; topology events fire after the given number of
    /// emitted ticks.
    Plan {
        /// Scenario file (TOML)
        #[arg(short, long)]
        config: PathBuf,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
        /// Honour pacing delays between ticks
        #[arg(long)]
        realtime: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,loadgrid=debug".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Plan {
            config,
            format,
            realtime,
        } => commands::plan::run(&config, &format, realtime).await,
    }
}
