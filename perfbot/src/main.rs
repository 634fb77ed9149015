//! Perfbot - unattended build updating and performance profiling.
//!
//! Drives an interactive updater CLI through its login and command prompts,
//! launches the updated build, and reduces the trace/CSV telemetry the
//! build produces into statistical performance reports.
//!
//! Architecture:
//! - `updater` owns the console-protocol state machine over a line stream
//! - `game` supervises the profiled build end-to-end
//! - `telemetry` claims trace artifacts and reduces CSV samples
//! - `report` is the narrow seam everything publishes results through

mod cli;
mod config;
mod game;
mod operator;
mod process;
mod report;
mod telemetry;
mod updater;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{execute, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    execute(cli).await
}
