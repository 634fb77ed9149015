//! CLI argument definitions.

use clap::{Parser, Subcommand};

/// Perfbot - unattended build updating and performance profiling
#[derive(Parser, Debug)]
#[command(name = "perfbot")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Env file loaded before reading configuration
    #[arg(long, default_value = ".env")]
    pub env_file: String,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Log in to the updater and update the tracked app
    Update {
        /// Override the configured app id
        #[arg(long)]
        app: Option<String>,

        /// Override the configured beta branch
        #[arg(long)]
        branch: Option<String>,
    },

    /// Run the profiled build and collect its telemetry
    Run {
        /// Force-stop the game after this many seconds
        #[arg(long)]
        max_duration: Option<u64>,
    },
}
