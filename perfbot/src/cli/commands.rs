//! CLI command execution.
//!
//! The subcommands are the external scheduler's surface: each one wires the
//! configured components together, runs a single operation, and reports
//! progress through the artifact sink.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{load_env_file, Config};
use crate::game::GameSession;
use crate::operator::{OperatorChannel, TerminalOperator};
use crate::report::{ArtifactSink, DirectorySink};
use crate::telemetry::{PerfExtractor, TraceCollector};
use crate::updater::UpdaterSession;

use super::args::{Cli, Commands};

/// Execute the parsed command line.
pub async fn execute(cli: Cli) -> Result<()> {
    load_env_file(Path::new(&cli.env_file))?;
    let config = Config::load().context("configuration is incomplete")?;

    match cli.command {
        Commands::Update { app, branch } => update(config, app, branch).await,
        Commands::Run { max_duration } => run(config, max_duration).await,
    }
}

/// Drive the updater through login and an app update.
async fn update(config: Config, app: Option<String>, branch: Option<String>) -> Result<()> {
    let sink = DirectorySink::new(&config.reports_dir);
    let status_id = Uuid::now_v7();

    let operator: Arc<dyn OperatorChannel> = Arc::new(TerminalOperator);
    let session = UpdaterSession::start(&config.updater, operator)?;

    let app_id = app.unwrap_or_else(|| config.updater.app_id.clone());
    let branch = branch.or_else(|| config.updater.beta_branch.clone());

    let _ = sink
        .update_status(status_id, &format!("Updating app {app_id}"))
        .await;

    match session.update_app(&app_id, branch.as_deref()).await {
        Ok(()) => {
            info!(app_id = %app_id, "update completed");
            let _ = sink.update_status(status_id, "Update completed").await;
            Ok(())
        }
        Err(e) => {
            let _ = sink
                .update_status(status_id, &format!("Update failed: {e}"))
                .await;
            Err(e.into())
        }
    }
}

/// Run one profiling session: launch the build, wait for exit, collect
/// traces and performance statistics.
async fn run(config: Config, max_duration: Option<u64>) -> Result<()> {
    let sink = DirectorySink::new(&config.reports_dir);
    let status_id = Uuid::now_v7();

    let collector = TraceCollector::new(
        &config.telemetry.trace_dir,
        &config.telemetry.claimed_dir,
        config.telemetry.archive_tool.clone(),
    );
    let extractor = PerfExtractor::new(
        &config.telemetry.log_dir,
        config.telemetry.warmup_samples,
        config.telemetry.chart_tool.clone(),
    );

    let mut session = GameSession::new(config.game);

    if let Some(secs) = max_duration {
        let handle = session.stop_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            if handle.is_running() {
                warn!(secs, "maximum duration reached, stopping the game");
                handle.stop();
            }
        });
    }

    let clean = session.run(&collector, &extractor, status_id, &sink).await?;
    if clean {
        info!("profiling session completed cleanly");
    } else {
        warn!(code = ?session.exit_code(), "profiling session ended with a non-clean exit");
    }
    Ok(())
}
