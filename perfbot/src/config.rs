//! Environment-driven configuration.
//!
//! Every knob comes from environment variables, optionally seeded from a
//! `KEY=VALUE` env file. Required variables produce an error naming the
//! missing key; everything else has a sensible default.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default number of leading telemetry rows discarded as startup transients.
pub const DEFAULT_WARMUP_SAMPLES: usize = 20;

/// Default delay between recording the session start and launching the game,
/// so telemetry timestamps are strictly after the start.
const DEFAULT_STARTUP_DELAY_SECS: u64 = 2;

/// Default delay between game exit and telemetry collection, giving the
/// build time to flush its trace and CSV output.
const DEFAULT_FLUSH_DELAY_SECS: u64 = 5;

/// Default prompt marker printed by the updater when it is ready for input.
const DEFAULT_PROMPT_MARKER: &str = "Steam>";

/// Updater tool configuration.
#[derive(Debug, Clone)]
pub struct UpdaterConfig {
    /// Path to the updater executable.
    pub executable: PathBuf,
    /// Working directory for the updater process.
    pub working_dir: PathBuf,
    /// Login username.
    pub username: String,
    /// Login password.
    pub password: String,
    /// Substring marking the updater's interactive prompt.
    pub prompt_marker: String,
    /// App id passed to the update command.
    pub app_id: String,
    /// Optional beta branch for the update command.
    pub beta_branch: Option<String>,
}

/// Profiled game configuration.
#[derive(Debug, Clone)]
pub struct GameConfig {
    /// Game executable, absolute or relative to the working directory.
    pub executable: PathBuf,
    /// Working directory for the game process.
    pub working_dir: PathBuf,
    /// Launch arguments.
    pub args: Vec<String>,
    /// Delay applied after recording the session start time.
    pub startup_delay: Duration,
    /// Delay applied after exit before telemetry collection.
    pub flush_delay: Duration,
}

/// Telemetry collection configuration.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Directory the build writes trace files into.
    pub trace_dir: PathBuf,
    /// Directory claimed trace files are moved into.
    pub claimed_dir: PathBuf,
    /// Directory the build writes per-run CSV log subdirectories into.
    pub log_dir: PathBuf,
    /// Number of leading samples discarded as warm-up.
    pub warmup_samples: usize,
    /// Optional external tool invoked to archive claimed traces.
    pub archive_tool: Option<PathBuf>,
    /// Optional external tool rendering a CSV into a chart image.
    pub chart_tool: Option<PathBuf>,
}

/// Full application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub updater: UpdaterConfig,
    pub game: GameConfig,
    pub telemetry: TelemetryConfig,
    /// Directory the sink persists reports and uploads into.
    pub reports_dir: PathBuf,
}

impl Config {
    /// Load the configuration from the process environment.
    pub fn load() -> Result<Self> {
        let reports_dir = PathBuf::from(optional("REPORTS_DIR").unwrap_or_else(|| "reports".into()));

        let updater = UpdaterConfig {
            executable: required("UPDATER_EXE")?.into(),
            working_dir: required("UPDATER_DIR")?.into(),
            username: required("UPDATER_USERNAME")?,
            password: required("UPDATER_PASSWORD")?,
            prompt_marker: optional("UPDATER_PROMPT").unwrap_or_else(|| DEFAULT_PROMPT_MARKER.into()),
            app_id: required("APP_ID")?,
            beta_branch: optional("APP_BETA_BRANCH"),
        };

        let game = GameConfig {
            executable: required("GAME_EXE")?.into(),
            working_dir: required("GAME_DIR")?.into(),
            args: optional("GAME_ARGS")
                .map(|args| args.split_whitespace().map(String::from).collect())
                .unwrap_or_default(),
            startup_delay: Duration::from_secs(
                parsed_or("GAME_STARTUP_DELAY_SECS", DEFAULT_STARTUP_DELAY_SECS)?,
            ),
            flush_delay: Duration::from_secs(
                parsed_or("GAME_FLUSH_DELAY_SECS", DEFAULT_FLUSH_DELAY_SECS)?,
            ),
        };

        let telemetry = TelemetryConfig {
            trace_dir: required("TRACE_DIR")?.into(),
            claimed_dir: optional("TRACE_CLAIMED_DIR")
                .map_or_else(|| reports_dir.join("traces"), PathBuf::from),
            log_dir: required("PERF_LOG_DIR")?.into(),
            warmup_samples: parsed_or("PERF_WARMUP_SAMPLES", DEFAULT_WARMUP_SAMPLES)?,
            archive_tool: optional("ARCHIVE_TOOL").map(PathBuf::from),
            chart_tool: optional("CHART_TOOL").map(PathBuf::from),
        };

        Ok(Self {
            updater,
            game,
            telemetry,
            reports_dir,
        })
    }
}

/// Load a `KEY=VALUE` env file into the process environment, if it exists.
///
/// Missing files are fine (the environment may already be populated);
/// malformed lines are ignored, matching the usual env-file tolerance.
pub fn load_env_file(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read env file {}", path.display()))?;

    for line in content.lines() {
        if let Some((key, value)) = parse_env_line(line) {
            std::env::set_var(key, value);
        }
    }

    Ok(())
}

/// Parse a single `KEY=VALUE` env-file line. Comments and blank lines
/// return `None`.
fn parse_env_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }

    Some((key.to_string(), value.trim().to_string()))
}

fn required(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("{key} is not set in the environment"))
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

fn parsed_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional(key) {
        Some(value) => value
            .parse()
            .with_context(|| format!("{key} has an invalid value: {value}")),
        None => Ok(default),
    }
}
