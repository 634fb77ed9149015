//! Profiled game process lifecycle.
//!
//! A session launches the build once, supervises it to exit, and then
//! triggers telemetry collection. A non-zero exit is a warning, not a
//! failure — whatever telemetry the run produced is still collected.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDateTime};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::GameConfig;
use crate::process::{spawn_supervised, ProcessControl, ProcessOptions, ProcessOutput};
use crate::report::ArtifactSink;
use crate::telemetry::{PerfExtractor, TraceCollector};

/// Supervises one run of the profiled build.
///
/// Runs exactly once: `NotStarted → Running → Exited`. Stopping an already
/// exited session is a no-op.
pub struct GameSession {
    config: GameConfig,
    started_at: Option<NaiveDateTime>,
    exit_code: Option<i32>,
    running: Arc<AtomicBool>,
    control: Arc<Mutex<Option<ProcessControl>>>,
}

/// Cloneable handle for force-stopping a running session.
#[derive(Clone)]
pub struct GameStopHandle {
    running: Arc<AtomicBool>,
    control: Arc<Mutex<Option<ProcessControl>>>,
}

impl GameStopHandle {
    /// Force-terminate the game if it is still running; no-op otherwise.
    pub fn stop(&self) {
        if !self.running.load(Ordering::SeqCst) {
            debug!("stop requested but no game is running");
            return;
        }
        let control = self.control.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(control) = control.as_ref() {
            info!("force stopping the game");
            control.kill();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl GameSession {
    pub fn new(config: GameConfig) -> Self {
        Self {
            config,
            started_at: None,
            exit_code: None,
            running: Arc::new(AtomicBool::new(false)),
            control: Arc::new(Mutex::new(None)),
        }
    }

    /// Handle for stopping this session from another task.
    pub fn stop_handle(&self) -> GameStopHandle {
        GameStopHandle {
            running: Arc::clone(&self.running),
            control: Arc::clone(&self.control),
        }
    }

    /// When the session started, once it has.
    pub fn started_at(&self) -> Option<NaiveDateTime> {
        self.started_at
    }

    /// Exit code of the build, once it has exited.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Full path of the build executable.
    fn executable_path(&self) -> PathBuf {
        if self.config.executable.is_absolute() {
            self.config.executable.clone()
        } else {
            self.config.working_dir.join(&self.config.executable)
        }
    }

    /// Run the build to exit and collect its telemetry.
    ///
    /// Returns whether the process exited cleanly (code 0).
    pub async fn run(
        &mut self,
        collector: &TraceCollector,
        extractor: &PerfExtractor,
        status_id: Uuid,
        sink: &dyn ArtifactSink,
    ) -> Result<bool> {
        if self.started_at.is_some() {
            bail!("game session has already run");
        }

        // Record the start first, then hold off launching: every telemetry
        // timestamp must land strictly after the recorded start.
        let started_at = Local::now().naive_local();
        self.started_at = Some(started_at);
        tokio::time::sleep(self.config.startup_delay).await;

        let before = extractor.snapshot()?;

        let executable = self.executable_path();
        info!(executable = %executable.display(), "launching game");
        let options = ProcessOptions::new(executable.display().to_string())
            .args(self.config.args.clone())
            .working_dir(&self.config.working_dir);
        let mut process =
            spawn_supervised(options).context("failed to launch the game process")?;
        info!(pid = ?process.pid, "game process started");

        {
            let mut control = self.control.lock().unwrap_or_else(PoisonError::into_inner);
            *control = Some(process.control.clone());
        }
        self.running.store(true, Ordering::SeqCst);
        let _ = sink
            .update_status(status_id, "Game started; waiting for it to exit")
            .await;

        let mut exit_code: Option<i32> = None;
        while let Some(output) = process.output.recv().await {
            match output {
                ProcessOutput::Stdout(line) | ProcessOutput::Stderr(line) => {
                    debug!(target: "game", "{line}");
                }
                ProcessOutput::Exit(status) => exit_code = status.code(),
            }
        }

        self.running.store(false, Ordering::SeqCst);
        {
            let mut control = self.control.lock().unwrap_or_else(PoisonError::into_inner);
            *control = None;
        }
        self.exit_code = exit_code;

        let clean = exit_code == Some(0);
        match exit_code {
            Some(0) => {
                info!("game exited cleanly");
                let _ = sink.update_status(status_id, "Game exited cleanly").await;
            }
            Some(code) => {
                warn!(code, "game exited with a non-zero code");
                let _ = sink
                    .update_status(
                        status_id,
                        &format!("Game exited with code {code}; collecting telemetry anyway"),
                    )
                    .await;
            }
            None => {
                warn!("game was terminated before exiting on its own");
                let _ = sink
                    .update_status(
                        status_id,
                        "Game was terminated; collecting telemetry anyway",
                    )
                    .await;
            }
        }

        // Give the build time to flush its trace and CSV output.
        tokio::time::sleep(self.config.flush_delay).await;

        collector.collect(started_at, status_id, sink).await?;
        extractor.extract(&before, status_id, sink).await?;

        Ok(clean)
    }
}
