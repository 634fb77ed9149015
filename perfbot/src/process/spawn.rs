//! Child process spawning with line-streamed output.
//!
//! Provides async process spawning with:
//! - Real-time stdout/stderr line streaming via a channel
//! - A single consumer draining the channel, so line handling is never
//!   interleaved with delivery
//! - Optional stdin line writer for interactive children
//! - Kill handle and timeout support
//! - Working directory and environment configuration

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::debug;

/// Output from a spawned process.
#[derive(Debug, Clone)]
pub enum ProcessOutput {
    /// Line from stdout.
    Stdout(String),
    /// Line from stderr.
    Stderr(String),
    /// Process has exited.
    Exit(ExitStatus),
}

/// Configuration options for spawning a process.
#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    /// The program to execute.
    pub program: String,

    /// Arguments to pass to the program.
    pub args: Vec<String>,

    /// Working directory for the process.
    pub working_dir: Option<PathBuf>,

    /// Environment variables to set (merged with current env).
    pub env: HashMap<String, String>,

    /// Timeout for the entire process execution.
    pub timeout: Option<Duration>,

    /// Whether to pipe stdin (default: false).
    pub pipe_stdin: bool,

    /// Buffer size for the output channel (default: 1000).
    pub buffer_size: usize,
}

impl ProcessOptions {
    /// Create new options for the given program.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            timeout: None,
            pipe_stdin: false,
            buffer_size: 1000,
        }
    }

    /// Add an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory.
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Set an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set a timeout for the process.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Enable stdin piping.
    pub fn pipe_stdin(mut self) -> Self {
        self.pipe_stdin = true;
        self
    }
}

/// Line writer into an interactive child's stdin.
#[derive(Debug)]
pub struct ProcessInput {
    inner: ChildStdin,
}

impl ProcessInput {
    /// Write a line (appending a newline) and flush it to the child.
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        self.inner.write_all(line.as_bytes()).await?;
        self.inner.write_all(b"\n").await?;
        self.inner.flush().await?;
        Ok(())
    }
}

/// Handle to request termination of a supervised process.
///
/// Killing is idempotent: repeated calls, or calls after the process has
/// already exited, do nothing.
#[derive(Debug, Clone)]
pub struct ProcessControl {
    kill_tx: mpsc::Sender<()>,
}

impl ProcessControl {
    /// Request that the process be force-terminated.
    pub fn kill(&self) {
        let _ = self.kill_tx.try_send(());
    }
}

/// A spawned process with streamed output, an optional stdin writer, and a
/// kill handle.
///
/// The exit status arrives through the output channel; the channel closes
/// once the readers and the supervisor are done.
#[derive(Debug)]
pub struct SupervisedProcess {
    /// Receiver for output lines and the final exit status.
    pub output: mpsc::Receiver<ProcessOutput>,

    /// Stdin writer, present when `pipe_stdin` was requested.
    pub input: Option<ProcessInput>,

    /// Kill handle.
    pub control: ProcessControl,

    /// OS process id, if available.
    pub pid: Option<u32>,
}

/// Spawn a process and stream its output line-by-line.
///
/// Stdout and stderr are read by dedicated tasks that feed a single mpsc
/// channel; a supervisor task waits for the child (or a kill request) and
/// reports the exit status through the same channel.
pub fn spawn_supervised(options: ProcessOptions) -> Result<SupervisedProcess> {
    let mut cmd = Command::new(&options.program);
    cmd.args(&options.args);

    if let Some(ref dir) = options.working_dir {
        cmd.current_dir(dir);
    }

    for (key, value) in &options.env {
        cmd.env(key, value);
    }

    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    if options.pipe_stdin {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn process: {}", options.program))?;

    let pid = child.id();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let input = child.stdin.take().map(|inner| ProcessInput { inner });

    let (tx, rx) = mpsc::channel::<ProcessOutput>(options.buffer_size);
    let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);

    // Spawn stdout reader
    if let Some(stdout) = stdout {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                if tx.send(ProcessOutput::Stdout(line)).await.is_err() {
                    break;
                }
            }
        });
    }

    // Spawn stderr reader
    if let Some(stderr) = stderr {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                if tx.send(ProcessOutput::Stderr(line)).await.is_err() {
                    break;
                }
            }
        });
    }

    // Supervisor: wait for exit, or kill on request and then wait.
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = kill_rx.recv() => {
                debug!("kill requested, terminating child");
                let _ = child.start_kill();
                child.wait().await
            }
        };
        match status {
            Ok(status) => {
                let _ = tx.send(ProcessOutput::Exit(status)).await;
            }
            Err(e) => {
                debug!(error = %e, "failed waiting for child");
            }
        }
    });

    Ok(SupervisedProcess {
        output: rx,
        input,
        control: ProcessControl { kill_tx },
        pid,
    })
}

/// Result from a completed process.
#[derive(Debug)]
pub struct ProcessResult {
    /// Exit status of the process.
    pub status: ExitStatus,

    /// All stdout lines collected.
    pub stdout: Vec<String>,

    /// All stderr lines collected.
    pub stderr: Vec<String>,

    /// Whether the process was killed due to timeout.
    pub timed_out: bool,
}

impl ProcessResult {
    /// Check if the process exited successfully.
    pub fn success(&self) -> bool {
        self.status.success() && !self.timed_out
    }

    /// Get stderr as a single string.
    pub fn stderr_string(&self) -> String {
        self.stderr.join("\n")
    }

    /// Get the exit code, if available.
    pub fn code(&self) -> Option<i32> {
        self.status.code()
    }
}

/// Spawn a process and collect all output.
///
/// Convenience wrapper over [`spawn_supervised`] for short-lived external
/// tools: waits for completion, collecting stdout and stderr. On timeout the
/// child is killed and the result is marked `timed_out`.
pub async fn spawn_process(options: ProcessOptions) -> Result<ProcessResult> {
    let time_limit = options.timeout;
    let mut child = spawn_supervised(options)?;

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut status = None;
    let mut timed_out = false;

    let deadline = time_limit.map(|limit| tokio::time::Instant::now() + limit);

    loop {
        let next = match deadline {
            Some(deadline) if !timed_out => {
                match tokio::time::timeout_at(deadline, child.output.recv()).await {
                    Ok(next) => next,
                    Err(_) => {
                        timed_out = true;
                        child.control.kill();
                        continue;
                    }
                }
            }
            _ => child.output.recv().await,
        };

        match next {
            Some(ProcessOutput::Stdout(line)) => stdout.push(line),
            Some(ProcessOutput::Stderr(line)) => stderr.push(line),
            Some(ProcessOutput::Exit(exit)) => status = Some(exit),
            None => break,
        }
    }

    let status = status.context("Process exited without reporting a status")?;

    Ok(ProcessResult {
        status,
        stdout,
        stderr,
        timed_out,
    })
}
