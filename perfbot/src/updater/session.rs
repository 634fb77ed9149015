//! Interactive updater session.
//!
//! Drives a login-then-command-loop CLI tool whose only interface is its
//! console output. One reader task consumes the line stream, classifies
//! each line through [`super::protocol::classify`], and advances the state
//! machine; callers submit commands through [`UpdaterSession::run_command`],
//! which serializes them FIFO with no overlap.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{error, info, warn};

use crate::config::UpdaterConfig;
use crate::operator::OperatorChannel;
use crate::process::{spawn_supervised, ProcessControl, ProcessInput, ProcessOptions, ProcessOutput};
use crate::updater::protocol::{classify, ProtocolEvent};

/// Login/command state of the session.
///
/// `Idle` and `Busy` are the authenticated states; `Exited` and `Failed`
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    AwaitingAuthentication,
    AwaitingTwoFactor,
    Idle,
    Busy,
    Exited,
    Failed,
}

impl SessionState {
    pub fn is_authenticated(self) -> bool {
        matches!(self, Self::Idle | Self::Busy)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Exited | Self::Failed)
    }
}

/// Failures a command submitter must distinguish.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("updater process exited before the command completed")]
    Exited,
    #[error("updater login failed")]
    LoginFailed,
    #[error("failed to write to the updater: {0}")]
    Write(String),
}

/// Login credentials for the updater tool.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Watch senders shared between the reader task and command submitters.
struct Shared {
    state: watch::Sender<SessionState>,
    /// True when the interactive prompt has been seen and no command has
    /// been written since.
    prompt_ready: watch::Sender<bool>,
}

/// One interactive session per underlying tool process.
pub struct UpdaterSession {
    shared: Arc<Shared>,
    input: Arc<Mutex<ProcessInput>>,
    state_rx: watch::Receiver<SessionState>,
    prompt_rx: watch::Receiver<bool>,
    /// Fair queue giving strict FIFO, non-overlapping command execution.
    gate: Mutex<()>,
    /// Held for the lifetime of the session so the supervisor's kill channel
    /// stays open; dropping it would signal the supervisor to terminate the
    /// child.
    _control: ProcessControl,
}

impl UpdaterSession {
    /// Start the updater from its configuration: verifies the executable is
    /// installed, creates the working directory, and logs in.
    pub fn start(config: &UpdaterConfig, operator: Arc<dyn OperatorChannel>) -> Result<Self> {
        if !config.executable.exists() {
            bail!(
                "updater executable not found at {} — install it before running",
                config.executable.display()
            );
        }
        std::fs::create_dir_all(&config.working_dir)
            .with_context(|| format!("failed to create {}", config.working_dir.display()))?;

        let credentials = Credentials {
            username: config.username.clone(),
            password: config.password.clone(),
        };
        let options = ProcessOptions::new(config.executable.display().to_string())
            .args([
                "+login".to_string(),
                credentials.username.clone(),
                credentials.password.clone(),
            ])
            .working_dir(&config.working_dir)
            .pipe_stdin();

        Self::spawn_with(options, credentials, &config.prompt_marker, operator)
    }

    /// Spawn the session over explicit process options. `start` is the
    /// configuration-driven wrapper; this seam also lets tests drive the
    /// state machine with a scripted stand-in process.
    pub fn spawn_with(
        options: ProcessOptions,
        credentials: Credentials,
        prompt_marker: &str,
        operator: Arc<dyn OperatorChannel>,
    ) -> Result<Self> {
        let mut process = spawn_supervised(options)?;
        let control = process.control.clone();
        let input = process
            .input
            .take()
            .context("updater process was spawned without stdin")?;
        let input = Arc::new(Mutex::new(input));

        let (state_tx, state_rx) = watch::channel(SessionState::Starting);
        let (prompt_tx, prompt_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            state: state_tx,
            prompt_ready: prompt_tx,
        });

        tokio::spawn(reader_loop(
            process.output,
            Arc::clone(&shared),
            Arc::clone(&input),
            operator,
            credentials,
            prompt_marker.to_string(),
        ));

        Ok(Self {
            shared,
            input,
            state_rx,
            prompt_rx,
            gate: Mutex::new(()),
            _control: control,
        })
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Run one command through the tool.
    ///
    /// Suspends the caller until the session is authenticated and no other
    /// command is in flight, writes the command line, then suspends again
    /// until the tool's prompt returns. Callers are released with an error
    /// if the underlying process dies at any point.
    pub async fn run_command(&self, command: &str) -> Result<(), SessionError> {
        let _turn = self.gate.lock().await;

        let mut state_rx = self.state_rx.clone();
        let mut prompt_rx = self.prompt_rx.clone();

        // Wait until authenticated, idle, and the prompt is available.
        loop {
            match *state_rx.borrow() {
                SessionState::Exited => return Err(SessionError::Exited),
                SessionState::Failed => return Err(SessionError::LoginFailed),
                SessionState::Idle if *prompt_rx.borrow() => break,
                _ => {}
            }
            tokio::select! {
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        return Err(SessionError::Exited);
                    }
                }
                changed = prompt_rx.changed() => {
                    if changed.is_err() {
                        return Err(SessionError::Exited);
                    }
                }
            }
        }

        self.shared.prompt_ready.send_replace(false);
        self.shared.state.send_replace(SessionState::Busy);

        info!(target: "updater", "> {command}");
        if let Err(e) = self.input.lock().await.write_line(command).await {
            // The write never reached the tool; put the session back the
            // way we found it so later submitters are not wedged.
            self.shared.state.send_replace(SessionState::Idle);
            self.shared.prompt_ready.send_replace(true);
            return Err(SessionError::Write(e.to_string()));
        }

        // Wait for the prompt to come back.
        loop {
            match *state_rx.borrow() {
                SessionState::Exited => return Err(SessionError::Exited),
                SessionState::Failed => return Err(SessionError::LoginFailed),
                SessionState::Idle => return Ok(()),
                _ => {}
            }
            if state_rx.changed().await.is_err() {
                return Err(SessionError::Exited);
            }
        }
    }

    /// Update an app to its latest build, optionally on a beta branch.
    pub async fn update_app(
        &self,
        app_id: &str,
        beta_branch: Option<&str>,
    ) -> Result<(), SessionError> {
        let command = match beta_branch {
            Some(branch) => format!("app_update {app_id} -beta {branch}"),
            None => format!("app_update {app_id}"),
        };
        self.run_command(&command).await
    }
}

/// Consume the tool's output lines and advance the state machine.
///
/// Exactly one consumer drains the channel, so no further output can be
/// dispatched while a line is being handled — including while suspended on
/// the operator answering a two-factor prompt.
async fn reader_loop(
    mut output: mpsc::Receiver<ProcessOutput>,
    shared: Arc<Shared>,
    input: Arc<Mutex<ProcessInput>>,
    operator: Arc<dyn OperatorChannel>,
    credentials: Credentials,
    prompt_marker: String,
) {
    shared.state.send_replace(SessionState::AwaitingAuthentication);

    let mut prev_line = String::new();
    let mut retried_login = false;
    let mut exit_code: Option<i32> = None;

    while let Some(message) = output.recv().await {
        let line = match message {
            ProcessOutput::Stdout(line) | ProcessOutput::Stderr(line) => line,
            ProcessOutput::Exit(status) => {
                exit_code = status.code();
                continue;
            }
        };

        let line = line.replace('\r', "");
        if line.trim().is_empty() {
            continue;
        }
        info!(target: "updater", "{line}");

        match classify(&line, &prev_line, &prompt_marker) {
            Some(ProtocolEvent::TwoFactorPrompt) => {
                shared.state.send_replace(SessionState::AwaitingTwoFactor);
                match operator
                    .request_code("Two-factor code required for the updater login")
                    .await
                {
                    Ok(code) => {
                        if let Err(e) = input.lock().await.write_line(&code).await {
                            error!(error = %e, "failed to submit the two-factor code");
                        }
                        shared.state.send_replace(SessionState::AwaitingAuthentication);
                    }
                    Err(e) => {
                        error!(error = %e, "no two-factor code available, login cannot proceed");
                        shared.state.send_replace(SessionState::Failed);
                    }
                }
            }
            Some(ProtocolEvent::MobileConfirmPending) => {
                let _ = operator.notify(&line).await;
            }
            Some(ProtocolEvent::TwoFactorMismatch) => {
                if retried_login {
                    let _ = operator
                        .notify("Updater login failed twice with a two-factor mismatch")
                        .await;
                    shared.state.send_replace(SessionState::Failed);
                } else {
                    retried_login = true;
                    warn!("two-factor code mismatch, retrying login");
                    let retry =
                        format!("login {} {}", credentials.username, credentials.password);
                    if let Err(e) = input.lock().await.write_line(&retry).await {
                        error!(error = %e, "failed to re-issue the login command");
                    }
                }
            }
            Some(ProtocolEvent::Authenticated) => {
                let state = *shared.state.borrow();
                if !state.is_authenticated() && !state.is_terminal() {
                    info!("updater session authenticated");
                    shared.state.send_replace(SessionState::Idle);
                }
            }
            Some(ProtocolEvent::CommandPrompt) => {
                shared.prompt_ready.send_replace(true);
                if *shared.state.borrow() == SessionState::Busy {
                    shared.state.send_replace(SessionState::Idle);
                }
            }
            None => {}
        }

        prev_line = line;
    }

    // Output channel closed: the tool process is gone. Release anyone still
    // waiting in run_command.
    let authenticated = shared.state.borrow().is_authenticated();
    match exit_code {
        Some(code) => info!(code, "updater exited"),
        None => warn!("updater terminated without an exit status"),
    }
    let terminal = if authenticated {
        SessionState::Exited
    } else {
        SessionState::Failed
    };
    shared.state.send_replace(terminal);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct FakeOperator {
        code: String,
        code_requests: AtomicUsize,
        notices: StdMutex<Vec<String>>,
    }

    impl FakeOperator {
        fn new(code: &str) -> Arc<Self> {
            Arc::new(Self {
                code: code.to_string(),
                code_requests: AtomicUsize::new(0),
                notices: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl OperatorChannel for FakeOperator {
        async fn request_code(&self, _prompt: &str) -> Result<String> {
            self.code_requests.fetch_add(1, Ordering::SeqCst);
            Ok(self.code.clone())
        }

        async fn notify(&self, text: &str) -> Result<()> {
            self.notices.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    fn session_over_script(script: &str, operator: Arc<FakeOperator>) -> UpdaterSession {
        let options = ProcessOptions::new("sh").arg("-c").arg(script).pipe_stdin();
        let credentials = Credentials {
            username: "builder".into(),
            password: "hunter2".into(),
        };
        UpdaterSession::spawn_with(options, credentials, "Steam>", operator).unwrap()
    }

    const LOGIN_AND_ECHO_LOOP: &str = r#"
        echo "Waiting for user info..."
        echo "OK"
        echo "Steam>"
        while read cmd; do
            echo "ran $cmd"
            echo "Steam>"
        done
    "#;

    #[tokio::test]
    async fn command_runs_after_authentication() {
        let operator = FakeOperator::new("00000");
        let session = session_over_script(LOGIN_AND_ECHO_LOOP, Arc::clone(&operator));

        session.run_command("app_status 42").await.unwrap();

        assert_eq!(operator.code_requests.load(Ordering::SeqCst), 0);
        assert!(session.state().is_authenticated());
    }

    #[tokio::test]
    async fn two_factor_prompt_requests_exactly_one_code() {
        let operator = FakeOperator::new("91573");
        let script = r#"
            echo "Two-factor code:"
            read code
            echo "code was $code"
            echo "Waiting for user info..."
            echo "OK"
            echo "Steam>"
            while read cmd; do
                echo "Steam>"
            done
        "#;
        let session = session_over_script(script, Arc::clone(&operator));

        session.run_command("licenses_print").await.unwrap();

        assert_eq!(operator.code_requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn mismatched_code_retries_login_once() {
        let operator = FakeOperator::new("91573");
        let script = r#"
            echo "Two-factor code:"
            read code
            echo "FAILED (Two-factor code mismatch)"
            read retry
            echo "retried with: $retry"
            echo "Waiting for user info..."
            echo "OK"
            echo "Steam>"
            while read cmd; do
                echo "Steam>"
            done
        "#;
        let session = session_over_script(script, Arc::clone(&operator));

        session.run_command("info").await.unwrap();

        // One code request; the retry reuses the original credentials.
        assert_eq!(operator.code_requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn repeated_mismatch_fails_login_and_notifies_operator() {
        let operator = FakeOperator::new("91573");
        let script = r#"
            echo "Two-factor code:"
            read code
            echo "FAILED (Two-factor code mismatch)"
            read retry
            echo "FAILED (Two-factor code mismatch)"
            sleep 5
        "#;
        let session = session_over_script(script, Arc::clone(&operator));

        let result = session.run_command("info").await;

        assert!(matches!(result, Err(SessionError::LoginFailed)));
        assert!(!operator.notices.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn commands_complete_in_submission_order() {
        let operator = FakeOperator::new("00000");
        let session = Arc::new(session_over_script(
            LOGIN_AND_ECHO_LOOP,
            Arc::clone(&operator),
        ));

        let completed: Arc<StdMutex<Vec<&'static str>>> = Arc::new(StdMutex::new(Vec::new()));
        let mut handles = Vec::new();
        for name in ["first", "second", "third"] {
            let session = Arc::clone(&session);
            let completed = Arc::clone(&completed);
            handles.push(tokio::spawn(async move {
                session.run_command(name).await.unwrap();
                completed.lock().unwrap().push(name);
            }));
            // Stagger submissions so the queue order is deterministic.
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*completed.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn blocked_caller_is_released_when_the_tool_dies() {
        let operator = FakeOperator::new("00000");
        let script = r#"
            echo "Waiting for user info..."
            echo "OK"
            echo "Steam>"
            read cmd
            exit 3
        "#;
        let session = session_over_script(script, Arc::clone(&operator));

        // The tool reads the command and exits without ever printing the
        // prompt again; the caller must not hang.
        let result = session.run_command("app_update 42").await;

        assert!(matches!(result, Err(SessionError::Exited)));
        assert_eq!(session.state(), SessionState::Exited);
    }

    #[tokio::test]
    async fn caller_is_released_when_login_never_happens() {
        let operator = FakeOperator::new("00000");
        let session = session_over_script("exit 1", Arc::clone(&operator));

        let result = session.run_command("anything").await;

        assert!(matches!(result, Err(SessionError::LoginFailed)));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn update_app_composes_the_branch_flag() {
        let operator = FakeOperator::new("00000");
        let script = r#"
            echo "Waiting for user info..."
            echo "OK"
            echo "Steam>"
            read cmd
            case "$cmd" in
                "app_update 3365820 -beta nightly") echo "Update state (0x61) downloading" ;;
                *) echo "unexpected: $cmd"; exit 9 ;;
            esac
            echo "Steam>"
            read next
        "#;
        let session = session_over_script(script, Arc::clone(&operator));

        session
            .update_app("3365820", Some("nightly"))
            .await
            .unwrap();
    }
}
