//! Operator interaction channel.
//!
//! Some login steps need a human: a two-factor code, or acknowledging a
//! confirmation happening on another device. This trait is the narrow seam
//! through which that interaction flows, so core code never talks to a
//! concrete frontend.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

/// Channel for requesting input from, or pushing notices to, a human
/// operator.
#[async_trait]
pub trait OperatorChannel: Send + Sync {
    /// Ask the operator for a short code. Suspends until answered.
    async fn request_code(&self, prompt: &str) -> Result<String>;

    /// Deliver a notice to the operator. Best-effort.
    async fn notify(&self, text: &str) -> Result<()>;
}

/// Operator channel backed by the controlling terminal: prompts on stdout
/// and reads the reply from stdin.
pub struct TerminalOperator;

#[async_trait]
impl OperatorChannel for TerminalOperator {
    async fn request_code(&self, prompt: &str) -> Result<String> {
        println!("{prompt}");

        let mut line = String::new();
        BufReader::new(tokio::io::stdin())
            .read_line(&mut line)
            .await
            .context("failed to read the code from the terminal")?;

        Ok(line.trim().to_string())
    }

    async fn notify(&self, text: &str) -> Result<()> {
        info!(target: "operator", "{text}");
        println!("{text}");
        Ok(())
    }
}
