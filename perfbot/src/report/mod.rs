//! Artifact sink: where uploads, status lines, and summaries go.
//!
//! Core components only talk to the [`ArtifactSink`] trait; the production
//! [`DirectorySink`] lands everything in a local reports tree. Tests plug in
//! their own recording sinks.

mod status;

pub use status::StatusBoard;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

use crate::telemetry::stats::PerformanceSummary;

/// Metadata accompanying a persisted summary.
#[derive(Debug, Clone, Serialize)]
pub struct ReportContext {
    /// Name of the CSV file the summary was computed from.
    pub csv_file: String,
    /// Rendered chart image, when visualization succeeded.
    pub image: Option<PathBuf>,
    /// When the report was produced.
    pub created: DateTime<Utc>,
}

/// Destination for files, status text, and performance summaries.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    /// Upload a file with a short caption.
    async fn upload_file(&self, path: &Path, caption: &str) -> Result<()>;

    /// Append a line to the status window identified by `id`.
    async fn update_status(&self, id: Uuid, text: &str) -> Result<()>;

    /// Persist a completed performance summary.
    async fn persist_summary(
        &self,
        summary: &PerformanceSummary,
        context: &ReportContext,
    ) -> Result<()>;
}

/// Sink writing into a local reports directory: uploads are copied under
/// `uploads/`, summaries are persisted as JSON, status windows are logged.
pub struct DirectorySink {
    root: PathBuf,
    board: StatusBoard,
}

impl DirectorySink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            board: StatusBoard::new(),
        }
    }

    /// The status board backing `update_status`.
    pub fn board(&self) -> &StatusBoard {
        &self.board
    }
}

#[async_trait]
impl ArtifactSink for DirectorySink {
    async fn upload_file(&self, path: &Path, caption: &str) -> Result<()> {
        let uploads = self.root.join("uploads");
        tokio::fs::create_dir_all(&uploads)
            .await
            .with_context(|| format!("failed to create {}", uploads.display()))?;

        let name = path
            .file_name()
            .with_context(|| format!("upload path has no file name: {}", path.display()))?;
        let dest = uploads.join(name);
        tokio::fs::copy(path, &dest)
            .await
            .with_context(|| format!("failed to copy {} into uploads", path.display()))?;

        info!(target: "sink", file = %dest.display(), "{caption}");
        Ok(())
    }

    async fn update_status(&self, id: Uuid, text: &str) -> Result<()> {
        self.board.append(id, text);
        info!(target: "status", %id, "{text}");
        Ok(())
    }

    async fn persist_summary(
        &self,
        summary: &PerformanceSummary,
        context: &ReportContext,
    ) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("failed to create {}", self.root.display()))?;

        #[derive(Serialize)]
        struct Report<'a> {
            #[serde(flatten)]
            context: &'a ReportContext,
            summary: &'a PerformanceSummary,
        }

        let json = serde_json::to_string_pretty(&Report { context, summary })?;
        let stem = context.csv_file.trim_end_matches(".csv");
        let path = self.root.join(format!(
            "report-{}-{stem}.json",
            context.created.format("%Y%m%d%H%M%S")
        ));
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;

        info!(
            target: "sink",
            report = %path.display(),
            avg_frame_ms = summary.frame_time.average,
            avg_fps = 1000.0 / summary.frame_time.average,
            p95_frame_ms = summary.frame_time.percentile_95,
            worst_frame_ms = summary.frame_time.maximum,
            samples = summary.sample_count,
            "performance report persisted"
        );
        Ok(())
    }
}
