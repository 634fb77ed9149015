//! Trace artifact collection.
//!
//! The profiled build drops `.utrace` files named after their creation time
//! into a well-known directory. Files created after the owning session
//! started are claimed by moving them into the claimed directory — a move,
//! never a copy, so a file can be collected exactly once — then uploaded and
//! optionally archived through an external tool.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::process::{spawn_process, ProcessOptions};
use crate::report::ArtifactSink;

/// Files above this size are not handed to the archive tool.
const ARCHIVE_SIZE_LIMIT_BYTES: u64 = 100 * 1024 * 1024;

/// Upper bound on a single archive-tool invocation.
const ARCHIVE_TIMEOUT: Duration = Duration::from_secs(600);

/// Digits of a trace filename, separators stripped.
const TRACE_TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// A trace file eligible for collection.
#[derive(Debug, Clone)]
pub struct TraceArtifact {
    /// Current location of the file.
    pub path: PathBuf,
    /// Creation time embedded in the filename.
    pub timestamp: NaiveDateTime,
    /// Size in bytes.
    pub size_bytes: u64,
}

/// Collects trace artifacts produced during a game session.
pub struct TraceCollector {
    trace_dir: PathBuf,
    claimed_dir: PathBuf,
    archive_tool: Option<PathBuf>,
}

impl TraceCollector {
    pub fn new(
        trace_dir: impl Into<PathBuf>,
        claimed_dir: impl Into<PathBuf>,
        archive_tool: Option<PathBuf>,
    ) -> Self {
        Self {
            trace_dir: trace_dir.into(),
            claimed_dir: claimed_dir.into(),
            archive_tool,
        }
    }

    /// Parse the `<date>_<time>.utrace` filename timestamp.
    pub fn parse_timestamp(name: &str) -> Option<NaiveDateTime> {
        let pattern = Regex::new(r"^(\d{8})_(\d{6})\.utrace$").ok()?;
        let captures = pattern.captures(name)?;
        let digits = format!("{}{}", &captures[1], &captures[2]);
        NaiveDateTime::parse_from_str(&digits, TRACE_TIMESTAMP_FORMAT).ok()
    }

    /// Scan the trace directory for files created strictly after `after`.
    fn scan(&self, after: NaiveDateTime) -> Result<Vec<TraceArtifact>> {
        fs::create_dir_all(&self.trace_dir)
            .with_context(|| format!("failed to create {}", self.trace_dir.display()))?;

        let mut artifacts = Vec::new();
        for entry in fs::read_dir(&self.trace_dir)
            .with_context(|| format!("failed to read {}", self.trace_dir.display()))?
        {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(timestamp) = Self::parse_timestamp(name) else {
                continue;
            };
            if timestamp <= after {
                continue;
            }

            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }

            artifacts.push(TraceArtifact {
                path: entry.path(),
                timestamp,
                size_bytes: metadata.len(),
            });
        }

        artifacts.sort_by_key(|artifact| artifact.timestamp);
        Ok(artifacts)
    }

    /// Claim every eligible trace file, upload it, and archive it when
    /// configured. Returns the claimed artifacts at their new locations.
    pub async fn collect(
        &self,
        session_start: NaiveDateTime,
        status_id: Uuid,
        sink: &dyn ArtifactSink,
    ) -> Result<Vec<TraceArtifact>> {
        fs::create_dir_all(&self.claimed_dir)
            .with_context(|| format!("failed to create {}", self.claimed_dir.display()))?;

        let eligible = self.scan(session_start)?;
        if eligible.is_empty() {
            let _ = sink.update_status(status_id, "No new trace files found").await;
            return Ok(Vec::new());
        }

        let mut claimed = Vec::new();
        for artifact in eligible {
            let name = artifact
                .path
                .file_name()
                .context("trace path has no file name")?
                .to_owned();
            let dest = self.claimed_dir.join(&name);

            if let Err(e) = fs::rename(&artifact.path, &dest) {
                warn!(file = %artifact.path.display(), error = %e, "failed to claim trace file");
                let _ = sink
                    .update_status(
                        status_id,
                        &format!("Failed to claim {}: {e}", name.to_string_lossy()),
                    )
                    .await;
                continue;
            }

            info!(file = %dest.display(), size = artifact.size_bytes, "claimed trace file");
            let caption = format!(
                "Trace {} ({:.1} MB)",
                name.to_string_lossy(),
                artifact.size_bytes as f64 / (1024.0 * 1024.0)
            );
            if let Err(e) = sink.upload_file(&dest, &caption).await {
                warn!(error = %e, "trace upload failed");
                let _ = sink
                    .update_status(status_id, &format!("Upload failed: {e}"))
                    .await;
            }

            self.archive(&dest, artifact.size_bytes, status_id, sink).await;

            claimed.push(TraceArtifact {
                path: dest,
                timestamp: artifact.timestamp,
                size_bytes: artifact.size_bytes,
            });
        }

        let _ = sink
            .update_status(status_id, &format!("Collected {} trace file(s)", claimed.len()))
            .await;
        Ok(claimed)
    }

    /// Archive one claimed file through the external tool. Failures are
    /// reported but never abort collection.
    async fn archive(&self, path: &Path, size_bytes: u64, status_id: Uuid, sink: &dyn ArtifactSink) {
        let Some(tool) = &self.archive_tool else {
            return;
        };

        let name = path.file_name().map(|n| n.to_string_lossy().into_owned());
        let name = name.unwrap_or_else(|| path.display().to_string());

        if size_bytes > ARCHIVE_SIZE_LIMIT_BYTES {
            warn!(file = %path.display(), size = size_bytes, "trace exceeds archive size limit, skipping");
            let _ = sink
                .update_status(
                    status_id,
                    &format!("Skipped archiving {name} (over 100 MB)"),
                )
                .await;
            return;
        }

        let options = ProcessOptions::new(tool.display().to_string())
            .arg(path.display().to_string())
            .working_dir(&self.claimed_dir)
            .timeout(ARCHIVE_TIMEOUT);

        match spawn_process(options).await {
            Ok(result) if result.success() => {
                info!(file = %path.display(), "trace archived");
            }
            Ok(result) => {
                warn!(file = %path.display(), stderr = %result.stderr_string(), "archive tool failed");
                let _ = sink
                    .update_status(status_id, &format!("Archiving {name} failed"))
                    .await;
            }
            Err(e) => {
                warn!(file = %path.display(), error = %e, "archive tool could not run");
                let _ = sink
                    .update_status(status_id, &format!("Archiving {name} failed: {e}"))
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::ReportContext;
    use crate::telemetry::stats::PerformanceSummary;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    struct NullSink;

    #[async_trait]
    impl ArtifactSink for NullSink {
        async fn upload_file(&self, _path: &Path, _caption: &str) -> Result<()> {
            Ok(())
        }

        async fn update_status(&self, _id: Uuid, _text: &str) -> Result<()> {
            Ok(())
        }

        async fn persist_summary(
            &self,
            _summary: &PerformanceSummary,
            _context: &ReportContext,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn date(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, s)
            .unwrap()
    }

    #[test]
    fn parses_trace_filename_timestamp() {
        let timestamp = TraceCollector::parse_timestamp("20250519_143005.utrace").unwrap();
        assert_eq!(timestamp, date(2025, 5, 19, 14, 30, 5));
    }

    #[test]
    fn rejects_foreign_filenames() {
        assert!(TraceCollector::parse_timestamp("notes.txt").is_none());
        assert!(TraceCollector::parse_timestamp("20250519.utrace").is_none());
        assert!(TraceCollector::parse_timestamp("20251399_999999.utrace").is_none());
    }

    #[tokio::test]
    async fn claims_each_eligible_file_exactly_once() {
        let dir = tempdir().unwrap();
        let trace_dir = dir.path().join("traces");
        let claimed_dir = dir.path().join("claimed");
        std::fs::create_dir_all(&trace_dir).unwrap();
        std::fs::write(trace_dir.join("20250519_143005.utrace"), b"trace").unwrap();

        let collector = TraceCollector::new(&trace_dir, &claimed_dir, None);
        let start = date(2025, 5, 19, 14, 0, 0);

        let first = collector
            .collect(start, Uuid::now_v7(), &NullSink)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert!(claimed_dir.join("20250519_143005.utrace").exists());
        assert!(!trace_dir.join("20250519_143005.utrace").exists());

        let second = collector
            .collect(start, Uuid::now_v7(), &NullSink)
            .await
            .unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn ignores_files_from_before_the_session() {
        let dir = tempdir().unwrap();
        let trace_dir = dir.path().join("traces");
        std::fs::create_dir_all(&trace_dir).unwrap();
        std::fs::write(trace_dir.join("20250519_120000.utrace"), b"stale").unwrap();
        std::fs::write(trace_dir.join("20250519_150000.utrace"), b"fresh").unwrap();

        let collector = TraceCollector::new(&trace_dir, dir.path().join("claimed"), None);
        let start = date(2025, 5, 19, 14, 0, 0);

        let claimed = collector
            .collect(start, Uuid::now_v7(), &NullSink)
            .await
            .unwrap();

        assert_eq!(claimed.len(), 1);
        assert!(claimed[0].path.ends_with("20250519_150000.utrace"));
        // The stale file stays where it was.
        assert!(trace_dir.join("20250519_120000.utrace").exists());
    }

    #[tokio::test]
    async fn boundary_timestamp_is_not_eligible() {
        let dir = tempdir().unwrap();
        let trace_dir = dir.path().join("traces");
        std::fs::create_dir_all(&trace_dir).unwrap();
        std::fs::write(trace_dir.join("20250519_140000.utrace"), b"boundary").unwrap();

        let collector = TraceCollector::new(&trace_dir, dir.path().join("claimed"), None);
        // Strictly-after comparison: equal timestamps stay unclaimed.
        let start = date(2025, 5, 19, 14, 0, 0);

        let claimed = collector
            .collect(start, Uuid::now_v7(), &NullSink)
            .await
            .unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn archive_failure_does_not_abort_collection() {
        let dir = tempdir().unwrap();
        let trace_dir = dir.path().join("traces");
        std::fs::create_dir_all(&trace_dir).unwrap();
        std::fs::write(trace_dir.join("20250519_150000.utrace"), b"fresh").unwrap();

        let collector = TraceCollector::new(
            &trace_dir,
            dir.path().join("claimed"),
            Some(PathBuf::from("/nonexistent/archive-tool")),
        );
        let start = date(2025, 5, 19, 14, 0, 0);

        let claimed = collector
            .collect(start, Uuid::now_v7(), &NullSink)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
    }
}
