//! Performance CSV extraction.
//!
//! The profiled build writes one log subdirectory per run. New
//! subdirectories are detected by set difference against a snapshot taken
//! before the run, which scopes extraction to the current session and keeps
//! stale runs out of the statistics.

use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::fs;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::process::{spawn_process, ProcessOptions};
use crate::report::{ArtifactSink, ReportContext};
use crate::telemetry::stats::{PerformanceSample, PerformanceSummary, SampleSet};

/// Banner rows the capture tool writes before the column header.
const METADATA_ROWS: usize = 1;

/// Data rows dropped right after the header; row 0 and rows past the range
/// are kept.
const DROPPED_ROWS_AFTER_HEADER: RangeInclusive<usize> = 1..=10;

/// Upper bound on a single chart-tool invocation.
const CHART_TIMEOUT: Duration = Duration::from_secs(120);

/// Extracts performance summaries from per-run CSV logs.
pub struct PerfExtractor {
    log_dir: PathBuf,
    warmup_samples: usize,
    chart_tool: Option<PathBuf>,
}

impl PerfExtractor {
    pub fn new(
        log_dir: impl Into<PathBuf>,
        warmup_samples: usize,
        chart_tool: Option<PathBuf>,
    ) -> Self {
        Self {
            log_dir: log_dir.into(),
            warmup_samples,
            chart_tool,
        }
    }

    /// Snapshot the current set of log subdirectories. Taken before a run;
    /// `extract` only looks at directories that appeared since.
    pub fn snapshot(&self) -> Result<HashSet<PathBuf>> {
        fs::create_dir_all(&self.log_dir)
            .with_context(|| format!("failed to create {}", self.log_dir.display()))?;

        let mut dirs = HashSet::new();
        for entry in fs::read_dir(&self.log_dir)
            .with_context(|| format!("failed to read {}", self.log_dir.display()))?
        {
            let entry = entry?;
            if entry.metadata()?.is_dir() {
                dirs.insert(entry.path());
            }
        }
        Ok(dirs)
    }

    /// Process every CSV in log subdirectories created since `before`.
    pub async fn extract(
        &self,
        before: &HashSet<PathBuf>,
        status_id: Uuid,
        sink: &dyn ArtifactSink,
    ) -> Result<Vec<PerformanceSummary>> {
        let after = self.snapshot()?;
        let mut new_dirs: Vec<&PathBuf> = after.difference(before).collect();
        new_dirs.sort();

        if new_dirs.is_empty() {
            let _ = sink
                .update_status(status_id, "No new performance logs found")
                .await;
            return Ok(Vec::new());
        }

        let mut summaries = Vec::new();
        for dir in new_dirs {
            for csv in Self::csv_files(dir)? {
                let name = csv
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| csv.display().to_string());

                if let Err(e) = sink.upload_file(&csv, "Raw performance log").await {
                    warn!(file = %csv.display(), error = %e, "raw log upload failed");
                    let _ = sink
                        .update_status(status_id, &format!("Upload of {name} failed: {e}"))
                        .await;
                }

                let (processed, samples) = self.process_csv(&csv)?;
                let Some(summary) = samples.summarize() else {
                    warn!(file = %csv.display(), "no samples left after warm-up");
                    let _ = sink
                        .update_status(status_id, &format!("{name} had no usable samples"))
                        .await;
                    continue;
                };

                let image = self.render_chart(&processed, status_id, sink).await;

                let context = ReportContext {
                    csv_file: name.clone(),
                    image,
                    created: chrono::Utc::now(),
                };
                sink.persist_summary(&summary, &context).await?;
                let _ = sink
                    .update_status(
                        status_id,
                        &format!("Report created from {name} ({} samples)", summary.sample_count),
                    )
                    .await;
                summaries.push(summary);
            }
        }

        Ok(summaries)
    }

    /// CSV files in one run directory, skipping processed outputs from an
    /// earlier pass.
    fn csv_files(dir: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in
            fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))?
        {
            let path = entry?.path();
            let is_csv = path.extension().is_some_and(|ext| ext == "csv");
            let is_processed = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .is_some_and(|stem| stem.ends_with("_processed"));
            if is_csv && !is_processed {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Rewrite one CSV without its metadata head and dropped rows, and parse
    /// the remaining rows into samples (discarding the warm-up).
    fn process_csv(&self, path: &Path) -> Result<(PathBuf, SampleSet)> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let rows: Vec<&str> = content.lines().collect();

        let body = rows.get(METADATA_ROWS..).unwrap_or(&[]);
        let Some((header, data)) = body.split_first() else {
            bail!("{} has no header row", path.display());
        };

        let kept: Vec<&str> = data
            .iter()
            .enumerate()
            .filter(|(index, _)| !DROPPED_ROWS_AFTER_HEADER.contains(index))
            .map(|(_, row)| *row)
            .collect();

        let stem = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .with_context(|| format!("{} has no usable file stem", path.display()))?;
        let processed = path.with_file_name(format!("{stem}_processed.csv"));

        let mut output = String::with_capacity(content.len());
        output.push_str(header);
        output.push('\n');
        for row in &kept {
            output.push_str(row);
            output.push('\n');
        }
        fs::write(&processed, output)
            .with_context(|| format!("failed to write {}", processed.display()))?;

        let mut samples = SampleSet::default();
        for (index, row) in kept.iter().enumerate().skip(self.warmup_samples) {
            match Self::parse_row(row) {
                Some(sample) => samples.push(sample),
                None => {
                    warn!(file = %path.display(), row = index, "skipping malformed telemetry row");
                }
            }
        }

        info!(
            file = %path.display(),
            kept = kept.len(),
            samples = samples.len(),
            warmup = self.warmup_samples,
            "processed performance log"
        );
        Ok((processed, samples))
    }

    /// Parse one data row: time, frame time, game thread, render thread,
    /// gpu. The time column is not used by the statistics.
    fn parse_row(line: &str) -> Option<PerformanceSample> {
        let mut columns = line.split(',');
        let _time = columns.next()?;
        let frame_time: f32 = columns.next()?.trim().parse().ok()?;
        let game_thread: f32 = columns.next()?.trim().parse().ok()?;
        let render_thread: f32 = columns.next()?.trim().parse().ok()?;
        let gpu: f32 = columns.next()?.trim().parse().ok()?;

        let sample = PerformanceSample {
            frame_time,
            game_thread,
            render_thread,
            gpu,
        };
        let non_negative = frame_time >= 0.0 && game_thread >= 0.0 && render_thread >= 0.0 && gpu >= 0.0;
        non_negative.then_some(sample)
    }

    /// Render a comparison chart for the processed CSV through the external
    /// tool. A missing tool skips the step; a failing tool is reported and
    /// the pipeline continues without an image.
    async fn render_chart(
        &self,
        csv: &Path,
        status_id: Uuid,
        sink: &dyn ArtifactSink,
    ) -> Option<PathBuf> {
        let tool = self.chart_tool.as_ref()?;
        if !tool.exists() {
            info!(tool = %tool.display(), "chart tool not present, skipping visualization");
            return None;
        }

        let image = csv.with_extension("png");
        let options = ProcessOptions::new(tool.display().to_string())
            .arg(csv.display().to_string())
            .arg(image.display().to_string())
            .timeout(CHART_TIMEOUT);

        match spawn_process(options).await {
            Ok(result) if result.success() && image.exists() => {
                info!(image = %image.display(), "chart rendered");
                Some(image)
            }
            Ok(result) => {
                warn!(stderr = %result.stderr_string(), "chart tool failed");
                let _ = sink
                    .update_status(status_id, "Chart rendering failed; report has no image")
                    .await;
                None
            }
            Err(e) => {
                warn!(error = %e, "chart tool could not run");
                let _ = sink
                    .update_status(status_id, "Chart rendering failed; report has no image")
                    .await;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::stats::PerformanceSummary;
    use async_trait::async_trait;
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

    /// Build a CSV with a banner row, a header, and the given frame times
    /// (other metrics derived from the frame time).
    fn write_csv(path: &Path, frame_times: &[f32]) {
        let mut content = String::from("capture device: test rig\n");
        content.push_str("time,frametime,gamethread,renderthread,gpu\n");
        for (n, frame) in frame_times.iter().enumerate() {
            content.push_str(&format!(
                "{n},{frame},{},{},{}\n",
                frame / 2.0,
                frame / 3.0,
                frame / 1.5
            ));
        }
        fs::write(path, content).unwrap();
    }

    #[test]
    fn processed_csv_drops_rows_one_through_ten() {
        let dir = tempdir().unwrap();
        let csv = dir.path().join("run.csv");
        // Row values 0..=14 so each row is identifiable by its frame time.
        let frames: Vec<f32> = (0..15).map(|n| n as f32).collect();
        write_csv(&csv, &frames);

        let extractor = PerfExtractor::new(dir.path(), 0, None);
        let (processed, samples) = extractor.process_csv(&csv).unwrap();

        let content = fs::read_to_string(&processed).unwrap();
        let rows: Vec<&str> = content.lines().collect();
        // Header, row 0, rows 11..=14.
        assert_eq!(rows.len(), 6);
        assert!(rows[0].starts_with("time,"));
        assert!(rows[1].starts_with("0,0"));
        assert!(rows[2].starts_with("11,11"));

        assert_eq!(samples.frame_time, vec![0.0, 11.0, 12.0, 13.0, 14.0]);
    }

    #[test]
    fn warmup_rows_are_discarded_before_statistics() {
        let dir = tempdir().unwrap();
        let csv = dir.path().join("run.csv");
        // Kept rows end up as [20, 21, 19, 18, 22, 17, 16]: row 0, then
        // rows 11..=16 after the dropped range.
        let mut frames = vec![20.0];
        frames.extend(std::iter::repeat(99.0).take(10));
        frames.extend([21.0, 19.0, 18.0, 22.0, 17.0, 16.0]);
        write_csv(&csv, &frames);

        let extractor = PerfExtractor::new(dir.path(), 3, None);
        let (_, samples) = extractor.process_csv(&csv).unwrap();

        assert_eq!(samples.frame_time, vec![18.0, 22.0, 17.0, 16.0]);
        let summary = samples.summarize().unwrap();
        assert!((summary.frame_time.average - 18.25).abs() < f32::EPSILON);
        assert_eq!(summary.frame_time.maximum, 22.0);
        assert_eq!(summary.frame_time.percentile_95, 22.0);
    }

    #[test]
    fn malformed_rows_are_skipped() {
        let dir = tempdir().unwrap();
        let csv = dir.path().join("run.csv");
        // Malformed rows sit past the dropped range so they reach the parser:
        // row 11 is not numeric, row 12 has a negative timing.
        let mut content = String::from("banner\ntime,frametime,gamethread,renderthread,gpu\n");
        content.push_str("0,16.0,8.0,6.0,12.0\n");
        for n in 1..=10 {
            content.push_str(&format!("{n},99.0,9.0,9.0,9.0\n"));
        }
        content.push_str("11,not-a-number,8.0,6.0,12.0\n");
        content.push_str("12,17.0,-1.0,6.0,12.0\n");
        content.push_str("13,18.0,8.0,6.0,12.0\n");
        fs::write(&csv, content).unwrap();

        let extractor = PerfExtractor::new(dir.path(), 0, None);
        let (_, samples) = extractor.process_csv(&csv).unwrap();

        assert_eq!(samples.frame_time, vec![16.0, 18.0]);
    }

    #[tokio::test]
    async fn extract_only_sees_directories_created_after_snapshot() {
        let dir = tempdir().unwrap();
        let log_dir = dir.path().join("logs");
        let stale = log_dir.join("StaleRun");
        fs::create_dir_all(&stale).unwrap();
        write_csv(&stale.join("stale.csv"), &[50.0; 40]);

        let extractor = PerfExtractor::new(&log_dir, 0, None);
        let before = extractor.snapshot().unwrap();

        let fresh = log_dir.join("FreshRun");
        fs::create_dir_all(&fresh).unwrap();
        write_csv(&fresh.join("fresh.csv"), &[16.0; 40]);

        let summaries = extractor
            .extract(&before, Uuid::now_v7(), &NullSink)
            .await
            .unwrap();

        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].frame_time.maximum, 16.0);
    }

    #[tokio::test]
    async fn extract_with_no_new_directories_is_empty() {
        let dir = tempdir().unwrap();
        let extractor = PerfExtractor::new(dir.path(), 0, None);
        let before = extractor.snapshot().unwrap();

        let summaries = extractor
            .extract(&before, Uuid::now_v7(), &NullSink)
            .await
            .unwrap();
        assert!(summaries.is_empty());
    }

    #[tokio::test]
    async fn missing_chart_tool_skips_visualization() {
        let dir = tempdir().unwrap();
        let log_dir = dir.path().join("logs");
        let extractor = PerfExtractor::new(
            &log_dir,
            0,
            Some(PathBuf::from("/nonexistent/chart-tool")),
        );
        let before = extractor.snapshot().unwrap();

        let run = log_dir.join("Run");
        fs::create_dir_all(&run).unwrap();
        write_csv(&run.join("run.csv"), &[16.0; 40]);

        let summaries = extractor
            .extract(&before, Uuid::now_v7(), &NullSink)
            .await
            .unwrap();
        assert_eq!(summaries.len(), 1);
    }

    #[tokio::test]
    async fn processed_outputs_are_not_reprocessed() {
        let dir = tempdir().unwrap();
        let log_dir = dir.path().join("logs");
        let extractor = PerfExtractor::new(&log_dir, 0, None);
        let before = extractor.snapshot().unwrap();

        let run = log_dir.join("Run");
        fs::create_dir_all(&run).unwrap();
        write_csv(&run.join("run.csv"), &[16.0; 40]);

        let first = extractor
            .extract(&before, Uuid::now_v7(), &NullSink)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        // The same directory is still "new" relative to the old snapshot,
        // but the processed output must not be treated as a fresh log.
        let again = extractor
            .extract(&before, Uuid::now_v7(), &NullSink)
            .await
            .unwrap();
        assert_eq!(again.len(), 1);
        assert!(run.join("run_processed.csv").exists());
        assert!(!run.join("run_processed_processed.csv").exists());
    }
}
