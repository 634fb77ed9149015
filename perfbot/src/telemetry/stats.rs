//! Nearest-rank statistics over performance samples.

use serde::Serialize;

/// One parsed telemetry row: all timings in milliseconds, non-negative.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerformanceSample {
    pub frame_time: f32,
    pub game_thread: f32,
    pub render_thread: f32,
    pub gpu: f32,
}

/// Per-metric reduction of a sample set. Immutable once computed.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MetricSummary {
    pub average: f32,
    pub percentile_95: f32,
    pub percentile_99: f32,
    pub maximum: f32,
}

impl MetricSummary {
    /// Reduce a sample list. Returns `None` for an empty list.
    pub fn from_samples(samples: &[f32]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }

        let mut sorted = samples.to_vec();
        sorted.sort_by(f32::total_cmp);

        let sum: f32 = samples.iter().sum();
        #[allow(clippy::cast_precision_loss)]
        let average = sum / samples.len() as f32;

        Some(Self {
            average,
            percentile_95: nearest_rank(&sorted, 0.95),
            percentile_99: nearest_rank(&sorted, 0.99),
            maximum: *sorted.last()?,
        })
    }
}

/// Nearest-rank percentile: index into the ascending-sorted slice at
/// `floor(count * p)`, clamped to the last element. No interpolation.
///
/// `sorted` must be non-empty and sorted ascending.
pub fn nearest_rank(sorted: &[f32], p: f32) -> f32 {
    debug_assert!(!sorted.is_empty());
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let index = (sorted.len() as f32 * p).floor() as usize;
    sorted[index.min(sorted.len().saturating_sub(1))]
}

/// Accumulated per-metric sample lists for one telemetry file.
#[derive(Debug, Default)]
pub struct SampleSet {
    pub frame_time: Vec<f32>,
    pub game_thread: Vec<f32>,
    pub render_thread: Vec<f32>,
    pub gpu: Vec<f32>,
}

impl SampleSet {
    /// Append one parsed row to every metric list.
    pub fn push(&mut self, sample: PerformanceSample) {
        self.frame_time.push(sample.frame_time);
        self.game_thread.push(sample.game_thread);
        self.render_thread.push(sample.render_thread);
        self.gpu.push(sample.gpu);
    }

    pub fn len(&self) -> usize {
        self.frame_time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frame_time.is_empty()
    }

    /// Reduce every metric. Returns `None` when no samples were collected.
    pub fn summarize(&self) -> Option<PerformanceSummary> {
        Some(PerformanceSummary {
            frame_time: MetricSummary::from_samples(&self.frame_time)?,
            game_thread: MetricSummary::from_samples(&self.game_thread)?,
            render_thread: MetricSummary::from_samples(&self.render_thread)?,
            gpu: MetricSummary::from_samples(&self.gpu)?,
            sample_count: self.len(),
        })
    }
}

/// Full performance summary for one profiling run.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceSummary {
    pub frame_time: MetricSummary,
    pub game_thread: MetricSummary,
    pub render_thread: MetricSummary,
    pub gpu: MetricSummary,
    pub sample_count: usize,
}
