//! Telemetry harvesting: trace artifacts and performance CSV statistics.

pub mod stats;

mod perf;
mod trace;

pub use perf::PerfExtractor;
pub use trace::{TraceArtifact, TraceCollector};
