//! Histogram sinks for loader metrics
//!
//! Recording is fire-and-forget: a sink never returns anything and never
//! influences loading.

mod recorder;

pub use recorder::{LoadAttempt, LoadCounters, LoadStatusRecorder, load_status};

use std::collections::HashMap;
use std::time::Duration;

use log::debug;
use parking_lot::Mutex;

/// Destination for histogram samples
pub trait MetricsSink: Send + Sync {
    /// Record a sample of an enumerated histogram with values in `0..boundary`
    fn record_enumerated(&self, name: &str, sample: u32, boundary: u32);
    /// Record a duration sample
    fn record_times(&self, name: &str, duration: Duration);
}

/// Writes every sample to the log at debug level
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMetricsSink;

impl MetricsSink for LogMetricsSink {
    fn record_enumerated(&self, name: &str, sample: u32, boundary: u32) {
        debug!(target: "LibraryLoader", "histogram {name}: {sample} (boundary {boundary})");
    }

    fn record_times(&self, name: &str, duration: Duration) {
        debug!(target: "LibraryLoader", "histogram {name}: {} ms", duration.as_millis());
    }
}

/// A recorded histogram sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sample {
    Enumerated(u32),
    Time(Duration),
}

/// Keeps samples in memory, keyed by histogram name
#[derive(Debug, Default)]
pub struct HistogramRecorder {
    samples: Mutex<HashMap<String, Vec<Sample>>>,
}

impl HistogramRecorder {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// All samples recorded for `name`, oldest first
    pub fn samples(&self, name: &str) -> Vec<Sample> {
        self.samples.lock().get(name).cloned().unwrap_or_default()
    }

    /// Number of samples equal to `sample` in an enumerated histogram
    pub fn count(&self, name: &str, sample: u32) -> usize {
        self.samples(name)
            .iter()
            .filter(|s| **s == Sample::Enumerated(sample))
            .count()
    }

    /// Total samples across all histograms
    pub fn total(&self) -> usize {
        self.samples.lock().values().map(Vec::len).sum()
    }

    /// Histogram names in sorted order
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.samples.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Summary of time histograms in milliseconds
    pub fn summary(&self) -> HashMap<String, f64> {
        self.samples
            .lock()
            .iter()
            .filter_map(|(name, samples)| {
                let total: Duration = samples
                    .iter()
                    .filter_map(|s| match s {
                        Sample::Time(d) => Some(*d),
                        Sample::Enumerated(_) => None,
                    })
                    .sum();
                (total > Duration::ZERO).then(|| (name.clone(), total.as_secs_f64() * 1000.0))
            })
            .collect()
    }

    fn push(&self, name: &str, sample: Sample) {
        self.samples
            .lock()
            .entry(name.to_string())
            .or_default()
            .push(sample);
    }
}

impl MetricsSink for HistogramRecorder {
    fn record_enumerated(&self, name: &str, sample: u32, boundary: u32) {
        debug_assert!(sample < boundary, "{name}: sample {sample} >= {boundary}");
        self.push(name, Sample::Enumerated(sample));
    }

    fn record_times(&self, name: &str, duration: Duration) {
        self.push(name, Sample::Time(duration));
    }
}
