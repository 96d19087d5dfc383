//! Load attempt bookkeeping
//!
//! Attempts happen before the process role is known, so they are buffered
//! and emitted once [`LoadStatusRecorder::set_process_type`] is called.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::MetricsSink;
use crate::process::ProcessType;

/// Bits of the load status histogram sample
pub mod load_status {
    pub const SUCCESS: u32 = 1 << 0;
    pub const FIRST_ATTEMPT: u32 = 1 << 1;
    pub const FIXED_ADDRESS: u32 = 1 << 2;
    pub const BOUNDARY: u32 = 1 << 3;

    pub const BROWSER_HISTOGRAM: &str = "ChromiumAndroidLinker.BrowserLoadStatus";
    pub const RENDERER_HISTOGRAM: &str = "ChromiumAndroidLinker.RendererLoadStatus";
}

/// One attempt to load the library
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadAttempt {
    pub is_first_attempt: bool,
    pub load_at_fixed_address: bool,
    pub success: bool,
}

impl LoadAttempt {
    pub fn new(success: bool, is_first_attempt: bool, load_at_fixed_address: bool) -> Self {
        Self {
            is_first_attempt,
            load_at_fixed_address,
            success,
        }
    }

    /// Histogram sample for this attempt
    pub fn sample(&self) -> u32 {
        let mut sample = 0;
        if self.success {
            sample |= load_status::SUCCESS;
        }
        if self.is_first_attempt {
            sample |= load_status::FIRST_ATTEMPT;
        }
        if self.load_at_fixed_address {
            sample |= load_status::FIXED_ADDRESS;
        }
        sample
    }
}

/// Aggregate attempt counters
#[derive(Debug, Default)]
pub struct LoadCounters {
    pub attempts: AtomicUsize,
    pub successes: AtomicUsize,
    pub fixed_address_failures: AtomicUsize,
}

impl LoadCounters {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn successes(&self) -> usize {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn fixed_address_failures(&self) -> usize {
        self.fixed_address_failures.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
struct RecorderState {
    process_type: Option<ProcessType>,
    pending: Vec<LoadAttempt>,
    history: Vec<LoadAttempt>,
}

/// Accumulates load attempts for later reporting
#[derive(Debug, Default)]
pub struct LoadStatusRecorder {
    state: Mutex<RecorderState>,
    counters: LoadCounters,
}

impl LoadStatusRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an attempt; emitted once the process type is known
    pub fn record_load_attempt(&self, attempt: LoadAttempt) {
        self.counters.attempts.fetch_add(1, Ordering::Relaxed);
        if attempt.success {
            self.counters.successes.fetch_add(1, Ordering::Relaxed);
        } else if attempt.load_at_fixed_address {
            self.counters
                .fixed_address_failures
                .fetch_add(1, Ordering::Relaxed);
        }

        let mut state = self.state.lock();
        state.history.push(attempt);
        state.pending.push(attempt);
    }

    /// Set the process type and flush buffered attempts to `sink`
    pub fn set_process_type(&self, process_type: ProcessType, sink: &dyn MetricsSink) {
        let pending = {
            let mut state = self.state.lock();
            state.process_type = Some(process_type);
            std::mem::take(&mut state.pending)
        };

        let histogram = if process_type.is_browser() {
            load_status::BROWSER_HISTOGRAM
        } else {
            load_status::RENDERER_HISTOGRAM
        };
        for attempt in pending {
            sink.record_enumerated(histogram, attempt.sample(), load_status::BOUNDARY);
        }
    }

    /// Process type, if already set
    pub fn process_type(&self) -> Option<ProcessType> {
        self.state.lock().process_type
    }

    /// Every attempt recorded so far
    pub fn attempts(&self) -> Vec<LoadAttempt> {
        self.state.lock().history.clone()
    }

    /// Aggregate counters
    pub fn counters(&self) -> &LoadCounters {
        &self.counters
    }
}
