//! Rolling statistics for the admission queue.

use std::collections::VecDeque;
use std::time::Duration;

use super::task::ResourceClass;

/// Number of recent samples kept for the rolling wait/processing averages.
pub const SAMPLE_WINDOW: usize = 100;

// ---------------------------------------------------------------------------
// SampleWindow
// ---------------------------------------------------------------------------

/// Fixed-size window of the most recent duration samples.
#[derive(Debug, Clone)]
pub(crate) struct SampleWindow {
    samples: VecDeque<Duration>,
    capacity: usize,
}

impl SampleWindow {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn push(&mut self, sample: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub(crate) fn average(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.samples.iter().sum();
        total / self.samples.len() as u32
    }
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

/// Lifetime counters for one class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Counters {
    pub completed: u64,
    pub failed: u64,
    pub rejected: u64,
    pub retried: u64,
    pub cancelled: u64,
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// Snapshot of one class queue.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassStats {
    pub class: ResourceClass,
    pub pending: usize,
    pub processing: usize,
    pub completed: u64,
    pub failed: u64,
    pub rejected: u64,
    pub retried: u64,
    pub cancelled: u64,
    pub concurrency: usize,
    pub queue_capacity: usize,
    /// `processing / concurrency` as a percentage.
    pub load_percent: f64,
}

/// Snapshot of the whole queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueStats {
    pub classes: Vec<ClassStats>,
    pub avg_wait: Duration,
    pub avg_processing: Duration,
    /// Mean of the per-class load percentages.
    pub average_load_percent: f64,
    pub high_load: bool,
}

impl QueueStats {
    pub fn class(&self, class: ResourceClass) -> Option<&ClassStats> {
        self.classes.iter().find(|c| c.class == class)
    }

    pub fn pending(&self) -> usize {
        self.classes.iter().map(|c| c.pending).sum()
    }

    pub fn processing(&self) -> usize {
        self.classes.iter().map(|c| c.processing).sum()
    }

    pub fn completed(&self) -> u64 {
        self.classes.iter().map(|c| c.completed).sum()
    }

    pub fn failed(&self) -> u64 {
        self.classes.iter().map(|c| c.failed).sum()
    }
}

pub(crate) fn load_percent(processing: usize, concurrency: usize) -> f64 {
    if concurrency == 0 {
        return 0.0;
    }
    processing as f64 / concurrency as f64 * 100.0
}
