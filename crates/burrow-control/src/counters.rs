//! Per-rule traffic counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of [`IoCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub input: u64,
    pub output: u64,
}

/// Cumulative bytes seen by one listener.
///
/// `input` is traffic received from public clients, `output` is traffic
/// sent back to them.
#[derive(Debug, Default)]
pub struct IoCounters {
    input: AtomicU64,
    output: AtomicU64,
}

impl IoCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_input(&self, n: u64) {
        self.input.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_output(&self, n: u64) {
        self.output.fetch_add(n, Ordering::Relaxed);
    }

    pub fn input(&self) -> u64 {
        self.input.load(Ordering::Relaxed)
    }

    pub fn output(&self) -> u64 {
        self.output.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            input: self.input(),
            output: self.output(),
        }
    }
}
