use std::sync::atomic::{AtomicU64, Ordering};

/// Pipeline counters shared by both thread pools. Persistent failures are
/// surfaced here and logged, never raised as errors that unwind the
/// pipeline.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub records_assembled: AtomicU64,
    pub records_shipped: AtomicU64,
    pub dispatch_dropped: AtomicU64,
    pub truncated_records: AtomicU64,
    pub timeout_flushes: AtomicU64,
    pub rotations: AtomicU64,
    pub read_errors: AtomicU64,
}

/// Plain-number copy of the counters at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub records_assembled: u64,
    pub records_shipped: u64,
    pub queue_dropped: u64,
    pub dispatch_dropped: u64,
    pub truncated_records: u64,
    pub timeout_flushes: u64,
    pub rotations: u64,
    pub read_errors: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_assembled(&self) {
        self.records_assembled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_shipped(&self) {
        self.records_shipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_dispatch_dropped(&self) {
        self.dispatch_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_truncated(&self) {
        self.truncated_records.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_timeout_flush(&self) {
        self.timeout_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_rotation(&self) {
        self.rotations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_read_error(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// `queue_dropped` comes from the queue table, which owns the per-queue
    /// counters.
    pub fn snapshot(&self, queue_dropped: u64) -> StatsSnapshot {
        StatsSnapshot {
            records_assembled: self.records_assembled.load(Ordering::Relaxed),
            records_shipped: self.records_shipped.load(Ordering::Relaxed),
            queue_dropped,
            dispatch_dropped: self.dispatch_dropped.load(Ordering::Relaxed),
            truncated_records: self.truncated_records.load(Ordering::Relaxed),
            timeout_flushes: self.timeout_flushes.load(Ordering::Relaxed),
            rotations: self.rotations.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
        }
    }
}

impl StatsSnapshot {
    pub fn format_summary(&self) -> String {
        let mut output = format!(
            "Records: {} assembled, {} shipped",
            self.records_assembled, self.records_shipped
        );
        if self.queue_dropped > 0 {
            output.push_str(&format!(", {} dropped at queues", self.queue_dropped));
        }
        if self.dispatch_dropped > 0 {
            output.push_str(&format!(", {} dropped at dispatch", self.dispatch_dropped));
        }
        if self.truncated_records > 0 {
            output.push_str(&format!(", {} truncated", self.truncated_records));
        }
        if self.timeout_flushes > 0 {
            output.push_str(&format!(", {} flushed on timeout", self.timeout_flushes));
        }
        if self.rotations > 0 {
            output.push_str(&format!(", {} rotations", self.rotations));
        }
        if self.read_errors > 0 {
            output.push_str(&format!(", {} read errors", self.read_errors));
        }
        output
    }
}
