//! Input and output thread pools.
//!
//! The source list is partitioned into contiguous disjoint ranges at
//! startup, one range per input thread, fixed for the lifetime of the pool;
//! reconfiguration is teardown plus a fresh start, never in-place mutation
//! of shared range state. Output threads block on the queue table and hand
//! records to the transports.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam_channel::{Receiver, RecvTimeoutError, Select};
use indexmap::IndexMap;

use crate::checkpoint::CheckpointTracker;
use crate::dispatch::Transport;
use crate::queue::{QueueTable, Record};
use crate::source::Source;
use crate::stats::PipelineStats;

/// How queues are assigned to output threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignment {
    /// Every output thread selects over all queues.
    RoundRobin,
    /// Queue i is served by thread i mod M only.
    Dedicated,
}

/// Runtime knobs for both pools, resolved from the configuration.
#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub input_threads: usize,
    pub output_threads: usize,
    pub max_record_len: usize,
    pub records_per_pass: usize,
    pub poll_interval: Duration,
    pub shutdown_grace: Duration,
    pub assignment: Assignment,
    pub retry_limit: usize,
    pub retry_backoff: Duration,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            input_threads: 1,
            output_threads: 1,
            max_record_len: 65536,
            records_per_pass: 1000,
            poll_interval: Duration::from_millis(500),
            shutdown_grace: Duration::from_secs(5),
            assignment: Assignment::RoundRobin,
            retry_limit: 3,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

/// Running thread pools. Dropping without `stop` detaches the threads;
/// callers are expected to stop explicitly.
pub struct Collector {
    stop: Arc<AtomicBool>,
    input_handles: Vec<JoinHandle<()>>,
    output_handles: Vec<JoinHandle<()>>,
    stats: Arc<PipelineStats>,
    queues: Arc<QueueTable>,
}

impl Collector {
    /// Partition the sources and start both pools.
    pub fn start(
        sources: Vec<Source>,
        queues: Arc<QueueTable>,
        checkpoints: Arc<CheckpointTracker>,
        transports: Arc<IndexMap<String, Arc<dyn Transport>>>,
        settings: CollectorSettings,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(PipelineStats::new());

        let input_threads = settings.input_threads.max(1).min(sources.len().max(1));
        let mut input_handles = Vec::with_capacity(input_threads);
        for (thread_id, range) in partition(sources, input_threads).into_iter().enumerate() {
            let stop = Arc::clone(&stop);
            let stats = Arc::clone(&stats);
            let queues = Arc::clone(&queues);
            let checkpoints = Arc::clone(&checkpoints);
            let settings = settings.clone();
            input_handles.push(
                thread::Builder::new()
                    .name(format!("logship-in-{}", thread_id))
                    .spawn(move || {
                        input_thread(range, &settings, &stop, &checkpoints, &queues, &stats)
                    })?,
            );
        }

        let output_threads = settings.output_threads.max(1);
        let subscriptions = queues.subscriptions();
        let mut output_handles = Vec::with_capacity(output_threads);
        for thread_id in 0..output_threads {
            let assigned: Vec<(String, Receiver<Record>)> = match settings.assignment {
                Assignment::RoundRobin => subscriptions.clone(),
                Assignment::Dedicated => subscriptions
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| i % output_threads == thread_id)
                    .map(|(_, sub)| sub.clone())
                    .collect(),
            };
            let stop = Arc::clone(&stop);
            let stats = Arc::clone(&stats);
            let transports = Arc::clone(&transports);
            let settings = settings.clone();
            output_handles.push(
                thread::Builder::new()
                    .name(format!("logship-out-{}", thread_id))
                    .spawn(move || output_thread(assigned, &transports, &settings, &stop, &stats))?,
            );
        }

        Ok(Self {
            stop,
            input_handles,
            output_handles,
            stats,
            queues,
        })
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn snapshot(&self) -> crate::stats::StatsSnapshot {
        self.stats.snapshot(self.queues.total_dropped())
    }

    /// Request shutdown without waiting.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Signal both pools and join them. Input threads finish their current
    /// read call; output threads drain queued records within the grace
    /// period configured at start.
    pub fn stop(self) -> crate::stats::StatsSnapshot {
        self.stop.store(true, Ordering::Relaxed);
        for handle in self.input_handles {
            if handle.join().is_err() {
                tracing::error!("input thread panicked");
            }
        }
        for handle in self.output_handles {
            if handle.join().is_err() {
                tracing::error!("output thread panicked");
            }
        }
        self.stats.snapshot(self.queues.total_dropped())
    }
}

/// Contiguous, disjoint, maximally even partition of `sources` into
/// `parts` ranges. The first `len % parts` ranges take one extra source.
fn partition(sources: Vec<Source>, parts: usize) -> Vec<Vec<Source>> {
    let total = sources.len();
    let base = total / parts;
    let extra = total % parts;
    let mut ranges = Vec::with_capacity(parts);
    let mut iter = sources.into_iter();
    for i in 0..parts {
        let size = base + usize::from(i < extra);
        ranges.push(iter.by_ref().take(size).collect());
    }
    ranges
}

/// Cooperative round-robin over one fixed range of sources. A source that
/// yields nothing is skipped without blocking; a fully idle pass sleeps one
/// poll interval.
fn input_thread(
    mut range: Vec<Source>,
    settings: &CollectorSettings,
    stop: &AtomicBool,
    checkpoints: &CheckpointTracker,
    queues: &QueueTable,
    stats: &PipelineStats,
) {
    while !stop.load(Ordering::Relaxed) {
        let mut idle = true;
        for source in &mut range {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            match source.poll(
                settings.max_record_len,
                settings.records_per_pass,
                stop,
                checkpoints,
                queues,
                stats,
            ) {
                Ok(0) => {}
                Ok(_) => idle = false,
                Err(e) => {
                    stats.add_read_error();
                    tracing::warn!(path = %source.path().display(), error = %e, "source read failed");
                    source.invalidate();
                }
            }
        }
        if idle && !stop.load(Ordering::Relaxed) {
            thread::sleep(settings.poll_interval);
        }
    }
}

fn output_thread(
    assigned: Vec<(String, Receiver<Record>)>,
    transports: &IndexMap<String, Arc<dyn Transport>>,
    settings: &CollectorSettings,
    stop: &AtomicBool,
    stats: &PipelineStats,
) {
    if assigned.is_empty() {
        return;
    }

    // Steady state: block across all assigned queues, waking periodically
    // to re-check the stop flag.
    if assigned.len() == 1 {
        let (name, rx) = &assigned[0];
        while !stop.load(Ordering::Relaxed) {
            match rx.recv_timeout(settings.poll_interval) {
                Ok(record) => dispatch_record(name, record, transports, settings, stats),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    } else {
        let mut select = Select::new();
        for (_, rx) in &assigned {
            select.recv(rx);
        }
        while !stop.load(Ordering::Relaxed) {
            match select.select_timeout(settings.poll_interval) {
                Ok(op) => {
                    let index = op.index();
                    let (name, rx) = &assigned[index];
                    match op.recv(rx) {
                        Ok(record) => dispatch_record(name, record, transports, settings, stats),
                        Err(_) => break,
                    }
                }
                Err(_) => {}
            }
        }
    }

    // Shutdown: drain what is already queued, bounded by the grace period.
    let deadline = Instant::now() + settings.shutdown_grace;
    'drain: loop {
        let mut drained = false;
        for (name, rx) in &assigned {
            while let Ok(record) = rx.try_recv() {
                dispatch_record(name, record, transports, settings, stats);
                drained = true;
                if Instant::now() >= deadline {
                    tracing::warn!("shutdown grace period expired with records still queued");
                    break 'drain;
                }
            }
        }
        if !drained {
            break;
        }
    }
}

/// Dispatch with bounded retries and multiplicative backoff. The record is
/// counted as dropped after the last attempt; the thread carries on.
fn dispatch_record(
    target: &str,
    record: Record,
    transports: &IndexMap<String, Arc<dyn Transport>>,
    settings: &CollectorSettings,
    stats: &PipelineStats,
) {
    let Some(transport) = transports.get(target) else {
        stats.add_dispatch_dropped();
        tracing::warn!(target = %target, "no transport for target, record dropped");
        return;
    };

    let mut backoff = settings.retry_backoff;
    for attempt in 0..=settings.retry_limit {
        match transport.dispatch(&record) {
            Ok(()) => {
                stats.add_shipped();
                return;
            }
            Err(e) if attempt < settings.retry_limit => {
                tracing::debug!(target = %target, attempt, error = %e, "dispatch failed, retrying");
                thread::sleep(backoff);
                backoff = backoff.saturating_mul(2);
            }
            Err(e) => {
                stats.add_dispatch_dropped();
                tracing::warn!(target = %target, error = %e, "dispatch failed, record dropped");
            }
        }
    }
}
