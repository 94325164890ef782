//! Per-source read state.
//!
//! Each source is owned exclusively by one input thread, so nothing here is
//! synchronized; the shared checkpoint tracker is the only cross-thread
//! touch point.

use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use crate::checkpoint::{CheckpointTracker, ResumeDecision};
use crate::multiline::{FinishReason, MultilineConfig, MultilineReassembler};
use crate::queue::{QueueTable, Record};
use crate::reader::{SourceReader, TailReader};
use crate::stats::PipelineStats;

/// One monitored file: identity, lazily (re)opened handle, reassembly state
/// and destination set.
pub struct Source {
    path: PathBuf,
    targets: Vec<String>,
    reassembler: MultilineReassembler,
    reader: Option<TailReader>,
    hasher: Sha256,
    committed: u64,
}

impl Source {
    pub fn new(path: PathBuf, targets: Vec<String>, multiline: MultilineConfig) -> Self {
        Self {
            path,
            targets,
            reassembler: MultilineReassembler::new(multiline),
            reader: None,
            hasher: Sha256::new(),
            committed: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    /// Offset of the last committed (checkpointed) record boundary.
    pub fn committed_offset(&self) -> u64 {
        self.committed
    }

    /// Drop the open handle; the next poll reopens through the checkpoint
    /// tracker. Used after read errors.
    pub fn invalidate(&mut self) {
        self.reader = None;
    }

    /// The handle no longer matches the file on disk: the file shrank below
    /// our read position or vanished.
    fn reader_is_stale(&self) -> bool {
        let Some(reader) = &self.reader else {
            return false;
        };
        match fs::metadata(&self.path) {
            Ok(meta) => meta.len() < reader.position(),
            Err(_) => true,
        }
    }

    /// Open the file and decide the resume offset via the checkpoint
    /// tracker. Returns false while the file does not exist.
    fn open(&mut self, checkpoints: &CheckpointTracker, stats: &PipelineStats) -> Result<bool> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                return Err(e).with_context(|| format!("opening source {}", self.path.display()))
            }
        };

        let (offset, hasher) = match checkpoints.resume(&self.path, &mut file)? {
            ResumeDecision::Resume { offset, hasher } => (offset, hasher),
            ResumeDecision::Restart => {
                if self.committed > 0 {
                    // We had progress on the previous generation of this
                    // file: it was rotated or truncated beneath us.
                    stats.add_rotation();
                    self.reassembler.clear_context();
                }
                (0, Sha256::new())
            }
        };
        drop(file);

        self.reader = Some(
            TailReader::open_at(&self.path, offset)
                .with_context(|| format!("reopening source {}", self.path.display()))?,
        );
        self.hasher = hasher;
        self.committed = offset;
        tracing::debug!(path = %self.path.display(), offset, "source opened");
        Ok(true)
    }

    /// One cooperative pass: reassemble and push at most `budget` records,
    /// committing the checkpoint after each. Returns the number of records
    /// produced; 0 means nothing was available.
    pub fn poll(
        &mut self,
        max_record_len: usize,
        budget: usize,
        stop: &AtomicBool,
        checkpoints: &CheckpointTracker,
        queues: &QueueTable,
        stats: &PipelineStats,
    ) -> Result<usize> {
        if self.reader_is_stale() {
            self.reader = None;
        }
        if self.reader.is_none() && !self.open(checkpoints, stats)? {
            return Ok(0);
        }

        let reader = self.reader.as_mut().expect("reader opened above");
        let mut produced = 0;

        while produced < budget && !stop.load(Ordering::Relaxed) {
            let Some(completed) = self
                .reassembler
                .next_record(reader, max_record_len, stop)?
            else {
                break;
            };

            let consumed = reader.take_consumed();
            self.hasher.update(&consumed);
            self.committed = reader.position();

            stats.add_assembled();
            match completed.reason {
                FinishReason::Boundary => {}
                FinishReason::Timeout => stats.add_timeout_flush(),
                FinishReason::Overflow => stats.add_truncated(),
            }

            let record = Record {
                source: self.path.display().to_string(),
                text: completed.text,
                lines: completed.lines,
                targets: self.targets.clone(),
            };
            queues.push(&record);
            checkpoints.update(&self.path, self.committed, &self.hasher);
            produced += 1;
        }

        Ok(produced)
    }
}
