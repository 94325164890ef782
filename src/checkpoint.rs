//! Offset/hash checkpoints for resume-after-reopen.
//!
//! Tracks, per source path, the last committed read offset together with a
//! rolling SHA-256 over exactly the bytes consumed. On reopen the first
//! `offset` bytes of the new handle are re-hashed: a mismatch means the file
//! was rotated or truncated beneath us and consumption restarts from zero.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hex digest of the hasher's current state, without consuming it.
pub fn digest_hex(hasher: &Sha256) -> String {
    hex_string(hasher.clone().finalize().as_slice())
}

fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Last committed position for one file: offset plus the digest of the
/// bytes [0, offset).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStatus {
    pub offset: u64,
    pub hash: String,
}

/// Where to resume a reopened source.
pub enum ResumeDecision {
    /// No usable checkpoint, or the recorded prefix no longer matches:
    /// start over with a fresh hash state.
    Restart,
    /// The recorded prefix still matches; continue at `offset` with the
    /// recomputed streaming hash state.
    Resume { offset: u64, hasher: Sha256 },
}

/// Serialized form of the tracker, the contract with the external
/// persistence component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub saved_at: DateTime<Utc>,
    pub files: Vec<StatusEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEntry {
    pub path: PathBuf,
    pub hash: String,
    pub offset: u64,
}

/// Last-writer-wins map from source path to its committed position. Shared
/// between all input threads; the lock is held only for the duration of a
/// single update or lookup.
#[derive(Default)]
pub struct CheckpointTracker {
    table: Mutex<HashMap<PathBuf, FileStatus>>,
}

impl CheckpointTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the position after a consumed chunk, overwriting any previous
    /// entry for the path.
    pub fn update(&self, path: &Path, offset: u64, hasher: &Sha256) {
        let status = FileStatus {
            offset,
            hash: digest_hex(hasher),
        };
        self.table
            .lock()
            .expect("checkpoint table poisoned")
            .insert(path.to_path_buf(), status);
    }

    pub fn lookup(&self, path: &Path) -> Option<FileStatus> {
        self.table
            .lock()
            .expect("checkpoint table poisoned")
            .get(path)
            .cloned()
    }

    /// Drop the entry for a removed source.
    pub fn forget(&self, path: &Path) {
        self.table
            .lock()
            .expect("checkpoint table poisoned")
            .remove(path);
    }

    /// Decide where to resume a freshly opened handle. Reads the byte range
    /// [0, offset) of `file` and compares against the recorded hash; any
    /// mismatch (including a file shorter than the recorded offset) resets
    /// the entry and restarts from zero.
    pub fn resume(&self, path: &Path, file: &mut File) -> Result<ResumeDecision> {
        let Some(status) = self.lookup(path) else {
            return Ok(ResumeDecision::Restart);
        };
        if status.offset == 0 {
            return Ok(ResumeDecision::Restart);
        }

        match rehash_prefix(file, status.offset)
            .with_context(|| format!("re-hashing {} for resume", path.display()))?
        {
            Some(hasher) if digest_hex(&hasher) == status.hash => Ok(ResumeDecision::Resume {
                offset: status.offset,
                hasher,
            }),
            _ => {
                tracing::info!(path = %path.display(), "checkpoint mismatch, restarting from zero");
                self.forget(path);
                Ok(ResumeDecision::Restart)
            }
        }
    }

    /// Point-in-time copy for the external persistence component. Entries
    /// are sorted by path so the serialized form is stable.
    pub fn snapshot(&self) -> StatusSnapshot {
        let table = self.table.lock().expect("checkpoint table poisoned");
        let mut files: Vec<StatusEntry> = table
            .iter()
            .map(|(path, status)| StatusEntry {
                path: path.clone(),
                hash: status.hash.clone(),
                offset: status.offset,
            })
            .collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        StatusSnapshot {
            saved_at: Utc::now(),
            files,
        }
    }

    /// Replace the table contents from a restored snapshot. Called at
    /// startup before any input thread runs.
    pub fn restore(&self, snapshot: &StatusSnapshot) {
        let mut table = self.table.lock().expect("checkpoint table poisoned");
        table.clear();
        for entry in &snapshot.files {
            table.insert(
                entry.path.clone(),
                FileStatus {
                    offset: entry.offset,
                    hash: entry.hash.clone(),
                },
            );
        }
    }

    pub fn is_empty(&self) -> bool {
        self.table
            .lock()
            .expect("checkpoint table poisoned")
            .is_empty()
    }
}

/// Hash the first `offset` bytes of `file`. Returns `None` when the file is
/// shorter than `offset`.
fn rehash_prefix(file: &mut File, offset: u64) -> std::io::Result<Option<Sha256>> {
    let mut hasher = Sha256::new();
    let mut remaining = offset;
    let mut chunk = [0u8; 8192];
    while remaining > 0 {
        let want = chunk.len().min(remaining as usize);
        let n = file.read(&mut chunk[..want])?;
        if n == 0 {
            return Ok(None);
        }
        hasher.update(&chunk[..n]);
        remaining -= n as u64;
    }
    Ok(Some(hasher))
}
