//! The transport seam between output threads and the outside world.
//!
//! The real delivery mechanism (remote collector, local socket) is an
//! external collaborator; output threads only rely on this trait. A failed
//! dispatch is retryable, so implementations should return an error rather
//! than panic.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};

use crate::queue::Record;

pub trait Transport: Send + Sync {
    fn dispatch(&self, record: &Record) -> Result<()>;
}

/// Writes one record per line to stdout. Dispatch locks stdout per record
/// so records from different output threads never interleave mid-line.
pub struct StdoutTransport;

impl Transport for StdoutTransport {
    fn dispatch(&self, record: &Record) -> Result<()> {
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        writeln!(lock, "{}", record.text).context("writing record to stdout")?;
        Ok(())
    }
}

/// Appends records to a spool file, one per line.
pub struct FileTransport {
    file: Mutex<std::fs::File>,
}

impl FileTransport {
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening spool file: {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl Transport for FileTransport {
    fn dispatch(&self, record: &Record) -> Result<()> {
        let mut file = self.file.lock().expect("spool file lock poisoned");
        writeln!(file, "{}", record.text).context("appending record to spool file")?;
        Ok(())
    }
}

/// Discards every record. Useful for drain-only targets and load checks.
pub struct NullTransport;

impl Transport for NullTransport {
    fn dispatch(&self, _record: &Record) -> Result<()> {
        Ok(())
    }
}

/// Keeps dispatched records in memory, in arrival order. Used by the
/// integration tests to observe exactly what reached a destination.
#[derive(Default)]
pub struct CollectingTransport {
    records: Mutex<Vec<Record>>,
}

impl CollectingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<Record> {
        self.records.lock().expect("collecting lock poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("collecting lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Transport for CollectingTransport {
    fn dispatch(&self, record: &Record) -> Result<()> {
        self.records
            .lock()
            .expect("collecting lock poisoned")
            .push(record.clone());
        Ok(())
    }
}
