use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Outcome of a bounded line read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineRead {
    /// A line (or a capacity-bounded prefix of one) was appended to the
    /// output buffer. `terminated` tells whether the line terminator was
    /// consumed, or the read was cut short by the byte limit.
    Line { terminated: bool },
    /// No complete line is available yet. Nothing was consumed.
    Pending,
}

/// Line-oriented reader over a growing source.
///
/// Reads are bounded and never return an unterminated tail: a half-written
/// final line stays in the source until its terminator arrives or the byte
/// limit forces a cut. `mark`/`reset` let a caller un-consume back to a
/// previously recorded position, so boundary detection can push a line back
/// without relying on raw file offsets.
pub trait SourceReader {
    /// Read one line into `out`, consuming at most `limit - 1` bytes.
    ///
    /// Returns `Pending` when no terminator is available within the limit
    /// and the limit was not reached; in that case nothing is consumed.
    fn read_line(&mut self, out: &mut String, limit: usize) -> io::Result<LineRead>;

    /// Record the current position for a later `reset`.
    fn mark(&mut self) -> io::Result<u64>;

    /// Rewind to a mark taken since the last `take_consumed`. The bytes
    /// between the mark and the current position are un-consumed.
    fn reset(&mut self, mark: u64) -> io::Result<()>;

    /// Discard the rest of the current physical line without buffering it.
    /// If the terminator has not been written yet, the discard continues
    /// transparently on subsequent reads.
    fn discard_to_terminator(&mut self) -> io::Result<()>;

    /// Current read position in the source.
    fn position(&self) -> u64;

    /// Drain the raw bytes consumed since the last call (rewound bytes
    /// excluded, discarded bytes included).
    fn take_consumed(&mut self) -> Vec<u8>;
}

/// Largest prefix of `bytes` that does not split a multi-byte UTF-8
/// sequence at the end. Data that is invalid long before the cut is
/// passed through unchanged.
fn utf8_cut(bytes: &[u8]) -> usize {
    match std::str::from_utf8(bytes) {
        Ok(_) => bytes.len(),
        Err(e) => {
            let valid = e.valid_up_to();
            if bytes.len() - valid < 4 {
                valid
            } else {
                bytes.len()
            }
        }
    }
}

/// Read into `buf` until it is full or the source has no more bytes.
fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Scan a chunk for one bounded line. Returns (bytes to take, terminated),
/// or `None` when the chunk holds no terminator and the limit was not hit.
fn scan_line(chunk: &[u8], max: usize) -> Option<(usize, bool)> {
    match chunk.iter().position(|&b| b == b'\n') {
        Some(i) => Some((i + 1, true)),
        None if chunk.len() >= max => {
            let take = utf8_cut(&chunk[..max]);
            if take == 0 {
                None
            } else {
                Some((take, false))
            }
        }
        None => None,
    }
}

/// File-backed reader used for tailing. Tracks its own position so the
/// handle can be shared with metadata checks, and keeps the raw bytes it
/// consumed since the last checkpoint commit.
pub struct TailReader {
    path: PathBuf,
    file: File,
    pos: u64,
    consumed: Vec<u8>,
    skipping: bool,
}

impl TailReader {
    pub fn open(path: &Path) -> io::Result<Self> {
        Self::open_at(path, 0)
    }

    /// Open positioned at `offset`, e.g. a checkpointed resume point.
    pub fn open_at(path: &Path, offset: u64) -> io::Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            pos: offset,
            consumed: Vec::new(),
            skipping: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_chunk_at(&mut self, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.file.seek(SeekFrom::Start(pos))?;
        read_fully(&mut self.file, buf)
    }

    /// Continue a pending line discard. Returns true once the terminator
    /// has been consumed.
    fn finish_skip(&mut self) -> io::Result<bool> {
        let mut chunk = [0u8; 4096];
        loop {
            let n = self.read_chunk_at(self.pos, &mut chunk)?;
            if n == 0 {
                return Ok(false);
            }
            match chunk[..n].iter().position(|&b| b == b'\n') {
                Some(i) => {
                    self.consumed.extend_from_slice(&chunk[..=i]);
                    self.pos += (i + 1) as u64;
                    self.skipping = false;
                    return Ok(true);
                }
                None => {
                    self.consumed.extend_from_slice(&chunk[..n]);
                    self.pos += n as u64;
                }
            }
        }
    }
}

impl SourceReader for TailReader {
    fn read_line(&mut self, out: &mut String, limit: usize) -> io::Result<LineRead> {
        if self.skipping && !self.finish_skip()? {
            return Ok(LineRead::Pending);
        }
        if limit <= 1 {
            return Ok(LineRead::Pending);
        }
        let max = limit - 1;
        let mut chunk = vec![0u8; max];
        let n = self.read_chunk_at(self.pos, &mut chunk)?;
        if n == 0 {
            return Ok(LineRead::Pending);
        }
        match scan_line(&chunk[..n], max) {
            Some((take, terminated)) => {
                out.push_str(&String::from_utf8_lossy(&chunk[..take]));
                self.consumed.extend_from_slice(&chunk[..take]);
                self.pos += take as u64;
                Ok(LineRead::Line { terminated })
            }
            None => Ok(LineRead::Pending),
        }
    }

    fn mark(&mut self) -> io::Result<u64> {
        Ok(self.pos)
    }

    fn reset(&mut self, mark: u64) -> io::Result<()> {
        debug_assert!(mark <= self.pos);
        let back = (self.pos - mark) as usize;
        let keep = self.consumed.len().saturating_sub(back);
        self.consumed.truncate(keep);
        self.pos = mark;
        Ok(())
    }

    fn discard_to_terminator(&mut self) -> io::Result<()> {
        self.skipping = true;
        self.finish_skip()?;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.pos
    }

    fn take_consumed(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.consumed)
    }
}

/// In-memory reader with the same contract as `TailReader`. Tests feed it
/// incrementally to simulate a stream arriving in arbitrary chunks.
#[derive(Default)]
pub struct MemoryReader {
    data: Vec<u8>,
    pos: usize,
    consumed: Vec<u8>,
    skipping: bool,
}

impl MemoryReader {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            ..Default::default()
        }
    }

    /// Append bytes, as if the source had grown.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    fn finish_skip(&mut self) -> bool {
        let rest = &self.data[self.pos..];
        match rest.iter().position(|&b| b == b'\n') {
            Some(i) => {
                self.consumed.extend_from_slice(&rest[..=i]);
                self.pos += i + 1;
                self.skipping = false;
                true
            }
            None => {
                self.consumed.extend_from_slice(rest);
                self.pos = self.data.len();
                false
            }
        }
    }
}

impl SourceReader for MemoryReader {
    fn read_line(&mut self, out: &mut String, limit: usize) -> io::Result<LineRead> {
        if self.skipping && !self.finish_skip() {
            return Ok(LineRead::Pending);
        }
        if limit <= 1 {
            return Ok(LineRead::Pending);
        }
        let max = limit - 1;
        let rest = &self.data[self.pos..];
        if rest.is_empty() {
            return Ok(LineRead::Pending);
        }
        let window = &rest[..rest.len().min(max)];
        match scan_line(window, max) {
            Some((take, terminated)) => {
                out.push_str(&String::from_utf8_lossy(&window[..take]));
                self.consumed.extend_from_slice(&window[..take]);
                self.pos += take;
                Ok(LineRead::Line { terminated })
            }
            None => Ok(LineRead::Pending),
        }
    }

    fn mark(&mut self) -> io::Result<u64> {
        Ok(self.pos as u64)
    }

    fn reset(&mut self, mark: u64) -> io::Result<()> {
        let mark = mark as usize;
        debug_assert!(mark <= self.pos);
        let back = self.pos - mark;
        let keep = self.consumed.len().saturating_sub(back);
        self.consumed.truncate(keep);
        self.pos = mark;
        Ok(())
    }

    fn discard_to_terminator(&mut self) -> io::Result<()> {
        self.skipping = true;
        self.finish_skip();
        Ok(())
    }

    fn position(&self) -> u64 {
        self.pos as u64
    }

    fn take_consumed(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.consumed)
    }
}
