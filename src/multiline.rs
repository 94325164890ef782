//! Multiline record reassembly.
//!
//! Turns a line stream from one source into logical records according to a
//! boundary rule, carrying partial state across read calls so a record split
//! over many partial reads is reassembled exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use regex::Regex;

use crate::reader::{LineRead, SourceReader};

/// Where a record boundary is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// A line matching the pattern starts a new record; the previous record
    /// ends just before it and the matching line is pushed back.
    Start,
    /// A line matching the pattern terminates the record and is included,
    /// end-of-line trimmed.
    End,
    /// Like `End`, but the pattern is tested against the whole accumulated
    /// buffer, so it may span lines.
    All,
}

/// What happens to the end-of-line of each accumulated physical line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplacePolicy {
    /// Remove the trailing CR LF / LF entirely.
    Drop,
    /// Replace the whole trailing CR LF / LF with a single space.
    Space,
    /// Replace the whole trailing CR LF / LF with a single tab.
    Tab,
    /// Leave the line byte-for-byte as read.
    Keep,
}

/// Compiled per-source multiline configuration.
#[derive(Debug, Clone)]
pub struct MultilineConfig {
    pub mode: MatchMode,
    pub pattern: Regex,
    pub replace: ReplacePolicy,
    pub timeout: Duration,
}

impl MultilineConfig {
    pub fn new(
        mode: MatchMode,
        pattern: &str,
        replace: ReplacePolicy,
        timeout: Duration,
    ) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .with_context(|| format!("invalid boundary pattern: {}", pattern))?;
        Ok(Self {
            mode,
            pattern,
            replace,
            timeout,
        })
    }
}

/// Why a record was finalized. `Boundary` is the normal case; the others are
/// surfaced as counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Boundary,
    Timeout,
    Overflow,
}

/// A fully reassembled record with its folded line count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedRecord {
    pub text: String,
    pub lines: usize,
    pub reason: FinishReason,
}

/// Partial record carried between calls while no boundary has been reached.
/// At most one exists per source; it is destroyed the moment a boundary
/// completes the record, the timeout expires, or the buffer fills.
struct PartialContext {
    buffer: String,
    lines: usize,
    since: Instant,
}

/// Stateful reassembler, owned by exactly one source.
pub struct MultilineReassembler {
    config: MultilineConfig,
    ctxt: Option<PartialContext>,
}

impl MultilineReassembler {
    pub fn new(config: MultilineConfig) -> Self {
        Self { config, ctxt: None }
    }

    pub fn config(&self) -> &MultilineConfig {
        &self.config
    }

    /// Whether a partial record is currently buffered.
    pub fn has_pending(&self) -> bool {
        self.ctxt.is_some()
    }

    /// Discard any partial record, e.g. when the source restarts from zero
    /// after rotation. Idempotent.
    pub fn clear_context(&mut self) {
        self.ctxt = None;
    }

    /// Try to produce the next complete record, reading at most up to
    /// `max_len` accumulated bytes. `None` means no complete record is
    /// available yet: either there was nothing to read, or the partial
    /// content was saved as context for a later call.
    ///
    /// The stop flag is honored before every line read, so a shutdown
    /// interrupts accumulation mid-record; the collected lines are context-
    /// saved, not lost.
    pub fn next_record(
        &mut self,
        reader: &mut dyn SourceReader,
        max_len: usize,
        stop: &AtomicBool,
    ) -> Result<Option<CompletedRecord>> {
        let mut buf = String::new();
        let mut lines = 0usize;
        let mut collecting = false;
        let mut mark = reader.mark()?;

        let expired = match &self.ctxt {
            Some(ctxt) => {
                buf.push_str(&ctxt.buffer);
                lines = ctxt.lines;
                collecting = true;
                ctxt.since.elapsed() > self.config.timeout
            }
            None => false,
        };
        if expired {
            // A closing boundary never arrived: emit what we have.
            self.ctxt = None;
            replace_trailing_eol(&mut buf, ReplacePolicy::Drop);
            return Ok(Some(CompletedRecord {
                text: buf,
                lines,
                reason: FinishReason::Timeout,
            }));
        }

        let mut reason = None;

        loop {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            let remaining = max_len.saturating_sub(buf.len());
            if remaining <= 1 {
                // Capacity exhausted on a terminator boundary; a further read
                // here could never make progress.
                reason = Some(FinishReason::Overflow);
                break;
            }

            let mut line = String::new();
            let terminated = match reader.read_line(&mut line, remaining)? {
                LineRead::Pending => break,
                LineRead::Line { terminated } => terminated,
            };

            match self.config.mode {
                MatchMode::Start => {
                    if collecting && self.config.pattern.is_match(&line) {
                        // This line opens the next record: push it back and
                        // close the current one just before it.
                        replace_trailing_eol(&mut buf, ReplacePolicy::Drop);
                        reader.reset(mark)?;
                        reason = Some(FinishReason::Boundary);
                        break;
                    }
                    buf.push_str(&line);
                    replace_trailing_eol(&mut buf, self.config.replace);
                    lines += 1;
                }
                MatchMode::End => {
                    buf.push_str(&line);
                    lines += 1;
                    if self.config.pattern.is_match(&line) {
                        replace_trailing_eol(&mut buf, ReplacePolicy::Drop);
                        reason = Some(FinishReason::Boundary);
                        break;
                    }
                    replace_trailing_eol(&mut buf, self.config.replace);
                }
                MatchMode::All => {
                    buf.push_str(&line);
                    lines += 1;
                    if self.config.pattern.is_match(&buf) {
                        replace_trailing_eol(&mut buf, ReplacePolicy::Drop);
                        reason = Some(FinishReason::Boundary);
                        break;
                    }
                    replace_trailing_eol(&mut buf, self.config.replace);
                }
            }
            collecting = true;
            mark = reader.mark()?;

            if !terminated {
                // The line was cut at capacity: drop its unread remainder so
                // it cannot leak into the following record.
                reader.discard_to_terminator()?;
                reason = Some(FinishReason::Overflow);
                break;
            }
        }

        if let Some(reason) = reason {
            self.ctxt = None;
            return Ok(Some(CompletedRecord {
                text: buf,
                lines,
                reason,
            }));
        }

        // No boundary yet. Save the collected lines for the next call while
        // the buffer still has room.
        if collecting && buf.len() + 1 < max_len {
            self.backup(&buf, lines);
        }
        Ok(None)
    }

    /// Grow-and-append context backup. A backup that adds no bytes leaves
    /// the timestamp untouched, so the timeout measures time since the last
    /// new content.
    fn backup(&mut self, buf: &str, lines: usize) {
        match &mut self.ctxt {
            Some(ctxt) if ctxt.buffer.len() == buf.len() => {}
            Some(ctxt) => {
                let delta = &buf[ctxt.buffer.len()..];
                ctxt.buffer.push_str(delta);
                ctxt.lines = lines;
                ctxt.since = Instant::now();
            }
            None => {
                self.ctxt = Some(PartialContext {
                    buffer: buf.to_string(),
                    lines,
                    since: Instant::now(),
                });
            }
        }
    }
}

/// Apply a replacement policy to the trailing CR LF / LF of `buf`, if any.
/// A buffer without a trailing newline is left untouched.
fn replace_trailing_eol(buf: &mut String, policy: ReplacePolicy) {
    if !buf.ends_with('\n') {
        return;
    }
    if policy == ReplacePolicy::Keep {
        return;
    }
    buf.pop();
    if buf.ends_with('\r') {
        buf.pop();
    }
    match policy {
        ReplacePolicy::Space => buf.push(' '),
        ReplacePolicy::Tab => buf.push('\t'),
        ReplacePolicy::Drop | ReplacePolicy::Keep => {}
    }
}
