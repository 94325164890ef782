//! Per-target bounded record queues.
//!
//! The table is built once at startup from the configured destinations and
//! never structurally changes while the thread pools run; input threads look
//! queues up concurrently without any table-level locking. Each queue is a
//! bounded FIFO with its own synchronization.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use indexmap::IndexMap;

/// A fully reassembled record, ready for dispatch. Immutable once built;
/// ownership moves to the queues on push and to an output thread on pop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Identity of the originating source (its configured path).
    pub source: String,
    /// Reassembled text, end-of-line policy already applied.
    pub text: String,
    /// Physical lines folded into this record.
    pub lines: usize,
    /// Resolved destination target names.
    pub targets: Vec<String>,
}

impl Record {
    pub fn byte_len(&self) -> usize {
        self.text.len()
    }
}

/// What a full queue does with an incoming record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Wait up to the given duration for room, then count the record as
    /// dropped. The wait is bounded so one slow target cannot stall the
    /// rest of an input thread's source range.
    Block(Duration),
    /// Count the record as dropped immediately.
    Drop,
}

/// One bounded FIFO for a single destination.
pub struct TargetQueue {
    name: String,
    sender: Sender<Record>,
    receiver: Receiver<Record>,
    dropped: AtomicU64,
}

impl TargetQueue {
    fn new(name: String, capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity);
        Self {
            name,
            sender,
            receiver,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Records dropped at this queue because it was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// A receiver handle for an output thread. Strict FIFO; safe to share
    /// between threads.
    pub fn subscribe(&self) -> Receiver<Record> {
        self.receiver.clone()
    }

    fn push(&self, record: Record, policy: OverflowPolicy) -> bool {
        let rejected = match policy {
            OverflowPolicy::Block(wait) => self.sender.send_timeout(record, wait).is_err(),
            OverflowPolicy::Drop => matches!(
                self.sender.try_send(record),
                Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_))
            ),
        };
        if rejected {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(queue = %self.name, "target queue full, record dropped");
        }
        !rejected
    }
}

/// Destination identity -> bounded queue, in configuration order.
pub struct QueueTable {
    queues: IndexMap<String, TargetQueue>,
    policy: OverflowPolicy,
}

impl QueueTable {
    pub fn new(targets: &[String], capacity: usize, policy: OverflowPolicy) -> Self {
        let mut queues = IndexMap::with_capacity(targets.len());
        for name in targets {
            queues.insert(name.clone(), TargetQueue::new(name.clone(), capacity));
        }
        Self { queues, policy }
    }

    pub fn get(&self, name: &str) -> Option<&TargetQueue> {
        self.queues.get(name)
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// (name, receiver) pairs in configuration order, for output thread
    /// assignment.
    pub fn subscriptions(&self) -> Vec<(String, Receiver<Record>)> {
        self.queues
            .iter()
            .map(|(name, q)| (name.clone(), q.subscribe()))
            .collect()
    }

    /// Deliver a clone of `record` to every queue in its target set.
    /// Returns how many queues accepted it. Unknown targets are rejected at
    /// configuration validation, so a miss here only logs.
    pub fn push(&self, record: &Record) -> usize {
        let mut delivered = 0;
        for target in &record.targets {
            match self.queues.get(target) {
                Some(queue) => {
                    if queue.push(record.clone(), self.policy) {
                        delivered += 1;
                    }
                }
                None => {
                    tracing::warn!(target = %target, source = %record.source, "record for unknown target");
                }
            }
        }
        delivered
    }

    /// Total records dropped across all queues.
    pub fn total_dropped(&self) -> u64 {
        self.queues.values().map(|q| q.dropped()).sum()
    }

    /// Total records currently waiting across all queues.
    pub fn total_queued(&self) -> usize {
        self.queues.values().map(|q| q.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(source: &str, text: &str, targets: &[&str]) -> Record {
        Record {
            source: source.to_string(),
            text: text.to_string(),
            lines: 1,
            targets: targets.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[test]
    fn push_pop_is_fifo_per_queue() {
        let table = QueueTable::new(&["agent".into()], 16, OverflowPolicy::Drop);
        for i in 0..5 {
            let delivered = table.push(&record("src", &format!("r{}", i), &["agent"]));
            assert_eq!(delivered, 1);
        }
        let rx = table.get("agent").unwrap().subscribe();
        for i in 0..5 {
            assert_eq!(rx.recv().unwrap().text, format!("r{}", i));
        }
    }

    #[test]
    fn multi_target_record_lands_in_every_queue() {
        let table = QueueTable::new(&["a".into(), "b".into()], 4, OverflowPolicy::Drop);
        let delivered = table.push(&record("src", "hello", &["a", "b"]));
        assert_eq!(delivered, 2);
        assert_eq!(table.get("a").unwrap().len(), 1);
        assert_eq!(table.get("b").unwrap().len(), 1);
    }

    #[test]
    fn drop_policy_counts_overflow() {
        let table = QueueTable::new(&["a".into()], 2, OverflowPolicy::Drop);
        for _ in 0..4 {
            table.push(&record("src", "x", &["a"]));
        }
        assert_eq!(table.get("a").unwrap().len(), 2);
        assert_eq!(table.get("a").unwrap().dropped(), 2);
        assert_eq!(table.total_dropped(), 2);
    }

    #[test]
    fn block_policy_waits_bounded_then_drops() {
        let table = QueueTable::new(
            &["a".into()],
            1,
            OverflowPolicy::Block(Duration::from_millis(10)),
        );
        assert_eq!(table.push(&record("src", "first", &["a"])), 1);

        let start = std::time::Instant::now();
        assert_eq!(table.push(&record("src", "second", &["a"])), 0);
        assert!(start.elapsed() >= Duration::from_millis(10));
        assert_eq!(table.get("a").unwrap().dropped(), 1);
    }

    #[test]
    fn block_policy_succeeds_when_consumer_drains() {
        let table = QueueTable::new(
            &["a".into()],
            1,
            OverflowPolicy::Block(Duration::from_millis(500)),
        );
        table.push(&record("src", "first", &["a"]));

        let rx = table.get("a").unwrap().subscribe();
        let drainer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            rx.recv().unwrap()
        });

        assert_eq!(table.push(&record("src", "second", &["a"])), 1);
        assert_eq!(drainer.join().unwrap().text, "first");
        assert_eq!(table.get("a").unwrap().dropped(), 0);
    }

    #[test]
    fn unknown_target_is_not_fatal() {
        let table = QueueTable::new(&["a".into()], 4, OverflowPolicy::Drop);
        assert_eq!(table.push(&record("src", "x", &["missing"])), 0);
    }
}
