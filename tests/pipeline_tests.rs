mod common;
use common::*;

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use logship::checkpoint::CheckpointTracker;
use logship::collector::Collector;
use logship::queue::{OverflowPolicy, QueueTable};
use logship::source::Source;

fn queue_table(targets: &[&str]) -> Arc<QueueTable> {
    let names: Vec<String> = targets.iter().map(|t| t.to_string()).collect();
    Arc::new(QueueTable::new(
        &names,
        256,
        OverflowPolicy::Block(Duration::from_millis(200)),
    ))
}

#[test]
fn tails_a_growing_file_live() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("grow.log");
    std::fs::write(&path, "").unwrap();

    let queues = queue_table(&["agent"]);
    let checkpoints = Arc::new(CheckpointTracker::new());
    let (collecting, transports) = collecting_target("agent");

    let sources = vec![Source::new(
        path.clone(),
        vec!["agent".into()],
        start_config("^EVT"),
    )];
    let collector = Collector::start(
        sources,
        Arc::clone(&queues),
        checkpoints,
        transports,
        test_settings(),
    )
    .unwrap();

    // Append while the collector is running; partial writes included.
    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    write!(file, "EVT first\n  de").unwrap();
    file.flush().unwrap();
    std::thread::sleep(Duration::from_millis(50));
    write!(file, "tail\nEVT second\n").unwrap();
    file.flush().unwrap();

    assert!(wait_until(Duration::from_secs(10), || collecting.len() >= 1));
    collector.stop();

    let records = collecting.records();
    assert_eq!(records[0].text, "EVT first\n  detail");
    assert_eq!(records[0].lines, 2);
}

#[test]
fn multiple_sources_preserve_per_source_order() {
    let dir = TempDir::new().unwrap();
    let mut sources = Vec::new();
    let mut paths = Vec::new();
    for i in 0..4 {
        let path = dir.path().join(format!("src{}.log", i));
        let mut body = String::new();
        for n in 0..20 {
            body.push_str(&format!("EVT {}-{:02}\npayload line\n", i, n));
        }
        body.push_str("EVT trailer\n");
        std::fs::write(&path, body).unwrap();
        sources.push(Source::new(
            path.clone(),
            vec!["agent".into()],
            start_config("^EVT"),
        ));
        paths.push(path);
    }

    let queues = queue_table(&["agent"]);
    let checkpoints = Arc::new(CheckpointTracker::new());
    let (collecting, transports) = collecting_target("agent");

    // Four sources over two input threads, one output thread.
    let collector = Collector::start(
        sources,
        Arc::clone(&queues),
        checkpoints,
        transports,
        test_settings(),
    )
    .unwrap();

    assert!(wait_until(Duration::from_secs(15), || {
        collecting.len() >= 4 * 20
    }));
    let snapshot = collector.stop();

    let records = collecting.records();
    assert_eq!(records.len(), 80);
    assert_eq!(snapshot.records_shipped, 80);

    // No loss, no reordering within any single source's sequence.
    for (i, path) in paths.iter().enumerate() {
        let texts: Vec<&str> = records
            .iter()
            .filter(|r| r.source == path.display().to_string())
            .map(|r| r.text.as_str())
            .collect();
        let expected: Vec<String> = (0..20)
            .map(|n| format!("EVT {}-{:02}\npayload line", i, n))
            .collect();
        assert_eq!(texts, expected, "source {}", i);
    }
}

#[test]
fn fanout_to_two_targets_delivers_to_both() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fan.log");
    std::fs::write(&path, "EVT one\nEVT two\nEVT three\n").unwrap();

    let queues = queue_table(&["left", "right"]);
    let checkpoints = Arc::new(CheckpointTracker::new());

    let left = Arc::new(logship::dispatch::CollectingTransport::new());
    let right = Arc::new(logship::dispatch::CollectingTransport::new());
    let mut transports: indexmap::IndexMap<String, Arc<dyn logship::dispatch::Transport>> =
        indexmap::IndexMap::new();
    transports.insert(
        "left".into(),
        left.clone() as Arc<dyn logship::dispatch::Transport>,
    );
    transports.insert(
        "right".into(),
        right.clone() as Arc<dyn logship::dispatch::Transport>,
    );

    let sources = vec![Source::new(
        path,
        vec!["left".into(), "right".into()],
        start_config("^EVT"),
    )];
    let collector = Collector::start(
        sources,
        Arc::clone(&queues),
        checkpoints,
        Arc::new(transports),
        test_settings(),
    )
    .unwrap();

    // Two records complete; the third header stays pending on the open
    // stream.
    assert!(wait_until(Duration::from_secs(10), || {
        left.len() >= 2 && right.len() >= 2
    }));
    collector.stop();

    for transport in [left, right] {
        let texts: Vec<String> = transport.records().into_iter().map(|r| r.text).collect();
        assert_eq!(texts, vec!["EVT one", "EVT two"]);
    }
}

#[test]
fn restart_resumes_from_checkpoint_without_duplicates() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("resume.log");
    std::fs::write(&path, "EVT a\nEVT b\nEVT tail\n").unwrap();

    let checkpoints = Arc::new(CheckpointTracker::new());

    // First run consumes the two complete records.
    {
        let queues = queue_table(&["agent"]);
        let (collecting, transports) = collecting_target("agent");
        let sources = vec![Source::new(
            path.clone(),
            vec!["agent".into()],
            start_config("^EVT"),
        )];
        let collector = Collector::start(
            sources,
            Arc::clone(&queues),
            Arc::clone(&checkpoints),
            transports,
            test_settings(),
        )
        .unwrap();
        assert!(wait_until(Duration::from_secs(10), || collecting.len() >= 2));
        collector.stop();

        let texts: Vec<String> = collecting.records().into_iter().map(|r| r.text).collect();
        assert_eq!(texts, vec!["EVT a", "EVT b"]);
    }

    // The file grows between runs.
    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    write!(file, "EVT after restart\nEVT end\n").unwrap();
    file.flush().unwrap();

    // Second run resumes at the committed offset: "EVT tail" (committed but
    // never completed) comes out first, nothing before it is re-read.
    {
        let queues = queue_table(&["agent"]);
        let (collecting, transports) = collecting_target("agent");
        let sources = vec![Source::new(
            path.clone(),
            vec!["agent".into()],
            start_config("^EVT"),
        )];
        let collector = Collector::start(
            sources,
            Arc::clone(&queues),
            Arc::clone(&checkpoints),
            transports,
            test_settings(),
        )
        .unwrap();
        assert!(wait_until(Duration::from_secs(10), || collecting.len() >= 2));
        collector.stop();

        let texts: Vec<String> = collecting.records().into_iter().map(|r| r.text).collect();
        assert_eq!(texts, vec!["EVT tail", "EVT after restart"]);
    }
}

#[test]
fn rotation_mid_run_restarts_from_zero() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("rotate.log");
    std::fs::write(&path, "EVT old-1\nEVT old-2\nEVT old-tail\n").unwrap();

    let queues = queue_table(&["agent"]);
    let checkpoints = Arc::new(CheckpointTracker::new());
    let (collecting, transports) = collecting_target("agent");

    let sources = vec![Source::new(
        path.clone(),
        vec!["agent".into()],
        start_config("^EVT"),
    )];
    let collector = Collector::start(
        sources,
        Arc::clone(&queues),
        checkpoints,
        transports,
        test_settings(),
    )
    .unwrap();

    assert!(wait_until(Duration::from_secs(10), || collecting.len() >= 2));

    // Rotate: replace with shorter, different content.
    std::fs::write(&path, "EVT new-1\nEVT new-tail\n").unwrap();

    assert!(wait_until(Duration::from_secs(10), || collecting.len() >= 3));
    let snapshot = collector.stop();

    let texts: Vec<String> = collecting.records().into_iter().map(|r| r.text).collect();
    assert_eq!(texts[..2], ["EVT old-1", "EVT old-2"]);
    assert_eq!(texts[2], "EVT new-1");
    assert_eq!(snapshot.rotations, 1);
}

#[test]
fn timeout_flushes_stranded_partial_record() {
    use logship::multiline::{MatchMode, MultilineConfig, ReplacePolicy};

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("stall.log");
    // A record that never sees its end pattern.
    std::fs::write(&path, "half a record\nstill going\n").unwrap();

    let queues = queue_table(&["agent"]);
    let checkpoints = Arc::new(CheckpointTracker::new());
    let (collecting, transports) = collecting_target("agent");

    let multiline = MultilineConfig::new(
        MatchMode::End,
        r"COMMIT$",
        ReplacePolicy::Keep,
        Duration::from_millis(100),
    )
    .unwrap();
    let sources = vec![Source::new(path, vec!["agent".into()], multiline)];
    let collector = Collector::start(
        sources,
        Arc::clone(&queues),
        checkpoints,
        transports,
        test_settings(),
    )
    .unwrap();

    assert!(wait_until(Duration::from_secs(10), || collecting.len() >= 1));
    let snapshot = collector.stop();

    let records = collecting.records();
    assert_eq!(records[0].text, "half a record\nstill going");
    assert_eq!(snapshot.timeout_flushes, 1);
    // Emitted exactly once.
    assert_eq!(
        records
            .iter()
            .filter(|r| r.text.starts_with("half a record"))
            .count(),
        1
    );
}
