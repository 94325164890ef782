// tests/common/mod.rs
// Shared test utilities for integration tests
#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;

use logship::collector::CollectorSettings;
use logship::dispatch::{CollectingTransport, Transport};
use logship::multiline::{MatchMode, MultilineConfig, ReplacePolicy};

/// A MatchStart configuration with a generous timeout, the common case in
/// these tests.
pub fn start_config(pattern: &str) -> MultilineConfig {
    MultilineConfig::new(
        MatchMode::Start,
        pattern,
        ReplacePolicy::Keep,
        Duration::from_secs(60),
    )
    .unwrap()
}

/// Collector settings tightened for tests: fast polling, short grace.
pub fn test_settings() -> CollectorSettings {
    CollectorSettings {
        input_threads: 2,
        output_threads: 1,
        poll_interval: Duration::from_millis(10),
        shutdown_grace: Duration::from_secs(2),
        ..CollectorSettings::default()
    }
}

/// A transport table with one collecting target.
pub fn collecting_target(
    name: &str,
) -> (
    Arc<CollectingTransport>,
    Arc<IndexMap<String, Arc<dyn Transport>>>,
) {
    let collecting = Arc::new(CollectingTransport::new());
    let mut transports: IndexMap<String, Arc<dyn Transport>> = IndexMap::new();
    transports.insert(name.to_string(), collecting.clone() as Arc<dyn Transport>);
    (collecting, Arc::new(transports))
}

/// Poll `pred` until it returns true or the deadline passes.
pub fn wait_until(deadline: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    pred()
}
