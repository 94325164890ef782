// Property tests: reassembly must not depend on how the byte stream is
// split across partial reads, and complete inputs must round-trip exactly.

use std::sync::atomic::AtomicBool;
use std::time::Duration;

use proptest::prelude::*;

use logship::multiline::{MatchMode, MultilineConfig, MultilineReassembler, ReplacePolicy};
use logship::reader::MemoryReader;

const MAX_LEN: usize = 8192;

fn reassemble_chunked(input: &[u8], chunk_sizes: &[usize], config: &MultilineConfig) -> Vec<String> {
    let mut ml = MultilineReassembler::new(config.clone());
    let mut reader = MemoryReader::default();
    let stop = AtomicBool::new(false);
    let mut records = Vec::new();

    let mut offset = 0;
    let mut sizes = chunk_sizes.iter().cycle();
    while offset < input.len() {
        let size = (*sizes.next().unwrap()).max(1).min(input.len() - offset);
        reader.feed(&input[offset..offset + size]);
        offset += size;
        while let Some(rec) = ml.next_record(&mut reader, MAX_LEN, &stop).unwrap() {
            records.push(rec.text);
        }
    }
    records
}

fn start_config() -> MultilineConfig {
    MultilineConfig::new(
        MatchMode::Start,
        r"^--",
        ReplacePolicy::Keep,
        Duration::from_secs(3600),
    )
    .unwrap()
}

fn end_config() -> MultilineConfig {
    MultilineConfig::new(
        MatchMode::End,
        r";$",
        ReplacePolicy::Keep,
        Duration::from_secs(3600),
    )
    .unwrap()
}

/// Body lines that can never be mistaken for a boundary.
fn body_line() -> impl Strategy<Value = String> {
    "[a-z0-9 ]{0,20}".prop_map(|s| format!("b{}", s))
}

prop_compose! {
    /// One record: a "--" header plus 0..4 body lines.
    fn start_record()(body in prop::collection::vec(body_line(), 0..4), head in "[a-z]{1,8}") -> Vec<String> {
        let mut lines = vec![format!("--{}", head)];
        lines.extend(body);
        lines
    }
}

prop_compose! {
    /// One record: 0..4 body lines closed by a ";" terminator line.
    fn end_record()(body in prop::collection::vec(body_line(), 0..4), tail in "[a-z]{0,8}") -> Vec<String> {
        let mut lines = body;
        lines.push(format!("{};", tail));
        lines
    }
}

fn stream_of(records: &[Vec<String>]) -> Vec<u8> {
    let mut out = Vec::new();
    for record in records {
        for line in record {
            out.extend_from_slice(line.as_bytes());
            out.push(b'\n');
        }
    }
    out
}

proptest! {
    #[test]
    fn chunking_is_invisible_for_match_start(
        records in prop::collection::vec(start_record(), 1..8),
        chunk_sizes in prop::collection::vec(1usize..32, 1..8),
    ) {
        let input = stream_of(&records);
        let config = start_config();
        let whole = reassemble_chunked(&input, &[input.len()], &config);
        let chunked = reassemble_chunked(&input, &chunk_sizes, &config);
        prop_assert_eq!(whole, chunked);
    }

    #[test]
    fn chunking_is_invisible_for_match_end(
        records in prop::collection::vec(end_record(), 1..8),
        chunk_sizes in prop::collection::vec(1usize..32, 1..8),
    ) {
        let input = stream_of(&records);
        let config = end_config();
        let whole = reassemble_chunked(&input, &[input.len()], &config);
        let chunked = reassemble_chunked(&input, &chunk_sizes, &config);
        prop_assert_eq!(whole, chunked);
    }

    #[test]
    fn k_terminated_records_yield_exactly_k(
        records in prop::collection::vec(end_record(), 1..10),
    ) {
        let input = stream_of(&records);
        let config = end_config();
        let out = reassemble_chunked(&input, &[input.len()], &config);

        // With MatchEnd every record closes itself, so all K come out, each
        // byte-identical to its input lines joined by the kept newlines.
        prop_assert_eq!(out.len(), records.len());
        for (got, want) in out.iter().zip(records.iter()) {
            let want = want.join("\n");
            prop_assert_eq!(got.as_str(), want.as_str());
        }
    }
}
