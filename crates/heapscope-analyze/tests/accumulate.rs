//! End-to-end accumulation over synthetic resolved streams.

use std::io::Cursor;
use std::io::Write;

use heapscope_analyze::{
    AccumulatedTraceData, CostKind, NoHooks, ParsePass, ReadConfig, ReadError,
};

fn accumulate(stream: &str, kind: CostKind) -> AccumulatedTraceData {
    let mut data = AccumulatedTraceData::new(ReadConfig {
        cost_kind: kind,
        ..ReadConfig::default()
    });
    let mut bytes = Cursor::new(stream.as_bytes().to_vec());
    data.read(&mut bytes, ParsePass::First, &mut NoHooks).unwrap();
    let mut bytes = Cursor::new(stream.as_bytes().to_vec());
    data.read(&mut bytes, ParsePass::Second, &mut NoHooks).unwrap();
    data
}

#[test]
fn test_simple_alloc_free() {
    // malloc(ptr=0x100, size=32); free(0x100)
    let data = accumulate("v 10100 2\na 20 1 0\n+ 1\n- 1\nc 5\n", CostKind::Malloc);
    assert_eq!(data.total_cost.malloc.allocations, 1);
    assert_eq!(data.total_cost.malloc.deallocations, 1);
    assert_eq!(data.total_cost.malloc.peak, 0x20);
    assert_eq!(data.total_cost.malloc.leaked, 0);
    assert_eq!(data.total_cost.malloc.temporary, 1);
}

#[test]
fn test_temporary_needs_adjacent_free() {
    // the second allocation is freed right away: one temporary
    let stream = "v 10100 2\na a 1 0\na a 2 0\n+ 1\n+ 2\n- 2\n- 1\nc 5\n";
    let data = accumulate(stream, CostKind::Malloc);
    assert_eq!(data.total_cost.malloc.temporary, 1);
    assert_eq!(data.total_cost.malloc.leaked, 0);
}

#[test]
fn test_temporary_same_info_pair() {
    // malloc(A); malloc(B); free(A); free(B) where both share one info:
    // exactly one of the frees directly follows its allocation
    let stream = "v 10100 2\na a 1 0\n+ 1\n+ 1\n- 1\n- 1\nc 5\n";
    let data = accumulate(stream, CostKind::Malloc);
    assert_eq!(data.total_cost.malloc.temporary, 1);
    assert_eq!(data.total_cost.malloc.leaked, 0);
}

#[test]
fn test_realloc_grow() {
    // p = malloc(10); q = realloc(p, 100) with q != p
    let stream = "v 10100 2\na 10 1 0\na 64 1 0\n+ 1\n- 1\n+ 2\nc 5\n";
    let data = accumulate(stream, CostKind::Malloc);
    assert_eq!(data.total_cost.malloc.allocations, 2);
    assert_eq!(data.total_cost.malloc.deallocations, 1);
    assert_eq!(data.total_cost.malloc.peak, 0x64);
    assert_eq!(data.total_cost.malloc.leaked, 0x64);
}

#[test]
fn test_round_trip_identity() {
    // every allocation freed before exit: leaked must be zero
    let mut stream = String::from("v 10100 2\n");
    for index in 1..=16 {
        stream.push_str(&format!("a {:x} {:x} 0\n", index * 8, index));
    }
    for index in 1..=16 {
        stream.push_str(&format!("+ {index:x}\n"));
    }
    for index in (1..=16).rev() {
        stream.push_str(&format!("- {index:x}\n"));
    }
    stream.push_str("c 5\n");

    let data = accumulate(&stream, CostKind::Malloc);
    assert_eq!(data.total_cost.malloc.leaked, 0);
    assert_eq!(data.total_cost.malloc.allocations, 16);
    assert_eq!(data.total_cost.malloc.deallocations, 16);
    // the peak is the sum of all sizes, reached just before the frees
    let expected: i64 = (1..=16).map(|index| index * 8).sum();
    assert_eq!(data.total_cost.malloc.peak, expected);
}

#[test]
fn test_monotone_peak_equals_max_leaked() {
    let stream = "v 10100 2\n\
                  a 10 1 0\na 20 2 0\n\
                  + 1\nc 1\n+ 2\nc 2\n- 1\nc 3\n+ 1\nc 4\n";
    let data = accumulate(stream, CostKind::Malloc);
    // max over time of leaked: 0x10, 0x30, 0x20, 0x30
    assert_eq!(data.total_cost.malloc.peak, 0x30);
    assert_eq!(data.malloc_peak_time, 1);
}

#[test]
fn test_second_pass_peak_attribution() {
    // the sum of per-allocation peaks equals the global peak at the
    // confirmed peak instant
    let stream = "v 10100 2\n\
                  a 10 1 0\na 20 2 0\n\
                  + 1\nc 1\n+ 2\nc 2\n- 1\nc 3\n+ 1\nc 4\n";
    let data = accumulate(stream, CostKind::Malloc);

    let per_allocation_peak: i64 = data
        .allocations
        .iter()
        .map(|allocation| allocation.data.malloc.peak)
        .sum();
    assert_eq!(per_allocation_peak, data.total_cost.malloc.peak);

    // trace 1 later grows past its share, the snapshot must not move
    let trace1 = data
        .allocations
        .iter()
        .find(|allocation| allocation.trace_index.0 == 1)
        .unwrap();
    assert_eq!(trace1.data.malloc.peak, 0x10);
    assert_eq!(trace1.data.malloc.leaked, 0x10);
}

#[test]
fn test_managed_alloc_does_not_break_temporary_detection() {
    // malloc; managed alloc; free: the managed event between the native
    // pair must not disturb the native temporary key
    let stream = "v 10100 2\na 10 1 0\na 40 2 1\n+ 1\n^ 2\n- 1\nc 5\n";
    let data = accumulate(stream, CostKind::Malloc);
    assert_eq!(data.total_cost.malloc.temporary, 1);
    assert_eq!(data.total_cost.malloc.leaked, 0);
    assert_eq!(data.total_cost.managed.allocations, 1);
}

#[test]
fn test_managed_cost_kind() {
    let stream = "v 10100 2\na 40 1 1\n^ 1\n~ 1\n^ 1\nc 5\n";
    let data = accumulate(stream, CostKind::Managed);
    assert_eq!(data.total_cost.managed.allocations, 2);
    assert_eq!(data.total_cost.managed.deallocations, 1);
    assert_eq!(data.total_cost.managed.leaked, 0x40);
    assert_eq!(data.total_cost.managed.peak, 0x40);
}

#[test]
fn test_smaps_chunk_updates_physical_costs() {
    let stream = "v 10100 2\n\
                  t 1 0\n\
                  * 1000 3 0 ffffffff 1 10000\n\
                  K 1\n\
                  k 10000 1000 4 8 4 0 0 3\n\
                  K 0\n\
                  R 40\n\
                  c 5\n";
    let data = accumulate(stream, CostKind::PrivateDirty);
    assert_eq!(data.total_cost.private_dirty.leaked, 8 * 1024);
    assert_eq!(data.total_cost.private_clean.leaked, 4 * 1024);
    assert_eq!(data.total_cost.private_dirty.peak, 8 * 1024);
    assert_eq!(data.peak_rss, 0x40);

    // the cost lands on the mapping's trace
    let attributed = data
        .allocations
        .iter()
        .find(|allocation| allocation.trace_index.0 == 1)
        .expect("range cost attributed");
    assert_eq!(attributed.data.private_dirty.leaked, 8 * 1024);
}

#[test]
fn test_unmap_drops_ranges() {
    let stream = "v 10100 2\n\
                  t 1 0\n\
                  * 1000 3 0 ffffffff 1 10000\n\
                  / 1000 10000\n\
                  c 5\n";
    let data = accumulate(stream, CostKind::Malloc);
    assert!(data.address_ranges.is_empty());
}

#[test]
fn test_format_version_mismatch_is_fatal() {
    let mut data = AccumulatedTraceData::new(ReadConfig::default());
    let mut bytes = Cursor::new(b"v 10100 3\n".to_vec());
    let result = data.read(&mut bytes, ParsePass::First, &mut NoHooks);
    assert!(matches!(result, Err(ReadError::UnsupportedFormat { .. })));
}

#[test]
fn test_out_of_bounds_index_is_skipped() {
    // allocation index way out of bounds: log and continue, never panic
    let stream = "v 10100 2\na 10 1 0\n+ 7f\n+ 1\nc 5\n";
    let data = accumulate(stream, CostKind::Malloc);
    assert_eq!(data.total_cost.malloc.allocations, 1);
}

#[test]
fn test_attached_marker_resets_totals() {
    let stream = "v 10100 2\na 10 1 0\n+ 1\nA\n+ 1\nc 5\n";
    let data = accumulate(stream, CostKind::Malloc);
    assert!(data.from_attached);
    assert_eq!(data.total_cost.malloc.allocations, 1);
}

#[test]
fn test_gzip_input_via_parse() {
    use flate2::Compression;
    use flate2::write::GzEncoder;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trace.gz");
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(b"v 10100 2\ns libapp.so\ns main\ni 1000 0 1 0 2\nt 1 0\na 20 1 0\n+ 1\nc 5\n")
        .unwrap();
    std::fs::write(&path, encoder.finish().unwrap()).unwrap();

    let results = heapscope_analyze::parse(&path, ReadConfig::default(), None).unwrap();
    assert_eq!(results.summary.cost.allocations, 1);
    assert_eq!(results.summary.cost.peak, 0x20);
    assert_eq!(results.bottom_up.len(), 1);
    assert_eq!(results.bottom_up[0].location.function, "main");
}

#[test]
fn test_diff_reflexivity_via_parse() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trace");
    std::fs::write(
        &path,
        b"v 10100 2\ns libapp.so\ns main\ni 1000 0 1 0 2\nt 1 0\na 20 1 0\n+ 1\nc 5\n",
    )
    .unwrap();

    let results = heapscope_analyze::parse(&path, ReadConfig::default(), Some(&path)).unwrap();
    assert!(results.diff_mode);
    assert!(results.data.allocations.is_empty());
    assert!(results.bottom_up.is_empty());
}
