//! End-to-end tracker sessions against a file destination.
//!
//! The tracker is a process-wide singleton, so every test takes the same
//! lock and runs a full init/stop cycle.

use std::path::PathBuf;
use std::sync::Mutex;

use heapscope_tracker::api::{self, TrackerConfig};
use heapscope_tracker::writer::OutputSpec;

static SESSION: Mutex<()> = Mutex::new(());

fn run_session(test: impl FnOnce()) -> Vec<String> {
    let _serial = SESSION.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let dir = tempfile::tempdir().unwrap();
    let path: PathBuf = dir.path().join("trace.$$");

    let config = TrackerConfig {
        output: OutputSpec::Path(path.to_str().unwrap().into()),
        install_process_hooks: false,
        ..TrackerConfig::default()
    };
    assert!(api::init(config));

    test();
    api::stop();

    let resolved = dir.path().join(format!("trace.{}", std::process::id()));
    std::fs::read_to_string(resolved)
        .unwrap()
        .lines()
        .map(str::to_owned)
        .collect()
}

#[test]
fn test_header_and_shutdown_timestamp() {
    let lines = run_session(|| {});

    assert!(lines[0].starts_with("v "), "missing version header: {:?}", lines.first());
    assert!(lines.iter().any(|l| l.starts_with("I ")), "missing system info");
    // the boundary pseudo-frame is named up front
    assert!(
        lines
            .iter()
            .any(|l| l.starts_with("n ffffffffffffffff ")),
        "missing boundary name record"
    );
    // shutdown writes a final timestamp
    assert!(lines.iter().rev().any(|l| l.starts_with("c ")), "missing timestamp");
}

#[test]
fn test_malloc_free_records() {
    let lines = run_session(|| {
        api::on_malloc(0x100, 0x20);
        api::on_free(0x100);
    });

    let alloc = lines
        .iter()
        .find(|l| l.starts_with("+ 20 ") && l.ends_with(" 100"))
        .expect("allocation record");
    // the trace index in between must parse as hex
    let index = alloc.split(' ').nth(2).unwrap();
    assert!(u32::from_str_radix(index, 16).is_ok());

    assert!(lines.iter().any(|l| l == &"- 100".to_owned()), "free record");

    // allocation backtraces intern trace edges before use
    let alloc_at = lines.iter().position(|l| l == alloc).unwrap();
    let first_edge = lines.iter().position(|l| l.starts_with("t ")).unwrap();
    assert!(first_edge < alloc_at);
}

#[test]
fn test_realloc_is_free_then_alloc() {
    let lines = run_session(|| {
        api::on_malloc(0x10, 0xa);
        api::on_realloc(0x10, 0x64, 0x20);
    });

    let free_at = lines.iter().position(|l| l == "- 10").expect("old pointer freed");
    let alloc_at = lines
        .iter()
        .position(|l| l.starts_with("+ 64 ") && l.ends_with(" 20"))
        .expect("new allocation");
    assert!(free_at < alloc_at);
}

#[test]
fn test_mmap_munmap_page_alignment() {
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;
    let lines = run_session(|| {
        api::on_mmap(0x7000_0000, 100, libc::PROT_READ | libc::PROT_WRITE, -1);
        api::on_munmap(0x7000_0000, 100);
    });

    let map = lines
        .iter()
        .find(|l| l.starts_with("* ") && l.ends_with(" 70000000"))
        .expect("map record");
    let aligned = u64::from_str_radix(map.split(' ').nth(1).unwrap(), 16).unwrap();
    assert_eq!(aligned, page);

    let unmap = lines
        .iter()
        .find(|l| l.starts_with("/ ") && l.ends_with(" 70000000"))
        .expect("unmap record");
    let aligned = u64::from_str_radix(unmap.split(' ').nth(1).unwrap(), 16).unwrap();
    assert_eq!(aligned, page);
}

#[test]
fn test_gc_cycle_with_object_graph() {
    let lines = run_session(|| {
        api::on_gc_start();
        api::on_gc_survived_range(0x1000, 0x10, 0x2000);
        api::on_gc_root(0xa, 0x100);
        api::on_object_reference(0xa, 0x100, 0xb, 0x200);
        api::on_object_reference(0xb, 0x200, 0xa, 0x100);
        api::on_gc_finish();
    });

    let start = lines.iter().position(|l| l == "G 1").expect("GC start");
    let survived = lines
        .iter()
        .position(|l| l == "L 10 1000 2000")
        .expect("survival record");
    let finish = lines.iter().position(|l| l == "G 0").expect("GC finish");
    assert!(start < survived && survived < finish);

    // cycle eliminated: root, a with one child, b with none
    let edges: Vec<&String> = lines.iter().filter(|l| l.starts_with("e ")).collect();
    assert_eq!(edges.len(), 3);
    assert_eq!(edges[0], "e 1 1 0 0");
    assert_eq!(edges[1], "e 1 1 a 100");
    assert_eq!(edges[2], "e 1 0 b 200");
    assert!(finish < lines.iter().position(|l| l == "e 1 1 0 0").unwrap());
}

#[test]
fn test_class_load_registers_name() {
    let lines = run_session(|| {
        api::on_class_load(0x500, "System.String");
    });

    assert!(lines.iter().any(|l| l == "n 500 [System.String]"));
    assert!(lines.iter().any(|l| l == "C 500"));
}

#[test]
fn test_smaps_chunk_present() {
    // unmanaged mode samples /proc/self/smaps at init
    let lines = run_session(|| {});
    if !std::path::Path::new("/proc/self/smaps").exists() {
        return;
    }
    let open = lines.iter().position(|l| l == "K 1").expect("smaps chunk start");
    let close = lines.iter().position(|l| l == "K 0").expect("smaps chunk end");
    assert!(open < close);
    assert!(lines.iter().any(|l| l.starts_with("R ")), "missing RSS record");
    // the chunk holds k records plus the synthetic heap attribution
    // (map record, its trace edges, and a module dump)
    assert!(
        lines[open + 1..close].iter().all(|l| {
            l.starts_with("k ") || l.starts_with("* ") || l.starts_with("t ") || l.starts_with("m ")
        }),
        "unexpected record inside the smaps chunk"
    );
    assert!(lines[open + 1..close].iter().any(|l| l.starts_with("k ")));
}
