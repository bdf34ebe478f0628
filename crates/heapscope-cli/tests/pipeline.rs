//! Full pipeline: raw stream → interpreter → accumulator.

use std::io::Cursor;

use heapscope_analyze::{AccumulatedTraceData, CostKind, NoHooks, ParsePass, ReadConfig};
use heapscope_interpret::{Interpreter, NullResolver};

fn resolve(raw: &str) -> String {
    let mut interpreter = Interpreter::new(NullResolver, Vec::new());
    let mut input = Cursor::new(raw.as_bytes().to_vec());
    interpreter.run(&mut input).unwrap();
    String::from_utf8(interpreter.into_output()).unwrap()
}

fn accumulate(resolved: &str, kind: CostKind) -> AccumulatedTraceData {
    let mut data = AccumulatedTraceData::new(ReadConfig {
        cost_kind: kind,
        ..ReadConfig::default()
    });
    let mut bytes = Cursor::new(resolved.as_bytes().to_vec());
    data.read(&mut bytes, ParsePass::First, &mut NoHooks).unwrap();
    let mut bytes = Cursor::new(resolved.as_bytes().to_vec());
    data.read(&mut bytes, ParsePass::Second, &mut NoHooks).unwrap();
    data
}

const RAW: &str = "\
v 10100 2
x /usr/bin/app
X /usr/bin/app --serve
I 1000 3e8
m x -------- 400000 0 100000
t 401000 0 0
t 402000 1 0
+ 20 2 7f0000001000
+ 20 2 7f0000002000
- 7f0000001000
- 7f0000002000
+ 40 2 7f0000003000
c a
";

#[test]
fn test_native_roundtrip_through_pipeline() {
    let resolved = resolve(RAW);

    // the executable's module got interned and the ips resolved to it
    assert!(resolved.contains("s /usr/bin/app\n"));
    assert!(resolved.contains("i 401000 0 1 1000\n"));

    let data = accumulate(&resolved, CostKind::Malloc);
    assert_eq!(data.total_cost.malloc.allocations, 3);
    assert_eq!(data.total_cost.malloc.deallocations, 2);
    // the two equal-sized allocations share one info index; one of the
    // frees directly follows an allocation with that key
    assert_eq!(data.total_cost.malloc.temporary, 1);
    assert_eq!(data.total_cost.malloc.leaked, 0x40);
    assert_eq!(data.total_cost.malloc.peak, 0x40);
    assert_eq!(data.system_info.page_size, 0x1000);
}

const RAW_MANAGED: &str = "\
v 10100 2
I 1000 3e8
n 10 App.Main
n 20 Buffer.Create
t 10 0 1
t 20 1 1
n 500 [Buffer]
C 500
^ 2 40 10000
^ 2 40 10040
G 1
L 40 10000 20000
e 1 1 0 0
e 1 0 10000 500
G 0
c a
";

#[test]
fn test_managed_gc_through_pipeline() {
    let resolved = resolve(RAW_MANAGED);

    // managed names interned with the high managed bit
    assert!(resolved.contains("s App.Main\n"));
    assert!(resolved.contains("i 8000000000000010 1 0 0"));
    // one object died, one survived by moving
    assert!(resolved.contains("~ 1\n"));

    let data = accumulate(&resolved, CostKind::Managed);
    assert_eq!(data.total_cost.managed.allocations, 2);
    assert_eq!(data.total_cost.managed.deallocations, 1);
    assert_eq!(data.total_cost.managed.leaked, 0x40);

    // object tree survived the trip
    assert_eq!(data.object_tree_nodes.len(), 2);
    assert_eq!(data.object_tree_nodes[1].object_ptr, 0x10000);
}

#[test]
fn test_smaps_passthrough() {
    let raw = "\
v 10100 2
t 401000 0 0
* 1000 3 0 ffffffff 1 10000
K 1
k 10000 1000 4 8 4 0 0 3
K 0
R 28
c a
";
    let resolved = resolve(raw);
    assert!(resolved.contains("K 1\n"));
    assert!(resolved.contains("k 10000 1000 4 8 4 0 0 3\n"));
    assert!(resolved.contains("R 28\n"));

    let data = accumulate(&resolved, CostKind::PrivateDirty);
    assert_eq!(data.total_cost.private_dirty.leaked, 8 * 1024);
    assert_eq!(data.peak_rss, 0x28);
}
