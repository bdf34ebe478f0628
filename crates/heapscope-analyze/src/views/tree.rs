//! Bottom-up, top-down and caller-callee construction.

use std::collections::HashSet;

use serde::Serialize;

use heapscope_format::StringIndex;

use crate::allocation_data::Stats;
use crate::trace_data::AccumulatedTraceData;
use crate::views::{Location, RowData, frame_location, location_for};

fn add_row<'a>(rows: &'a mut Vec<RowData>, location: Location, cost: Stats) -> &'a mut Vec<RowData> {
    let slot = rows.partition_point(|row| row.location < location);
    if rows.get(slot).is_none_or(|row| row.location != location) {
        rows.insert(
            slot,
            RowData {
                cost: Stats::default(),
                location,
                children: Vec::new(),
            },
        );
    }
    let row = &mut rows[slot];
    row.cost += cost;
    &mut row.children
}

/// Merge all allocations into the bottom-up tree: row = allocation point,
/// children = its callers, costs summed per location.
///
/// With `include_leaves` false the walk starts one frame above the
/// allocation point, which folds the allocator wrappers away.
pub fn merge_allocations(data: &AccumulatedTraceData, include_leaves: bool) -> Vec<RowData> {
    let mut top_rows: Vec<RowData> = Vec::new();

    for allocation in &data.allocations {
        let stats = *allocation.data.display(data.config.cost_kind);
        if stats.is_empty() {
            continue;
        }

        let mut trace_index = allocation.trace_index;
        if !include_leaves {
            trace_index = data.find_trace(trace_index).parent_index;
        }

        let mut rows = &mut top_rows;
        loop {
            let untracked = !trace_index.is_valid();
            let trace = data.find_trace(trace_index);
            let ip = data.find_ip(trace.ip_index);

            if !(data.config.hide_unmanaged_stack_parts && !ip.is_managed) {
                let location = location_for(data, &ip, untracked);
                rows = add_row(rows, location, stats);
                for inlined in &ip.inlined {
                    let location = frame_location(data, inlined, &ip, untracked);
                    rows = add_row(rows, location, stats);
                }
            }
            if data.is_stop_index(StringIndex::new(ip.frame.function_index.0)) {
                break;
            }
            trace_index = trace.parent_index;
            if !trace_index.is_valid() {
                break;
            }
        }
    }

    top_rows
}

fn find_or_insert(rows: &mut Vec<RowData>, location: &Location) -> usize {
    match rows.iter().position(|row| row.location == *location) {
        Some(slot) => slot,
        None => {
            rows.push(RowData {
                cost: Stats::default(),
                location: location.clone(),
                children: Vec::new(),
            });
            rows.len() - 1
        }
    }
}

fn build_top_down(
    rows: &[RowData],
    top_down: &mut Vec<RowData>,
    ancestors: &mut Vec<Location>,
) -> Stats {
    let mut total = Stats::default();
    for row in rows {
        ancestors.push(row.location.clone());
        let child_cost = build_top_down(&row.children, top_down, ancestors);
        ancestors.pop();

        if !child_cost.same_costs(&row.cost) {
            // this row is (partially) a leaf: bubble the leaf's own cost
            // up the caller chain so no node counts it twice
            let cost = row.cost - child_cost;
            let mut stack = &mut *top_down;
            for location in std::iter::once(&row.location).chain(ancestors.iter().rev()) {
                let slot = find_or_insert(stack, location);
                stack[slot].cost += cost;
                stack = &mut stack[slot].children;
            }
        }
        total += row.cost;
    }
    total
}

/// Invert the bottom-up tree into a top-down call tree.
pub fn to_top_down(bottom_up: &[RowData]) -> Vec<RowData> {
    let mut top_rows = Vec::new();
    build_top_down(bottom_up, &mut top_rows, &mut Vec::new());
    top_rows
}

/// Caller/callee summary row.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CallerCalleeRow {
    pub location: Location,
    pub inclusive_cost: Stats,
    pub self_cost: Stats,
}

fn build_caller_callee(
    rows: &[RowData],
    caller_callee: &mut Vec<CallerCalleeRow>,
    ancestors: &mut Vec<Location>,
) -> Stats {
    let mut total = Stats::default();
    for row in rows {
        ancestors.push(row.location.clone());
        let child_cost = build_caller_callee(&row.children, caller_callee, ancestors);
        ancestors.pop();

        if !child_cost.same_costs(&row.cost) {
            let cost = row.cost - child_cost;
            // walk the chain top-down; a symbol may appear several times
            // in one stack but must only be counted once per leaf
            let chain: Vec<&Location> =
                std::iter::once(&row.location).chain(ancestors.iter().rev()).collect();
            let last = chain.len() - 1;
            let mut recursion_guard: HashSet<&Location> = HashSet::new();
            for (depth, location) in chain.iter().enumerate() {
                if !recursion_guard.insert(*location) {
                    continue;
                }
                let slot = caller_callee
                    .partition_point(|candidate| candidate.location < **location);
                if caller_callee
                    .get(slot)
                    .is_none_or(|candidate| candidate.location != **location)
                {
                    caller_callee.insert(
                        slot,
                        CallerCalleeRow {
                            location: (*location).clone(),
                            ..CallerCalleeRow::default()
                        },
                    );
                }
                caller_callee[slot].inclusive_cost += cost;
                if depth == last {
                    caller_callee[slot].self_cost += cost;
                }
            }
        }
        total += row.cost;
    }
    total
}

/// Flatten the bottom-up tree into per-symbol inclusive and self costs.
/// In diff mode rows whose costs cancelled out are dropped.
pub fn to_caller_callee(bottom_up: &[RowData], diff_mode: bool) -> Vec<CallerCalleeRow> {
    let mut rows = Vec::new();
    build_caller_callee(bottom_up, &mut rows, &mut Vec::new());
    if diff_mode {
        rows.retain(|row| !row.inclusive_cost.is_empty() || !row.self_cost.is_empty());
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation_data::CostKind;
    use crate::trace_data::{NoHooks, ParsePass, ReadConfig};
    use std::io::Cursor;

    /// main -> produce -> allocate (2 allocations), main -> allocate (1)
    const STREAM: &str = "\
v 10100 2
s libapp.so
s main
s produce
s allocate
i 1000 0 1 0 2
i 2000 0 1 0 3
i 3000 0 1 0 4
t 1 0
t 2 1
t 3 2
t 3 1
a 10 3 0
a 20 4 0
+ 1
+ 1
+ 2
c 5
";

    fn dataset() -> AccumulatedTraceData {
        let mut data = AccumulatedTraceData::new(ReadConfig {
            cost_kind: CostKind::Malloc,
            ..ReadConfig::default()
        });
        let mut bytes = Cursor::new(STREAM.as_bytes().to_vec());
        data.read(&mut bytes, ParsePass::First, &mut NoHooks).unwrap();
        let mut bytes = Cursor::new(STREAM.as_bytes().to_vec());
        data.read(&mut bytes, ParsePass::Second, &mut NoHooks).unwrap();
        data
    }

    #[test]
    fn test_bottom_up_merges_by_location() {
        let data = dataset();
        let rows = merge_allocations(&data, true);

        // both allocation sites share the `allocate` tip
        assert_eq!(rows.len(), 1);
        let tip = &rows[0];
        assert_eq!(tip.location.function, "allocate");
        assert_eq!(tip.cost.allocations, 3);
        assert_eq!(tip.cost.allocated, 0x10 * 2 + 0x20);

        // two distinct callers below the tip
        assert_eq!(tip.children.len(), 2);
        let callers: Vec<&str> = tip
            .children
            .iter()
            .map(|row| row.location.function.as_str())
            .collect();
        assert!(callers.contains(&"produce"));
        assert!(callers.contains(&"main"));
    }

    #[test]
    fn test_bottom_up_stops_at_main() {
        let data = dataset();
        let rows = merge_allocations(&data, true);
        // `main` is a stop function, the walk must not continue above it
        fn assert_main_is_leaf(rows: &[RowData]) {
            for row in rows {
                if row.location.function == "main" {
                    assert!(row.children.is_empty());
                }
                assert_main_is_leaf(&row.children);
            }
        }
        assert_main_is_leaf(&rows);
    }

    #[test]
    fn test_top_down_inverts() {
        let data = dataset();
        let bottom_up = merge_allocations(&data, true);
        let top_down = to_top_down(&bottom_up);

        assert_eq!(top_down.len(), 1);
        let main = &top_down[0];
        assert_eq!(main.location.function, "main");
        // all cost is inclusive at the root
        assert_eq!(main.cost.allocations, 3);
        assert_eq!(main.cost.allocated, 0x40);

        let produce = main
            .children
            .iter()
            .find(|row| row.location.function == "produce")
            .expect("produce under main");
        assert_eq!(produce.cost.allocations, 2);

        let direct = main
            .children
            .iter()
            .find(|row| row.location.function == "allocate")
            .expect("direct allocation under main");
        assert_eq!(direct.cost.allocations, 1);
        assert_eq!(direct.cost.allocated, 0x20);
    }

    #[test]
    fn test_caller_callee_costs() {
        let data = dataset();
        let bottom_up = merge_allocations(&data, true);
        let rows = to_caller_callee(&bottom_up, false);

        let find = |name: &str| {
            rows.iter()
                .find(|row| row.location.function == name)
                .unwrap_or_else(|| panic!("row for {name}"))
        };

        // the tip owns all self cost
        let allocate = find("allocate");
        assert_eq!(allocate.self_cost.allocations, 3);
        assert_eq!(allocate.inclusive_cost.allocations, 3);

        // callers have inclusive but no self cost
        let produce = find("produce");
        assert_eq!(produce.self_cost.allocations, 0);
        assert_eq!(produce.inclusive_cost.allocations, 2);

        let main = find("main");
        assert_eq!(main.self_cost.allocations, 0);
        assert_eq!(main.inclusive_cost.allocations, 3);
    }

    #[test]
    fn test_caller_callee_diff_mode_prunes() {
        let data = dataset();
        let bottom_up: Vec<RowData> = Vec::new();
        let rows = to_caller_callee(&bottom_up, true);
        assert!(rows.is_empty());
        drop(data);
    }
}
