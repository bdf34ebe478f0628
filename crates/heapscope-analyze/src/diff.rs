//! Snapshot diffing.
//!
//! `self - base`, preserving the caller's indexing. Traces are matched
//! structurally: raw addresses differ between runs, so frames compare by
//! `(module, function, file, line)` only, with base string indices mapped
//! into the caller's string table first.

use std::cmp::Ordering;

use heapscope_format::{FileIndex, FunctionIndex, IpIndex, ModuleIndex, TraceIndex};

use crate::trace_data::{AccumulatedTraceData, Allocation, InstructionPointer, TraceNode};

/// Maps base string indices to this dataset's string indices; slot 0 is
/// the sentinel.
struct StringRemap {
    map: Vec<u32>,
}

impl StringRemap {
    fn remap(&self, index: u32) -> u32 {
        self.map.get(index as usize).copied().unwrap_or(0)
    }
}

/// Build the remap table, extending `own` with base-only strings.
fn remap_strings(own: &mut Vec<String>, base: &[String]) -> StringRemap {
    let mut by_text: std::collections::HashMap<&str, u32> = std::collections::HashMap::new();
    let mut additions: Vec<String> = Vec::new();
    for (slot, text) in own.iter().enumerate() {
        by_text.entry(text.as_str()).or_insert(slot as u32 + 1);
    }

    let mut map = Vec::with_capacity(base.len() + 1);
    map.push(0);
    let mut next = own.len() as u32;
    for text in base {
        match by_text.get(text.as_str()) {
            Some(index) => map.push(*index),
            None => {
                next += 1;
                additions.push(text.clone());
                by_text.insert(text.as_str(), next);
                map.push(next);
            }
        }
    }
    // delayed so by_text's borrows of `own` stay valid above
    drop(by_text);
    own.extend(additions);
    StringRemap { map }
}

fn map_ip(remap: &StringRemap, mut ip: InstructionPointer) -> InstructionPointer {
    ip.module_index = ModuleIndex::new(remap.remap(ip.module_index.0));
    ip.frame.function_index = FunctionIndex::new(remap.remap(ip.frame.function_index.0));
    ip.frame.file_index = FileIndex::new(remap.remap(ip.frame.file_index.0));
    for inlined in &mut ip.inlined {
        inlined.function_index = FunctionIndex::new(remap.remap(inlined.function_index.0));
        inlined.file_index = FileIndex::new(remap.remap(inlined.file_index.0));
    }
    ip
}

/// Structural comparison of two parent chains; `rhs_remap` maps the rhs
/// side's strings into the lhs string table first.
fn compare_traces(
    lhs: &AccumulatedTraceData,
    lhs_index: TraceIndex,
    rhs: &AccumulatedTraceData,
    rhs_index: TraceIndex,
    rhs_remap: Option<&StringRemap>,
) -> Ordering {
    match (lhs_index.is_valid(), rhs_index.is_valid()) {
        (false, false) => return Ordering::Equal,
        (true, false) => return Ordering::Greater,
        (false, true) => return Ordering::Less,
        (true, true) => {}
    }
    if std::ptr::eq(lhs, rhs) && lhs_index == rhs_index {
        return Ordering::Equal;
    }

    let lhs_trace = lhs.find_trace(lhs_index);
    let rhs_trace = rhs.find_trace(rhs_index);

    let parents = compare_traces(lhs, lhs_trace.parent_index, rhs, rhs_trace.parent_index, rhs_remap);
    if parents != Ordering::Equal {
        return parents;
    }

    let lhs_ip = lhs.find_ip(lhs_trace.ip_index);
    let rhs_ip = match rhs_remap {
        Some(remap) => map_ip(remap, rhs.find_ip(rhs_trace.ip_index)),
        None => rhs.find_ip(rhs_trace.ip_index),
    };
    lhs_ip.compare_without_address(&rhs_ip)
}

impl AccumulatedTraceData {
    /// Subtract `base` from this dataset.
    pub fn diff(&mut self, base: &AccumulatedTraceData) {
        self.total_cost -= base.total_cost;
        self.total_time -= base.total_time;
        self.peak_rss -= base.peak_rss;
        self.system_info.pages -= base.system_info.pages;
        self.system_info.page_size -= base.system_info.page_size;

        // step 1 + 2: sort own allocation traces for structural lookup and
        // merge allocations whose traces are structurally equal
        let mut allocation_trace_nodes: Vec<TraceIndex> = Vec::new();
        let old_allocations = std::mem::take(&mut self.allocations);
        let mut merged: Vec<(TraceIndex, Allocation)> = Vec::new();
        let mut kept: Vec<Allocation> = Vec::new();
        for allocation in old_allocations {
            let slot = allocation_trace_nodes.partition_point(|candidate| {
                compare_traces(self, *candidate, self, allocation.trace_index, None)
                    == Ordering::Less
            });
            let matched = allocation_trace_nodes.get(slot).copied();
            match matched {
                Some(trace)
                    if compare_traces(self, trace, self, allocation.trace_index, None)
                        == Ordering::Equal =>
                {
                    if trace != allocation.trace_index {
                        merged.push((trace, allocation));
                    } else {
                        kept.push(allocation);
                    }
                }
                _ => {
                    allocation_trace_nodes.insert(slot, allocation.trace_index);
                    kept.push(allocation);
                }
            }
        }
        self.allocations = kept;
        for (trace, allocation) in merged {
            self.find_allocation(trace).data += allocation.data;
        }

        // step 3: map base string indices into our table
        let remap = remap_strings(&mut self.strings, &base.strings);

        // step 4: subtract every base allocation, copying over traces that
        // have no structural match here
        let mut sorted_ips: Vec<IpIndex> = (1..=self.instruction_pointers.len() as u32)
            .map(IpIndex::new)
            .collect();
        sorted_ips.sort_by(|a, b| {
            self.find_ip(*a).compare_without_address(&self.find_ip(*b))
        });

        for base_allocation in &base.allocations {
            let lhs_trace = self.remap_trace(
                base,
                &remap,
                &mut allocation_trace_nodes,
                &mut sorted_ips,
                base_allocation.trace_index,
            );
            self.find_allocation(lhs_trace).data -= base_allocation.data;
        }

        // step 5: drop allocations whose entire cost vector is zero
        self.allocations
            .retain(|allocation| !allocation.data.is_empty());
    }

    fn remap_trace(
        &mut self,
        base: &AccumulatedTraceData,
        remap: &StringRemap,
        allocation_trace_nodes: &mut Vec<TraceIndex>,
        sorted_ips: &mut Vec<IpIndex>,
        rhs_index: TraceIndex,
    ) -> TraceIndex {
        if !rhs_index.is_valid() {
            return rhs_index;
        }

        let slot = allocation_trace_nodes.partition_point(|candidate| {
            compare_traces(self, *candidate, base, rhs_index, Some(remap)) == Ordering::Less
        });
        if let Some(candidate) = allocation_trace_nodes.get(slot) {
            if compare_traces(self, *candidate, base, rhs_index, Some(remap)) == Ordering::Equal {
                return *candidate;
            }
        }

        let copied = self.copy_trace(base, remap, sorted_ips, rhs_index);
        allocation_trace_nodes.insert(slot, copied);
        copied
    }

    /// Copy a base trace node and everything it references, recursively.
    fn copy_trace(
        &mut self,
        base: &AccumulatedTraceData,
        remap: &StringRemap,
        sorted_ips: &mut Vec<IpIndex>,
        rhs_index: TraceIndex,
    ) -> TraceIndex {
        if !rhs_index.is_valid() {
            return rhs_index;
        }

        let rhs_trace = base.find_trace(rhs_index);
        let parent_index = self.copy_trace(base, remap, sorted_ips, rhs_trace.parent_index);
        let ip_index = self.remap_ip_index(base, remap, sorted_ips, rhs_trace.ip_index);

        self.traces.push(TraceNode {
            ip_index,
            parent_index,
            coreclr: Default::default(),
        });
        TraceIndex::new(self.traces.len() as u32)
    }

    /// Find the structural twin of a base ip here, or copy it over.
    fn remap_ip_index(
        &mut self,
        base: &AccumulatedTraceData,
        remap: &StringRemap,
        sorted_ips: &mut Vec<IpIndex>,
        rhs_index: IpIndex,
    ) -> IpIndex {
        if !rhs_index.is_valid() {
            return rhs_index;
        }

        let lhs_ip = map_ip(remap, base.find_ip(rhs_index));
        let slot = sorted_ips.partition_point(|candidate| {
            self.find_ip(*candidate).compare_without_address(&lhs_ip) == Ordering::Less
        });
        if let Some(candidate) = sorted_ips.get(slot) {
            if self.find_ip(*candidate).equal_without_address(&lhs_ip) {
                return *candidate;
            }
        }

        self.instruction_pointers.push(lhs_ip);
        let index = IpIndex::new(self.instruction_pointers.len() as u32);
        sorted_ips.insert(slot, index);
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation_data::CostKind;
    use crate::trace_data::{NoHooks, ParsePass, ReadConfig};
    use std::io::Cursor;

    fn dataset(stream: &str) -> AccumulatedTraceData {
        let mut data = AccumulatedTraceData::new(ReadConfig {
            cost_kind: CostKind::Malloc,
            ..ReadConfig::default()
        });
        let mut bytes = Cursor::new(stream.as_bytes().to_vec());
        data.read(&mut bytes, ParsePass::First, &mut NoHooks).unwrap();
        let mut bytes = Cursor::new(stream.as_bytes().to_vec());
        data.read(&mut bytes, ParsePass::Second, &mut NoHooks).unwrap();
        data
    }

    const STREAM: &str = "\
v 10100 2
s libapp.so
s produce
s consume
i 1000 0 1 0 2
i 2000 0 1 0 3
t 1 0
t 2 1
a 20 2 0
+ 1
c 5
";

    #[test]
    fn test_diff_with_self_is_empty() {
        let mut data = dataset(STREAM);
        let base = dataset(STREAM);
        data.diff(&base);
        assert!(data.allocations.is_empty());
        assert_eq!(data.total_cost.malloc.leaked, 0);
        assert_eq!(data.total_cost.malloc.allocations, 0);
        assert_eq!(data.total_time, 0);
    }

    #[test]
    fn test_diff_subtracts_matching_traces() {
        // same shape, different raw addresses: still matches structurally
        let moved = STREAM.replace("i 1000", "i 1100").replace("i 2000", "i 2100");
        let mut data = dataset(&moved);
        let base = dataset(STREAM);

        // one extra allocation in the new dataset
        let extra = "\
v 10100 2
s libapp.so
s produce
s consume
i 1100 0 1 0 2
i 2100 0 1 0 3
t 1 0
t 2 1
a 20 2 0
+ 1
+ 1
c 5
";
        let mut data2 = dataset(extra);
        data2.diff(&base);
        assert_eq!(data2.allocations.len(), 1);
        assert_eq!(data2.allocations[0].data.malloc.allocations, 1);
        assert_eq!(data2.allocations[0].data.malloc.leaked, 0x20);

        data.diff(&base);
        assert!(data.allocations.is_empty());
    }

    #[test]
    fn test_diff_copies_base_only_traces() {
        let base_only = "\
v 10100 2
s libother.so
s setup
i 3000 0 1 0 2
t 1 0
a 40 1 0
+ 1
c 5
";
        let mut data = dataset(STREAM);
        let strings_before = data.strings.len();
        let base = dataset(base_only);
        data.diff(&base);

        // the base-only allocation shows up negated
        assert!(data.strings.len() > strings_before);
        let negative = data
            .allocations
            .iter()
            .find(|allocation| allocation.data.malloc.allocations < 0)
            .expect("negated base-only allocation");
        assert_eq!(negative.data.malloc.leaked, -0x40);
    }
}
