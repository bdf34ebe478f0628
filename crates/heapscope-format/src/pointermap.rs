//! Live-pointer map and allocation-info deduplication.

use rustc_hash::FxHashMap;

use crate::indices::{AllocationIndex, TraceIndex};

/// Maps every live allocation's pointer to its allocation-info index.
///
/// An active pointer has exactly one entry; `free`/`munmap` takes it out.
#[derive(Default)]
pub struct PointerMap {
    map: FxHashMap<u64, AllocationIndex>,
}

impl PointerMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate `ptr` with `index`, replacing any stale entry.
    pub fn add_pointer(&mut self, ptr: u64, index: AllocationIndex) {
        self.map.insert(ptr, index);
    }

    /// Remove and return the entry for `ptr`.
    pub fn take_pointer(&mut self, ptr: u64) -> Option<AllocationIndex> {
        self.map.remove(&ptr)
    }

    /// Look up `ptr` without removing it.
    pub fn peek_pointer(&self, ptr: u64) -> Option<AllocationIndex> {
        self.map.get(&ptr).copied()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Interns `(size, trace, is_managed)` triples to stable allocation indices.
///
/// Concurrent allocations that share size and call site share one info; the
/// info is never removed, so indices stay valid for the whole stream.
#[derive(Default)]
pub struct AllocationInfoSet {
    set: FxHashMap<(u64, TraceIndex, bool), AllocationIndex>,
}

impl AllocationInfoSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern one info. Returns the index and whether it was newly created,
    /// in which case the caller must emit the corresponding `a` record.
    /// Indices are 1-based and assigned in emission order.
    pub fn add(&mut self, size: u64, trace: TraceIndex, is_managed: bool) -> (AllocationIndex, bool) {
        let next = AllocationIndex::new(self.set.len() as u32 + 1);
        match self.set.entry((size, trace, is_managed)) {
            std::collections::hash_map::Entry::Occupied(entry) => (*entry.get(), false),
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(next);
                (next, true)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}
