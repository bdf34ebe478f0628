//! Address-range map.
//!
//! An ordered partition of the observed virtual memory regions. No two
//! records overlap; splits happen at update/remove boundaries and adjacent
//! records with identical attributes can be coalesced back together.

use std::collections::BTreeMap;
use std::ops::Range;

use heapscope_format::TraceIndex;

use crate::allocation_data::CoreClrType;

/// Physical memory assigned to a range from one smaps chunk, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhysicalMemory {
    pub private_clean: i64,
    pub private_dirty: i64,
    pub shared_clean: i64,
    pub shared_dirty: i64,
    pub is_set: bool,
}

/// One record of the partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRangeInfo {
    pub start: u64,
    pub size: u64,
    pub prot: i32,
    pub fd: i32,
    pub is_coreclr: CoreClrType,
    pub trace_index: TraceIndex,
    pub physical: PhysicalMemory,
}

impl AddressRangeInfo {
    pub fn new(start: u64, size: u64) -> Self {
        Self {
            start,
            size,
            prot: 0,
            fd: 0,
            is_coreclr: CoreClrType::Unknown,
            trace_index: TraceIndex::NONE,
            physical: PhysicalMemory::default(),
        }
    }

    pub fn shared(&self) -> i64 {
        self.physical.shared_clean + self.physical.shared_dirty
    }

    pub fn private_clean(&self) -> i64 {
        self.physical.private_clean
    }

    pub fn private_dirty(&self) -> i64 {
        self.physical.private_dirty
    }

    /// Assign this range's share of one smaps record covering
    /// `covered_size` bytes; values are prorated by size.
    pub fn set_physical(&mut self, covered_size: u64, private_dirty: i64, private_clean: i64, shared_dirty: i64, shared_clean: i64) {
        let prorate = |value: i64| {
            if covered_size == 0 {
                0
            } else {
                (value as i128 * self.size as i128 / covered_size as i128) as i64
            }
        };
        self.physical = PhysicalMemory {
            private_clean: prorate(private_clean),
            private_dirty: prorate(private_dirty),
            shared_clean: prorate(shared_clean),
            shared_dirty: prorate(shared_dirty),
            is_set: true,
        };
    }

    pub fn reset_physical(&mut self) {
        self.physical = PhysicalMemory::default();
    }

    /// Split off the tail at `offset`, shrinking self to `offset` bytes.
    /// Physical memory is prorated between the two halves.
    fn split(&mut self, offset: u64) -> AddressRangeInfo {
        debug_assert!(offset > 0 && offset < self.size);
        let mut tail = self.clone();
        tail.start = self.start + offset;
        tail.size = self.size - offset;
        if self.physical.is_set {
            let total = self.size;
            let prorate = |value: i64, part: u64| (value as i128 * part as i128 / total as i128) as i64;
            tail.physical.private_clean = prorate(self.physical.private_clean, tail.size);
            tail.physical.private_dirty = prorate(self.physical.private_dirty, tail.size);
            tail.physical.shared_clean = prorate(self.physical.shared_clean, tail.size);
            tail.physical.shared_dirty = prorate(self.physical.shared_dirty, tail.size);
            self.physical.private_clean -= tail.physical.private_clean;
            self.physical.private_dirty -= tail.physical.private_dirty;
            self.physical.shared_clean -= tail.physical.shared_clean;
            self.physical.shared_dirty -= tail.physical.shared_dirty;
        }
        self.size = offset;
        tail
    }

    /// Merge `other` into self when it directly follows and carries the
    /// same attributes.
    fn combine_if_similar(&mut self, other: &AddressRangeInfo) -> bool {
        if self.start + self.size != other.start
            || self.prot != other.prot
            || self.fd != other.fd
            || self.is_coreclr != other.is_coreclr
        {
            return false;
        }
        self.size += other.size;
        self.physical.private_clean += other.physical.private_clean;
        self.physical.private_dirty += other.physical.private_dirty;
        self.physical.shared_clean += other.physical.shared_clean;
        self.physical.shared_dirty += other.physical.shared_dirty;
        self.physical.is_set |= other.physical.is_set;
        true
    }
}

/// Ordered, non-overlapping map of [`AddressRangeInfo`] keyed by start.
#[derive(Default)]
pub struct AddressRangeMap {
    ranges: BTreeMap<u64, AddressRangeInfo>,
}

impl AddressRangeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AddressRangeInfo> {
        self.ranges.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut AddressRangeInfo> {
        self.ranges.values_mut()
    }

    /// Ranges intersecting `[start, start + size)`; after
    /// [`AddressRangeMap::update`] this is an exact tiling.
    pub fn covered(&self, start: u64, size: u64) -> impl Iterator<Item = &AddressRangeInfo> {
        self.ranges.range(start..start + size).map(|(_, info)| info)
    }

    pub fn covered_mut(&mut self, start: u64, size: u64) -> impl Iterator<Item = &mut AddressRangeInfo> {
        self.ranges
            .range_mut(start..start + size)
            .map(|(_, info)| info)
    }

    /// Classify an address by the coreclr state of its containing range.
    pub fn classify(&self, address: u64) -> CoreClrType {
        let candidate = self.ranges.range(..=address).next_back();
        match candidate {
            Some((_, info)) if address < info.start + info.size => info.is_coreclr,
            _ => CoreClrType::Unknown,
        }
    }

    /// Split the range containing `at` so a record boundary falls on
    /// `at`; a no-op when `at` is already a boundary or uncovered.
    fn split_at(&mut self, at: u64) {
        let Some((&key, info)) = self.ranges.range_mut(..at).next_back() else {
            return;
        };
        if key + info.size > at {
            let tail = info.split(at - key);
            self.ranges.insert(at, tail);
        }
    }

    /// Ensure `[start, start + size)` is fully covered by records,
    /// splitting at the boundaries and filling gaps with fresh records.
    /// Returns the covered key range.
    pub fn update(&mut self, start: u64, size: u64) -> Range<u64> {
        let end = start + size;
        self.split_at(start);
        self.split_at(end);

        // walk the covered span and fill the gaps
        let mut cursor = start;
        while cursor != end {
            let next_existing = self
                .ranges
                .range(cursor..end)
                .next()
                .map(|(key, info)| (*key, info.size));
            match next_existing {
                Some((key, existing_size)) if key == cursor => {
                    cursor = key + existing_size;
                    debug_assert!(cursor <= end);
                }
                Some((key, _)) => {
                    self.ranges
                        .insert(cursor, AddressRangeInfo::new(cursor, key - cursor));
                    cursor = key;
                }
                None => {
                    self.ranges
                        .insert(cursor, AddressRangeInfo::new(cursor, end - cursor));
                    cursor = end;
                }
            }
        }
        start..end
    }

    /// Drop `[start, start + size)`, splitting boundary records.
    pub fn remove(&mut self, start: u64, size: u64) {
        let end = start + size;
        self.split_at(start);
        self.split_at(end);
        let covered: Vec<u64> = self.ranges.range(start..end).map(|(key, _)| *key).collect();
        for key in covered {
            self.ranges.remove(&key);
        }
    }

    /// Merge adjacent records with identical `(prot, fd, coreclr)`.
    pub fn coalesce_similar(&mut self) {
        let keys: Vec<u64> = self.ranges.keys().copied().collect();
        let mut current: Option<u64> = None;
        for key in keys {
            let Some(head_key) = current else {
                current = Some(key);
                continue;
            };
            let candidate = self.ranges.get(&key).cloned().expect("key just listed");
            let head = self.ranges.get_mut(&head_key).expect("head still present");
            if head.combine_if_similar(&candidate) {
                self.ranges.remove(&key);
            } else {
                current = Some(key);
            }
        }
    }
}
