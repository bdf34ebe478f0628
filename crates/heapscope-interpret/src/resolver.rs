//! Module bookkeeping and the symbolication seam.

use heapscope_format::StringIndex;

/// One resolved source frame. Empty strings mean "unknown".
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Frame {
    pub function: String,
    pub file: String,
    pub line: i32,
}

impl Frame {
    pub fn is_valid(&self) -> bool {
        !self.function.is_empty()
    }
}

/// Symbolication result for one address.
#[derive(Debug, Default, Clone)]
pub struct AddressInfo {
    pub frame: Frame,
    pub inlined: Vec<Frame>,
}

/// Resolves an address inside a module to source frames.
///
/// Debug-info lookup is an external collaborator; implementations receive
/// the module path and the module-relative offset and may consult whatever
/// symbol state they maintain per module.
pub trait Resolver {
    fn resolve(&mut self, module_path: &str, module_offset: u64, address: u64) -> AddressInfo;
}

/// Resolver that knows nothing; addresses keep module and offset only.
pub struct NullResolver;

impl Resolver for NullResolver {
    fn resolve(&mut self, _module_path: &str, _module_offset: u64, _address: u64) -> AddressInfo {
        AddressInfo::default()
    }
}

struct ModuleRange {
    start: u64,
    end: u64,
    module_index: StringIndex,
    path_slot: usize,
}

/// Loadable segments of all known modules, ordered for address lookup.
///
/// A `m -` record invalidates the whole table; overlapping segments are a
/// diagnostic condition, not an error.
#[derive(Default)]
pub struct ModuleTable {
    ranges: Vec<ModuleRange>,
    paths: Vec<String>,
    dirty: bool,
}

impl ModuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_segment(&mut self, path: &str, module_index: StringIndex, start: u64, end: u64) {
        let path_slot = match self.paths.iter().position(|p| p == path) {
            Some(slot) => slot,
            None => {
                self.paths.push(path.to_owned());
                self.paths.len() - 1
            }
        };
        self.ranges.push(ModuleRange {
            start,
            end,
            module_index,
            path_slot,
        });
        self.dirty = true;
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
        self.paths.clear();
        self.dirty = true;
    }

    fn ensure_sorted(&mut self) {
        if !self.dirty {
            return;
        }
        self.ranges
            .sort_by_key(|range| (range.start, range.end, range.module_index));
        for pair in self.ranges.windows(2) {
            if pair[1].start < pair[0].end {
                tracing::warn!(
                    "overlapping modules: {:x} ({:x}-{:x}) and {:x} ({:x}-{:x})",
                    pair[0].module_index,
                    pair[0].start,
                    pair[0].end,
                    pair[1].module_index,
                    pair[1].start,
                    pair[1].end
                );
            }
        }
        self.dirty = false;
    }

    /// Find the segment containing `ip`. Returns the module's interned
    /// path index, the module path, and the segment-relative offset.
    pub fn find(&mut self, ip: u64) -> Option<(StringIndex, &str, u64)> {
        self.ensure_sorted();
        // first segment whose end is not below ip, then verify containment
        let slot = self.ranges.partition_point(|range| range.end < ip);
        let range = self.ranges.get(slot)?;
        if range.start <= ip && ip <= range.end {
            Some((
                range.module_index,
                &self.paths[range.path_slot],
                ip - range.start,
            ))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_hits_containing_segment() {
        let mut table = ModuleTable::new();
        table.add_segment("/lib/a.so", StringIndex::new(1), 0x1000, 0x2000);
        table.add_segment("/lib/b.so", StringIndex::new(2), 0x3000, 0x4000);

        let (index, path, offset) = table.find(0x1800).unwrap();
        assert_eq!(index, StringIndex::new(1));
        assert_eq!(path, "/lib/a.so");
        assert_eq!(offset, 0x800);

        let (index, _, offset) = table.find(0x3000).unwrap();
        assert_eq!(index, StringIndex::new(2));
        assert_eq!(offset, 0);
    }

    #[test]
    fn test_lookup_misses_gaps() {
        let mut table = ModuleTable::new();
        table.add_segment("/lib/a.so", StringIndex::new(1), 0x1000, 0x2000);
        assert!(table.find(0x2800).is_none());
        assert!(table.find(0x800).is_none());
    }

    #[test]
    fn test_clear_forgets_everything() {
        let mut table = ModuleTable::new();
        table.add_segment("/lib/a.so", StringIndex::new(1), 0x1000, 0x2000);
        table.clear();
        assert!(table.find(0x1800).is_none());
    }

    #[test]
    fn test_unsorted_insertion_order() {
        let mut table = ModuleTable::new();
        table.add_segment("/lib/b.so", StringIndex::new(2), 0x3000, 0x4000);
        table.add_segment("/lib/a.so", StringIndex::new(1), 0x1000, 0x2000);
        assert!(table.find(0x1000).is_some());
        assert!(table.find(0x4000).is_some());
    }
}
