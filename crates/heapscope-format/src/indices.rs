//! 1-based index newtypes.
//!
//! Every long-lived reference in the stream is an opaque index into an
//! append-only table: strings, modules, instruction pointers, trace nodes,
//! allocation infos, managed classes. `0` is the shared "none" sentinel.

macro_rules! index_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(pub u32);

        impl $name {
            /// The `0` sentinel.
            pub const NONE: Self = Self(0);

            pub fn new(raw: u32) -> Self {
                Self(raw)
            }

            pub fn from_hex(raw: u64) -> Option<Self> {
                u32::try_from(raw).ok().map(Self)
            }

            pub fn is_valid(self) -> bool {
                self.0 != 0
            }

            /// Zero-based slot into a backing table of `len` entries, or
            /// `None` for the sentinel and out-of-bounds indices.
            pub fn slot(self, len: usize) -> Option<usize> {
                if self.0 == 0 || self.0 as usize > len {
                    None
                } else {
                    Some(self.0 as usize - 1)
                }
            }
        }

        impl std::fmt::LowerHex for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                std::fmt::LowerHex::fmt(&self.0, f)
            }
        }
    };
}

index_type!(
    /// Interned UTF-8 string.
    StringIndex
);
index_type!(
    /// Mapped executable or shared object. Aliases the string index of its
    /// path in the resolved stream.
    ModuleIndex
);
index_type!(
    /// Resolved instruction pointer.
    IpIndex
);
index_type!(
    /// Node in the interned backtrace tree.
    TraceIndex
);
index_type!(
    /// Deduplicated `(size, trace, is_managed)` allocation info.
    AllocationIndex
);
index_type!(
    /// Managed class.
    ClassIndex
);
index_type!(
    /// Function name string.
    FunctionIndex
);
index_type!(
    /// Source file name string.
    FileIndex
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_is_invalid() {
        assert!(!TraceIndex::NONE.is_valid());
        assert!(TraceIndex::new(1).is_valid());
    }

    #[test]
    fn test_slot_bounds() {
        assert_eq!(StringIndex::new(0).slot(10), None);
        assert_eq!(StringIndex::new(1).slot(10), Some(0));
        assert_eq!(StringIndex::new(10).slot(10), Some(9));
        assert_eq!(StringIndex::new(11).slot(10), None);
    }

    #[test]
    fn test_from_hex_rejects_oversized() {
        assert_eq!(AllocationIndex::from_hex(u64::MAX), None);
        assert_eq!(AllocationIndex::from_hex(0x1f), Some(AllocationIndex(0x1f)));
    }
}
