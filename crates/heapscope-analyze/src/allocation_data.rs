//! Cost model.
//!
//! Every allocation and the process total carry one [`Stats`] block per
//! cost kind: heap allocator traffic, managed object traffic, and the
//! three smaps-derived physical memory kinds.

use std::ops::{Add, AddAssign, Sub, SubAssign};

use serde::Serialize;

/// Which cost kind a view displays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum CostKind {
    #[default]
    Malloc,
    Managed,
    PrivateClean,
    PrivateDirty,
    Shared,
}

/// CoreCLR attribution of a trace or mapped range.
///
/// Combination order when merging: CoreCLR > untracked > nonCoreCLR >
/// unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum CoreClrType {
    #[default]
    Unknown,
    CoreClr,
    NonCoreClr,
    Untracked,
}

impl CoreClrType {
    pub fn combine(a: CoreClrType, b: CoreClrType) -> CoreClrType {
        use CoreClrType::*;
        if a == CoreClr || b == CoreClr {
            CoreClr
        } else if a == Untracked || b == Untracked {
            Untracked
        } else if a == NonCoreClr || b == NonCoreClr {
            NonCoreClr
        } else {
            Unknown
        }
    }

    /// Mapping from the `*` record's `is_coreclr` field.
    pub fn from_raw(raw: i32) -> CoreClrType {
        match raw {
            0 => CoreClrType::NonCoreClr,
            1 => CoreClrType::CoreClr,
            2 => CoreClrType::Untracked,
            _ => CoreClrType::Unknown,
        }
    }
}

/// Counters for one cost kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub allocations: i64,
    pub deallocations: i64,
    /// `allocations - deallocations` at the moment the peak was attained.
    pub peak_instances: i64,
    pub temporary: i64,
    pub allocated: i64,
    pub leaked: i64,
    pub peak: i64,
}

impl Stats {
    pub fn is_empty(&self) -> bool {
        self.allocations == 0
            && self.deallocations == 0
            && self.temporary == 0
            && self.allocated == 0
            && self.leaked == 0
            && self.peak == 0
    }
}

impl AddAssign for Stats {
    fn add_assign(&mut self, rhs: Stats) {
        self.allocations += rhs.allocations;
        self.deallocations += rhs.deallocations;
        self.peak_instances += rhs.peak_instances;
        self.temporary += rhs.temporary;
        self.allocated += rhs.allocated;
        self.leaked += rhs.leaked;
        self.peak += rhs.peak;
    }
}

impl SubAssign for Stats {
    fn sub_assign(&mut self, rhs: Stats) {
        self.allocations -= rhs.allocations;
        self.deallocations -= rhs.deallocations;
        self.peak_instances -= rhs.peak_instances;
        self.temporary -= rhs.temporary;
        self.allocated -= rhs.allocated;
        self.leaked -= rhs.leaked;
        self.peak -= rhs.peak;
    }
}

impl Add for Stats {
    type Output = Stats;

    fn add(mut self, rhs: Stats) -> Stats {
        self += rhs;
        self
    }
}

impl Sub for Stats {
    type Output = Stats;

    fn sub(mut self, rhs: Stats) -> Stats {
        self -= rhs;
        self
    }
}

/// The full per-entity cost bundle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AllocationData {
    pub malloc: Stats,
    pub managed: Stats,
    pub private_clean: Stats,
    pub private_dirty: Stats,
    pub shared: Stats,
}

impl AllocationData {
    pub fn display(&self, kind: CostKind) -> &Stats {
        match kind {
            CostKind::Malloc => &self.malloc,
            CostKind::Managed => &self.managed,
            CostKind::PrivateClean => &self.private_clean,
            CostKind::PrivateDirty => &self.private_dirty,
            CostKind::Shared => &self.shared,
        }
    }

    pub fn display_mut(&mut self, kind: CostKind) -> &mut Stats {
        match kind {
            CostKind::Malloc => &mut self.malloc,
            CostKind::Managed => &mut self.managed,
            CostKind::PrivateClean => &mut self.private_clean,
            CostKind::PrivateDirty => &mut self.private_dirty,
            CostKind::Shared => &mut self.shared,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.malloc.is_empty()
            && self.managed.is_empty()
            && self.private_clean.is_empty()
            && self.private_dirty.is_empty()
            && self.shared.is_empty()
    }
}

impl AddAssign for AllocationData {
    fn add_assign(&mut self, rhs: AllocationData) {
        self.malloc += rhs.malloc;
        self.managed += rhs.managed;
        self.private_clean += rhs.private_clean;
        self.private_dirty += rhs.private_dirty;
        self.shared += rhs.shared;
    }
}

impl SubAssign for AllocationData {
    fn sub_assign(&mut self, rhs: AllocationData) {
        self.malloc -= rhs.malloc;
        self.managed -= rhs.managed;
        self.private_clean -= rhs.private_clean;
        self.private_dirty -= rhs.private_dirty;
        self.shared -= rhs.shared;
    }
}
