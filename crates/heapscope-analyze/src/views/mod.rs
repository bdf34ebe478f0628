//! Aggregated views over an accumulated dataset.
//!
//! Everything here is derived data: the bottom-up tree is built straight
//! from the allocations, and the top-down and caller-callee views are
//! folds over the bottom-up rows. The views are independent of each other
//! and safe to build in parallel.

pub mod charts;
pub mod flamegraph;
pub mod histogram;
pub mod object_tree;
pub mod tree;

use serde::Serialize;

use heapscope_format::StringIndex;

use crate::allocation_data::Stats;
use crate::trace_data::{AccumulatedTraceData, Frame, InstructionPointer};

/// A resolved source location, the row key of every tree view.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Location {
    pub function: String,
    pub file: String,
    pub line: i32,
    pub module: String,
}

/// Label used when an allocation carries no backtrace at all.
pub const UNTRACKED_FUNCTION: &str = "<untracked>";
/// Label used when symbolication had nothing for the frame.
pub const UNRESOLVED_FUNCTION: &str = "<unresolved function>";

fn function_name(data: &AccumulatedTraceData, frame: &Frame, untracked: bool) -> String {
    if frame.function_index.is_valid() {
        data.stringify(StringIndex::new(frame.function_index.0)).to_owned()
    } else if untracked {
        UNTRACKED_FUNCTION.to_owned()
    } else {
        UNRESOLVED_FUNCTION.to_owned()
    }
}

fn module_name(data: &AccumulatedTraceData, ip: &InstructionPointer) -> String {
    let name = data.stringify(StringIndex::new(ip.module_index.0));
    if ip.module_offset != 0 {
        format!("{name}+0x{:x}", ip.module_offset)
    } else {
        name.to_owned()
    }
}

/// Location of an ip's primary frame.
pub fn location_for(data: &AccumulatedTraceData, ip: &InstructionPointer, untracked: bool) -> Location {
    frame_location(data, &ip.frame, ip, untracked)
}

/// Location of one (possibly inlined) frame, attributed to `ip`'s module.
pub fn frame_location(
    data: &AccumulatedTraceData,
    frame: &Frame,
    ip: &InstructionPointer,
    untracked: bool,
) -> Location {
    Location {
        function: function_name(data, frame, untracked),
        file: data.stringify(StringIndex::new(frame.file_index.0)).to_owned(),
        line: frame.line,
        module: module_name(data, ip),
    }
}

/// One row of a tree view; children of a bottom-up row are its callers,
/// children of a top-down row its callees.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RowData {
    pub cost: Stats,
    pub location: Location,
    pub children: Vec<RowData>,
}

impl Stats {
    /// Cost equality as the tree folds use it: `peak_instances` is a
    /// derived moment-in-time value and deliberately excluded.
    pub fn same_costs(&self, other: &Stats) -> bool {
        self.allocations == other.allocations
            && self.deallocations == other.deallocations
            && self.temporary == other.temporary
            && self.allocated == other.allocated
            && self.leaked == other.leaked
            && self.peak == other.peak
    }
}
