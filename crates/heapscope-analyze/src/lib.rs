//! # heapscope analyzer
//!
//! Offline accumulation of a resolved heapscope stream into attributable
//! costs, plus the derived views a frontend consumes.
//!
//! ## Design
//!
//! - **Multi-pass reader**: totals and peaks first, per-allocation peak
//!   attribution on a confirming second pass, chart series on a third.
//! - **Address-range map**: ordered partition of the mapped regions with
//!   smaps-derived physical memory prorated over the records.
//! - **Diff engine**: structural trace matching that survives address
//!   space layout changes between runs.
//! - **Views**: bottom-up/top-down/caller-callee trees, size histogram,
//!   chart series, flame-graph input, managed object type trees.

pub mod allocation_data;
pub mod diff;
pub mod parser;
pub mod ranges;
pub mod trace_data;
pub mod views;

pub use allocation_data::{AllocationData, CoreClrType, CostKind, Stats};
pub use parser::{Charts, ParseResults, Summary, parse};
pub use ranges::{AddressRangeInfo, AddressRangeMap};
pub use trace_data::{
    AccumulatedTraceData, Allocation, AllocationInfo, NoHooks, ParsePass, ReadConfig, ReadError,
    ReadHooks,
};
