//! # heapscope stream format
//!
//! Plumbing shared by every stage of the pipeline: the tracker writes the
//! raw event stream, the interpreter rewrites it into the resolved stream,
//! and the analyzer consumes the resolved stream. All three agree on the
//! record grammar, the file format version, and the 1-based index spaces
//! defined here.
//!
//! ## Record grammar
//!
//! One record per line. The first byte is the tag, fields are separated by
//! single spaces and encoded as lower-case hex unless noted (`c` timestamps
//! are decimal milliseconds). Indices are 1-based; `0` is the "none"
//! sentinel everywhere.

pub mod indices;
pub mod linereader;
pub mod pointermap;
pub mod stream;

pub use indices::{
    AllocationIndex, ClassIndex, FileIndex, FunctionIndex, IpIndex, ModuleIndex, StringIndex,
    TraceIndex,
};
pub use linereader::LineReader;
pub use pointermap::{AllocationInfoSet, PointerMap};
pub use stream::open_stream;

/// Version of the profiler that wrote a stream, `(major << 16) | (minor << 8) | patch`.
pub const HEAPSCOPE_VERSION: u32 = (VERSION_MAJOR << 16) | (VERSION_MINOR << 8) | VERSION_PATCH;

const VERSION_MAJOR: u32 = 1;
const VERSION_MINOR: u32 = 1;
const VERSION_PATCH: u32 = 0;

/// Stream format version. Readers reject anything newer.
///
/// v1 switched `+`/`-`/`^`/`~` from raw pointers to allocation-info
/// indices; v2 added the mmap/smaps records and the managed object graph.
pub const FILE_FORMAT_VERSION: u32 = 2;

/// Pseudo instruction pointer marking the unmanaged-to-managed boundary in
/// captured stacks.
pub const MANAGED_BOUNDARY_IP: u64 = u64::MAX;

/// High bit tagging managed pseudo-IPs in the resolved stream's IP space.
pub const MANAGED_IP_BIT: u64 = 1 << 63;
