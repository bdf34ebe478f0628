//! # heapscope tracker
//!
//! The in-process half of the profiler: a library injected into the traced
//! process that records every heap event as a line in the raw stream.
//!
//! ## Design
//!
//! - **Hot path**: interception hands `(ptr, size)` to [`api`]; a
//!   thread-local recursion guard suppresses re-entry, the stack is captured
//!   into a fixed buffer, and the backtrace is interned into a
//!   prefix-compressed tree under the single writer spinlock.
//! - **Single writer**: one process-wide [`writer::OutStream`] guarded by a
//!   CAS spinlock; a record is written whole before the lock is released.
//! - **Managed mode**: the managed runtime's profiling callbacks maintain a
//!   thread-local shadow stack and report object allocations, GC cycles,
//!   survival ranges and object references.
//! - **No errors to the host**: a failed write flips the tracker into a
//!   permanent no-op; nothing ever propagates out of the hook surface.

pub mod api;
pub mod guard;
pub mod object_graph;
pub mod shadow_stack;
pub mod smaps;
pub mod spinlock;
pub mod trace;
pub mod tree;
pub mod writer;

pub use api::ModuleInfo;
pub use guard::RecursionGuard;
pub use trace::Trace;
pub use tree::TraceTree;
pub use writer::{OutStream, OutputSpec};
