//! # heapscope interpreter
//!
//! Stream transform from the tracker's raw format to the resolved format
//! the analyzer consumes. Raw instruction pointers become interned ip
//! indices with module attribution, raw pointers become deduplicated
//! allocation-info indices, and managed GC survival ranges are replayed so
//! that every managed death is an explicit `~` record.
//!
//! Symbolication itself (DWARF, symbol tables, demangling) lives behind
//! the [`resolver::Resolver`] seam; the default implementation attributes
//! an address to its module and offset only.

pub mod interpret;
pub mod resolver;

pub use interpret::{InterpretError, InterpretStats, Interpreter};
pub use resolver::{AddressInfo, Frame, ModuleTable, NullResolver, Resolver};
