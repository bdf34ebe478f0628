//! Prefix-interned backtrace tree.
//!
//! Top-down tree of instruction pointers: each node's path from the root is
//! one backtrace prefix, caller at the parent, callee at the child. Indexing
//! a capture walks from the root, binary-searching each node's children, and
//! lazily emits a `t` record per previously unseen edge, so the stream only
//! ever carries new suffixes.

use std::io;

use rustc_hash::FxHashSet;

use crate::trace::{Frame, Trace};
use crate::writer::{OutStream, record};

struct TraceEdge {
    ip: u64,
    /// Index of the backtrace ending at this ip; the reader walks parent
    /// links to rebuild the stack bottom-up.
    index: u32,
    /// Sorted by ip, assumed small.
    children: Vec<TraceEdge>,
}

/// Memory-efficient store of every backtrace encountered so far.
pub struct TraceTree {
    root: TraceEdge,
    next_index: u32,
    known_names: FxHashSet<u64>,
}

impl TraceTree {
    pub fn new() -> Self {
        Self {
            root: TraceEdge {
                ip: 0,
                index: 0,
                children: Vec::new(),
            },
            next_index: 1,
            known_names: FxHashSet::default(),
        }
    }

    pub fn clear(&mut self) {
        self.root.children.clear();
        self.next_index = 1;
    }

    /// Mark a managed id as already named so `index` will not emit an `n`
    /// record for it (class ids are named by their `C` registration).
    pub fn mark_name_known(&mut self, id: u64) {
        self.known_names.insert(id);
    }

    /// Intern `trace` and return the index of its deepest frame.
    ///
    /// New edges are written to `out` as they are created; managed frames
    /// whose id has no name yet emit `n <id> <name>` first.
    pub fn index(&mut self, trace: &Trace, out: &mut dyn OutStream) -> io::Result<u32> {
        let mut index = 0u32;
        let mut parent = &mut self.root;

        for frame in trace.bottom_up() {
            let ip = frame.ip();
            if ip == 0 {
                continue;
            }

            if let Frame::Managed(managed) = &frame {
                if self.known_names.insert(managed.id) {
                    record!(out, "n {:x} {}\n", managed.id, managed.name.format())?;
                }
            }

            let slot = match parent.children.binary_search_by(|edge| edge.ip.cmp(&ip)) {
                Ok(found) => found,
                Err(insert_at) => {
                    let new_index = self.next_index;
                    self.next_index += 1;
                    record!(
                        out,
                        "t {:x} {:x} {:x}\n",
                        ip,
                        parent.index,
                        u32::from(frame.is_managed())
                    )?;
                    parent.children.insert(
                        insert_at,
                        TraceEdge {
                            ip,
                            index: new_index,
                            children: Vec::new(),
                        },
                    );
                    insert_at
                }
            };
            parent = &mut parent.children[slot];
            index = parent.index;
        }

        Ok(index)
    }
}

impl Default for TraceTree {
    fn default() -> Self {
        Self::new()
    }
}
