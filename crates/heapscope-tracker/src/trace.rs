//! Per-thread stack snapshot.
//!
//! A capture is two-phase: the native unwinder fills one fixed buffer, then
//! the thread's shadow managed stack is copied behind it. Frames are stored
//! callee first; [`Trace::bottom_up`] iterates caller to callee, which is
//! the order the trace tree consumes.

use heapscope_format::MANAGED_BOUNDARY_IP;

use crate::shadow_stack::{self, ManagedName};

/// Maximum captured frames per half, native and managed each.
pub const MAX_SIZE: usize = 64;

/// A managed frame copied out of the shadow stack.
#[derive(Clone)]
pub struct ManagedFrame {
    pub id: u64,
    pub name: ManagedName,
}

/// One frame as seen by the trace tree, caller side first.
pub enum Frame<'a> {
    /// Pseudo-frame marking the managed-to-native transition.
    Boundary,
    Managed(&'a ManagedFrame),
    Native(u64),
}

/// A fixed-capacity stack capture; safe to build on the hook path.
pub struct Trace {
    native: [u64; MAX_SIZE],
    native_len: usize,
    skip: usize,
    managed: Vec<ManagedFrame>,
    has_boundary: bool,
}

impl Trace {
    pub fn new() -> Self {
        Self {
            native: [0; MAX_SIZE],
            native_len: 0,
            skip: 0,
            managed: Vec::new(),
            has_boundary: false,
        }
    }

    /// Capture the current thread's stack, dropping the innermost
    /// `skip_frames` native frames (the hook machinery itself).
    ///
    /// Returns false if nothing was captured.
    pub fn fill(&mut self, skip_frames: usize) -> bool {
        self.native_len = 0;
        self.skip = skip_frames;
        self.managed.clear();
        self.has_boundary = false;

        backtrace::trace(|frame| {
            if self.native_len == MAX_SIZE {
                return false;
            }
            self.native[self.native_len] = frame.ip() as usize as u64;
            self.native_len += 1;
            true
        });

        // some unwinders report trailing null frames, trim them
        while self.native_len > 0 && self.native[self.native_len - 1] == 0 {
            self.native_len -= 1;
        }

        if shadow_stack::depth() > 0 {
            self.managed.reserve(MAX_SIZE);
            shadow_stack::snapshot(MAX_SIZE, |id, name| {
                self.managed.push(ManagedFrame { id, name });
            });
            self.has_boundary = true;
        }

        self.size() > 0
    }

    /// Capture only the shadow managed stack.
    ///
    /// In managed mode the native side of the stack is runtime plumbing
    /// with no attribution value, so the unwinder is skipped entirely.
    pub fn fill_managed_only(&mut self) -> bool {
        self.native_len = 0;
        self.skip = 0;
        self.managed.clear();
        self.has_boundary = false;

        if shadow_stack::depth() > 0 {
            self.managed.reserve(MAX_SIZE);
            shadow_stack::snapshot(MAX_SIZE, |id, name| {
                self.managed.push(ManagedFrame { id, name });
            });
            self.has_boundary = true;
        }

        self.size() > 0
    }

    /// Synthetic 2-frame trace attributing a region to a single address,
    /// used for the sbrk heap.
    pub fn fill_synthetic(&mut self, addr: u64) {
        self.native = [0; MAX_SIZE];
        self.native[0] = addr;
        self.native[1] = addr;
        self.native_len = 2;
        self.skip = 0;
        self.managed.clear();
        self.has_boundary = false;
    }

    /// Number of frames a consumer will see.
    pub fn size(&self) -> usize {
        let native = self.native_len.saturating_sub(self.skip);
        let managed = self.managed.len() + usize::from(self.has_boundary);
        native + managed
    }

    /// Iterate caller to callee: managed outermost first, the boundary
    /// marker, then native frames outermost first.
    pub fn bottom_up(&self) -> impl Iterator<Item = Frame<'_>> {
        let managed = self.managed.iter().rev().map(Frame::Managed);
        let boundary = self
            .has_boundary
            .then_some(Frame::Boundary)
            .into_iter();
        let native = self.native[self.skip.min(self.native_len)..self.native_len]
            .iter()
            .rev()
            .filter(|ip| **ip != 0)
            .map(|ip| Frame::Native(*ip));
        managed.chain(boundary).chain(native)
    }
}

impl Default for Trace {
    fn default() -> Self {
        Self::new()
    }
}

impl Frame<'_> {
    /// The raw value written to `t` records.
    pub fn ip(&self) -> u64 {
        match self {
            Frame::Boundary => MANAGED_BOUNDARY_IP,
            Frame::Managed(frame) => frame.id,
            Frame::Native(ip) => *ip,
        }
    }

    pub fn is_managed(&self) -> bool {
        matches!(self, Frame::Managed(_))
    }
}
