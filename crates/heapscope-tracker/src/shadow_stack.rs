//! Thread-local shadow managed stack.
//!
//! The managed runtime's profiling callbacks push on function enter and pop
//! on function leave. Entries are recycled through a per-thread free list so
//! the enter/leave hot path does not hit the allocator once warmed up; the
//! whole structure is torn down by the thread-local destructor on thread
//! exit.

use std::cell::RefCell;
use std::sync::Arc;

/// One managed frame. `Method` frames come from function-enter callbacks,
/// `Class` frames from the class-only allocation callback.
#[derive(Clone)]
pub enum ManagedName {
    Method { class: Arc<str>, method: Arc<str> },
    Class { class: Arc<str> },
}

impl ManagedName {
    /// The display form written to `n` records: `class.method`, or
    /// `[class]` for the class-only shadow-stack form.
    pub fn format(&self) -> String {
        match self {
            ManagedName::Method { class, method } => format!("{class}.{method}"),
            ManagedName::Class { class } => format!("[{class}]"),
        }
    }
}

struct StackEntry {
    func_id: u64,
    name: ManagedName,
    next: Option<Box<StackEntry>>,
}

struct ShadowStack {
    top: Option<Box<StackEntry>>,
    free: Option<Box<StackEntry>>,
    depth: usize,
}

impl ShadowStack {
    const fn new() -> Self {
        Self {
            top: None,
            free: None,
            depth: 0,
        }
    }

    fn push(&mut self, func_id: u64, name: ManagedName) {
        let mut entry = match self.free.take() {
            Some(mut recycled) => {
                self.free = recycled.next.take();
                recycled.func_id = func_id;
                recycled.name = name;
                recycled
            }
            None => Box::new(StackEntry {
                func_id,
                name,
                next: None,
            }),
        };
        entry.next = self.top.take();
        self.top = Some(entry);
        self.depth += 1;
    }

    fn pop(&mut self) {
        if let Some(mut entry) = self.top.take() {
            self.top = entry.next.take();
            entry.next = self.free.take();
            self.free = Some(entry);
            self.depth -= 1;
        }
    }
}

thread_local! {
    static SHADOW: RefCell<ShadowStack> = const { RefCell::new(ShadowStack::new()) };
}

/// Function-enter callback: push `class.method`.
pub fn push_method(func_id: u64, class: Arc<str>, method: Arc<str>) {
    SHADOW.with(|s| s.borrow_mut().push(func_id, ManagedName::Method { class, method }));
}

/// Allocation-site callback that only knows the class: push `[class]`.
pub fn push_class(class_id: u64, class: Arc<str>) {
    SHADOW.with(|s| s.borrow_mut().push(class_id, ManagedName::Class { class }));
}

/// Function-leave callback.
pub fn pop() {
    SHADOW.with(|s| s.borrow_mut().pop());
}

/// Current depth of this thread's managed stack.
pub fn depth() -> usize {
    SHADOW.with(|s| s.borrow().depth)
}

/// Snapshot up to `max` frames, innermost first, into `out` via `visit`.
///
/// Only `Arc` clones happen here, no heap allocation.
pub fn snapshot(max: usize, mut visit: impl FnMut(u64, ManagedName)) -> usize {
    SHADOW.with(|s| {
        let stack = s.borrow();
        let mut taken = 0;
        let mut cursor = stack.top.as_deref();
        while let Some(entry) = cursor {
            if taken == max {
                break;
            }
            visit(entry.func_id, entry.name.clone());
            taken += 1;
            cursor = entry.next.as_deref();
        }
        taken
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arc(s: &str) -> Arc<str> {
        Arc::from(s)
    }

    #[test]
    fn test_push_pop_order() {
        push_method(1, arc("App"), arc("Main"));
        push_method(2, arc("App"), arc("Work"));
        push_class(3, arc("Buffer"));

        let mut seen = Vec::new();
        snapshot(64, |id, name| seen.push((id, name.format())));
        assert_eq!(
            seen,
            vec![
                (3, "[Buffer]".to_owned()),
                (2, "App.Work".to_owned()),
                (1, "App.Main".to_owned()),
            ]
        );

        pop();
        pop();
        pop();
        assert_eq!(depth(), 0);
    }

    #[test]
    fn test_snapshot_respects_limit() {
        for i in 0..10 {
            push_method(i, arc("C"), arc("m"));
        }
        let mut count = 0;
        snapshot(4, |_, _| count += 1);
        assert_eq!(count, 4);
        for _ in 0..10 {
            pop();
        }
    }

    #[test]
    fn test_pop_on_empty_is_noop() {
        pop();
        assert_eq!(depth(), 0);
    }
}
