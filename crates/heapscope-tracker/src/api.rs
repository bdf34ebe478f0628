//! Tracker singleton and hook surface.
//!
//! The activation layer (preload or late-attach, not part of this crate)
//! installs interception and forwards every event here. Hooks follow one
//! pattern: if the thread is already inside the tracker, skip; otherwise
//! set the guard, capture the stack, take the writer lock, refresh the
//! module cache if dirty, and emit the record(s).
//!
//! The singleton is initialized exactly once and deliberately leaked when
//! the process exits through `atexit`: globals of the host may already be
//! torn down at that point and a cleanup would crash. An explicit
//! [`stop`] before exit requests full cleanup instead.

use std::cell::RefCell;
use std::io::{self, BufReader, Read};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use heapscope_format::{FILE_FORMAT_VERSION, HEAPSCOPE_VERSION, MANAGED_BOUNDARY_IP};

use crate::guard::RecursionGuard;
use crate::object_graph::ObjectGraph;
use crate::smaps;
use crate::spinlock::Spinlock;
use crate::trace::Trace;
use crate::tree::TraceTree;
use crate::writer::{OutStream, OutputSpec, open_output, record};

/// A module reported by the activation layer's loaded-module walk.
pub struct ModuleInfo {
    pub path: String,
    /// Raw build id bytes; empty when the module has none.
    pub build_id: Vec<u8>,
    pub base: u64,
    /// Loadable segments as `(vaddr, memsz)` relative to `base`.
    pub segments: Vec<(u64, u64)>,
}

/// Walks the process's loaded modules for `m` record dumps.
///
/// The walk itself is platform glue owned by the activation layer; the
/// tracker only decides *when* a fresh dump is needed.
pub trait ModuleLister: Send {
    fn modules(&mut self) -> Vec<ModuleInfo>;
}

/// Lister for hosts without an activation layer (tests, manual use).
pub struct NullModuleLister;

impl ModuleLister for NullModuleLister {
    fn modules(&mut self) -> Vec<ModuleInfo> {
        Vec::new()
    }
}

/// A region handed over by the dlopen/dlclose interception.
pub struct MappedRegion {
    pub ptr: u64,
    pub len: u64,
    pub prot: i32,
    pub is_coreclr: i32,
}

/// Tracker configuration, fixed at initialization.
pub struct TrackerConfig {
    pub output: OutputSpec,
    /// Managed mode: shadow-stack traces only, no native unwind, no smaps.
    pub managed_mode: bool,
    pub smaps_path: PathBuf,
    /// Register atexit and fork hooks. Disabled in tests.
    pub install_process_hooks: bool,
    pub module_lister: Box<dyn ModuleLister>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            output: OutputSpec::from_env(),
            managed_mode: false,
            smaps_path: PathBuf::from("/proc/self/smaps"),
            install_process_hooks: true,
            module_lister: Box::new(NullModuleLister),
        }
    }
}

const TIMER_INTERVAL: Duration = Duration::from_millis(10);
/// Every Nth timer tick also snapshots smaps.
const SMAPS_TICK_DIVISOR: u32 = 32;

static TRACKER: Spinlock<Option<TrackerData>> = Spinlock::new(None);
static MANAGED_MODE: AtomicBool = AtomicBool::new(false);
static AT_EXIT: AtomicBool = AtomicBool::new(false);
static FORCE_CLEANUP: AtomicBool = AtomicBool::new(false);
static PROCESS_HOOKS: Once = Once::new();

thread_local! {
    static TRACE_BUF: RefCell<Trace> = RefCell::new(Trace::new());
}

struct TrackerData {
    out: Option<Box<dyn OutStream>>,
    trace_tree: TraceTree,
    /// dlopen/dlclose-class events set this; the next event that
    /// references an ip re-dumps all modules first, so the interpreter
    /// never sees an ip from an unknown module.
    module_cache_dirty: bool,
    module_lister: Box<dyn ModuleLister>,
    smaps_path: PathBuf,
    managed_mode: bool,
    page_size: u64,
    start: Instant,
    gc_counter: u64,
    object_graph: ObjectGraph,
    stop_timer: Arc<AtomicBool>,
    timer: Option<std::thread::JoinHandle<()>>,
}

impl TrackerData {
    /// A failed write disables the tracker for the rest of the process.
    fn write_error(&mut self) {
        tracing::warn!("write failed, disabling tracker");
        self.out = None;
        self.stop_timer.store(true, Ordering::Release);
    }

    fn emit(&mut self, args: std::fmt::Arguments<'_>) {
        let Some(out) = self.out.as_mut() else {
            return;
        };
        if crate::writer::write_record(&mut **out, args).is_err() {
            self.write_error();
        }
    }

    fn update_module_cache(&mut self) {
        if self.out.is_none() || !self.module_cache_dirty {
            return;
        }
        self.emit(format_args!("m -\n"));
        let modules = self.module_lister.modules();
        for module in modules {
            let mut line = format!("m {} ", module.path);
            if module.build_id.is_empty() {
                line.push_str("--------");
            } else {
                for byte in &module.build_id {
                    line.push_str(&format!("{byte:02x}"));
                }
            }
            line.push_str(&format!(" {:x}", module.base));
            for (vaddr, memsz) in &module.segments {
                line.push_str(&format!(" {vaddr:x} {memsz:x}"));
            }
            line.push('\n');
            self.emit(format_args!("{line}"));
        }
        self.module_cache_dirty = false;
    }

    fn index_trace(&mut self, trace: &Trace) -> u32 {
        let Some(out) = self.out.as_mut() else {
            return 0;
        };
        match self.trace_tree.index(trace, &mut **out) {
            Ok(index) => index,
            Err(_) => {
                self.write_error();
                0
            }
        }
    }

    fn write_timestamp(&mut self) {
        if self.out.is_none() {
            return;
        }
        let elapsed = self.start.elapsed().as_millis() as u64;
        self.emit(format_args!("c {elapsed}\n"));
    }

    fn write_smaps(&mut self) {
        if self.managed_mode || self.out.is_none() {
            return;
        }
        let file = match std::fs::File::open(&self.smaps_path) {
            Ok(file) => file,
            Err(_) => return,
        };
        self.emit(format_args!("K 1\n"));

        let mut reader = BufReader::new(file);
        let mut ranges = Vec::new();
        let total_rss = match smaps::parse(&mut reader, |range| ranges.push(range.clone())) {
            Ok(total) => total,
            Err(_) => {
                self.write_error();
                return;
            }
        };

        for range in &ranges {
            if range.is_heap {
                // attribute the sbrk heap to the sbrk symbol
                let mut trace = Trace::new();
                trace.fill_synthetic(libc::sbrk as usize as u64);
                self.handle_mmap(
                    range.start,
                    range.end - range.start,
                    smaps::PROT_READ | smaps::PROT_WRITE,
                    2,
                    -1,
                    &trace,
                );
            }
            self.emit(format_args!(
                "k {:x} {:x} {:x} {:x} {:x} {:x} {:x} {:x}\n",
                range.start,
                range.end - range.start,
                range.size_kb,
                range.private_dirty_kb,
                range.private_clean_kb,
                range.shared_dirty_kb,
                range.shared_clean_kb,
                range.prot
            ));
        }

        self.emit(format_args!("K 0\n"));
        self.emit(format_args!("R {total_rss:x}\n"));
    }

    fn handle_malloc(&mut self, ptr: u64, size: u64, trace: &Trace) {
        if self.out.is_none() {
            return;
        }
        self.update_module_cache();
        let index = self.index_trace(trace);
        self.emit(format_args!("+ {size:x} {index:x} {ptr:x}\n"));
    }

    fn handle_free(&mut self, ptr: u64) {
        if self.out.is_none() {
            return;
        }
        self.emit(format_args!("- {ptr:x}\n"));
    }

    fn handle_mmap(&mut self, ptr: u64, length: u64, prot: i32, is_coreclr: i32, fd: i32, trace: &Trace) {
        if self.out.is_none() {
            return;
        }
        self.update_module_cache();
        let index = self.index_trace(trace);
        let aligned = length.div_ceil(self.page_size) * self.page_size;
        self.emit(format_args!(
            "* {:x} {:x} {:x} {:x} {:x} {:x}\n",
            aligned, prot as u32, is_coreclr as u32, fd as u32, index, ptr
        ));
    }

    fn handle_munmap(&mut self, ptr: u64, length: u64) {
        if self.out.is_none() {
            return;
        }
        let aligned = length.div_ceil(self.page_size) * self.page_size;
        self.emit(format_args!("/ {aligned:x} {ptr:x}\n"));
    }

    fn handle_object_allocation(&mut self, object_ptr: u64, size: u64, trace: &Trace) {
        if self.out.is_none() {
            return;
        }
        self.update_module_cache();
        let index = self.index_trace(trace);
        self.emit(format_args!("^ {index:x} {size:x} {object_ptr:x}\n"));
    }

    fn handle_start_gc(&mut self) {
        if self.out.is_none() {
            return;
        }
        self.emit(format_args!("G 1\n"));
        self.object_graph.clear();
    }

    fn handle_gc_survived(&mut self, start: u64, length: u64, moved_to: u64) {
        if self.out.is_none() {
            return;
        }
        self.emit(format_args!("L {length:x} {start:x} {moved_to:x}\n"));
    }

    fn handle_finish_gc(&mut self) {
        self.gc_counter += 1;
        if self.out.is_none() {
            return;
        }
        self.emit(format_args!("G 0\n"));
        let gc_num = self.gc_counter;
        let Some(out) = self.out.as_mut() else {
            return;
        };
        let failed = self.object_graph.print(gc_num, &mut **out).is_err();
        self.object_graph.clear();
        if failed {
            self.write_error();
        }
    }

    fn handle_load_class(&mut self, class_id: u64, name: &str) {
        if self.out.is_none() {
            return;
        }
        self.emit(format_args!("n {class_id:x} [{name}]\n"));
        self.emit(format_args!("C {class_id:x}\n"));
        self.trace_tree.mark_name_known(class_id);
    }
}

fn write_header(out: &mut dyn OutStream) -> io::Result<()> {
    record!(out, "v {:x} {:x}\n", HEAPSCOPE_VERSION, FILE_FORMAT_VERSION)?;
    if let Ok(exe) = std::fs::read_link("/proc/self/exe") {
        record!(out, "x {}\n", exe.display())?;
    }
    if let Ok(mut file) = std::fs::File::open("/proc/self/cmdline") {
        let mut raw = Vec::new();
        if file.read_to_end(&mut raw).is_ok() {
            let mut line = String::from("X");
            for arg in raw.split(|b| *b == 0).filter(|a| !a.is_empty()) {
                line.push(' ');
                line.push_str(&String::from_utf8_lossy(arg));
            }
            line.push('\n');
            record!(out, "{}", line)?;
        }
    }
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let phys_pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    record!(out, "I {:x} {:x}\n", page_size as u64, phys_pages as u64)?;
    // name the managed transition marker up front
    record!(out, "n {:x} [Unmanaged->Managed]\n", MANAGED_BOUNDARY_IP)?;
    Ok(())
}

extern "C" fn atexit_handler() {
    if FORCE_CLEANUP.load(Ordering::Acquire) {
        return;
    }
    AT_EXIT.store(true, Ordering::Release);
    stop();
}

extern "C" fn prepare_fork() {
    // no tracking between fork() and the hooks below
    RecursionGuard::block();
}

extern "C" fn parent_fork() {
    RecursionGuard::unblock();
}

extern "C" fn child_fork() {
    // the child must not inherit tracking, or two processes would write
    // into one file; leak the parent's state and stay blocked
    unsafe {
        TRACKER.force_replace_and_leak(None);
    }
}

fn install_process_hooks() {
    PROCESS_HOOKS.call_once(|| unsafe {
        libc::pthread_atfork(Some(prepare_fork), Some(parent_fork), Some(child_fork));
        libc::atexit(atexit_handler);
    });
}

fn spawn_timer(stop: Arc<AtomicBool>) -> Option<std::thread::JoinHandle<()>> {
    // mask all signals so the new thread never handles any; the host may
    // assume a single dedicated signal thread
    let mut fill: libc::sigset_t = unsafe { std::mem::zeroed() };
    let mut previous: libc::sigset_t = unsafe { std::mem::zeroed() };
    unsafe {
        libc::sigfillset(&mut fill);
        if libc::pthread_sigmask(libc::SIG_SETMASK, &fill, &mut previous) != 0 {
            tracing::warn!("failed to block signals, timer thread disabled");
            return None;
        }
    }

    let handle = std::thread::Builder::new()
        .name("heapscope-timer".into())
        .spawn(move || {
            RecursionGuard::block();
            let mut counter = 0u32;
            while !stop.load(Ordering::Acquire) {
                std::thread::sleep(TIMER_INTERVAL);
                let Some(mut slot) = TRACKER.lock_while(|| !stop.load(Ordering::Acquire)) else {
                    break;
                };
                if stop.load(Ordering::Acquire) {
                    break;
                }
                if let Some(data) = slot.as_mut() {
                    counter += 1;
                    if counter == SMAPS_TICK_DIVISOR {
                        data.write_smaps();
                        counter = 0;
                    }
                    data.write_timestamp();
                }
            }
        })
        .ok();

    unsafe {
        if libc::pthread_sigmask(libc::SIG_SETMASK, &previous, std::ptr::null_mut()) != 0 {
            tracing::warn!("failed to restore the signal mask");
        }
    }

    handle
}

/// Initialize the tracker. Idempotent: a second call is a no-op.
pub fn init(config: TrackerConfig) -> bool {
    let _guard = RecursionGuard::new();

    if config.install_process_hooks {
        install_process_hooks();
    }

    {
        let mut slot = TRACKER.lock();
        if slot.is_some() {
            tracing::debug!("tracker already initialized");
            return true;
        }

        let mut out = match open_output(&config.output) {
            Ok(out) => out,
            Err(error) => {
                tracing::warn!("failed to open output: {error}");
                return false;
            }
        };
        if write_header(&mut *out).is_err() {
            return false;
        }

        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let stop_timer = Arc::new(AtomicBool::new(false));
        let timer = spawn_timer(Arc::clone(&stop_timer));

        let mut tree = TraceTree::new();
        tree.mark_name_known(MANAGED_BOUNDARY_IP);

        MANAGED_MODE.store(config.managed_mode, Ordering::Release);
        *slot = Some(TrackerData {
            out: Some(out),
            trace_tree: tree,
            module_cache_dirty: true,
            module_lister: config.module_lister,
            smaps_path: config.smaps_path,
            managed_mode: config.managed_mode,
            page_size: page_size.max(1) as u64,
            start: Instant::now(),
            gc_counter: 0,
            object_graph: ObjectGraph::new(),
            stop_timer,
            timer,
        });
    }

    // baseline smaps snapshot before the first event
    if let Some(data) = TRACKER.lock().as_mut() {
        data.write_smaps();
    }
    true
}

/// Stop tracking. Called explicitly this performs a full cleanup; from the
/// atexit path the tracker data is leaked on purpose.
pub fn stop() {
    let _guard = RecursionGuard::new();
    if !AT_EXIT.load(Ordering::Acquire) {
        FORCE_CLEANUP.store(true, Ordering::Release);
    }

    let mut slot = TRACKER.lock();
    let Some(data) = slot.as_mut() else {
        return;
    };
    data.write_smaps();
    data.write_timestamp();
    if let Some(out) = data.out.as_mut() {
        let _ = out.flush();
    }

    if !AT_EXIT.load(Ordering::Acquire) || FORCE_CLEANUP.load(Ordering::Acquire) {
        let Some(mut data) = slot.take() else {
            return;
        };
        data.stop_timer.store(true, Ordering::Release);
        drop(slot);
        if let Some(handle) = data.timer.take() {
            let _ = handle.join();
        }
    }
    // on the atexit path the data stays in the static, which is never
    // dropped: the tracker keeps recording static deallocations of the
    // host until the process is gone
}

fn with_captured_trace(f: impl FnOnce(&Trace)) {
    TRACE_BUF.with(|buf| {
        let mut trace = buf.borrow_mut();
        if MANAGED_MODE.load(Ordering::Acquire) {
            trace.fill_managed_only();
        } else {
            trace.fill(2);
        }
        f(&trace);
    });
}

/// malloc-class hook.
pub fn on_malloc(ptr: u64, size: u64) {
    if ptr == 0 || RecursionGuard::is_active() {
        return;
    }
    let _guard = RecursionGuard::new();
    with_captured_trace(|trace| {
        if let Some(data) = TRACKER.lock().as_mut() {
            data.handle_malloc(ptr, size, trace);
        }
    });
}

/// free-class hook.
pub fn on_free(ptr: u64) {
    if ptr == 0 || RecursionGuard::is_active() {
        return;
    }
    let _guard = RecursionGuard::new();
    if let Some(data) = TRACKER.lock().as_mut() {
        data.handle_free(ptr);
    }
}

/// realloc hook; the free and the new allocation are atomic with respect
/// to the writer lock.
pub fn on_realloc(ptr_in: u64, size: u64, ptr_out: u64) {
    if ptr_out == 0 || RecursionGuard::is_active() {
        return;
    }
    let _guard = RecursionGuard::new();
    with_captured_trace(|trace| {
        if let Some(data) = TRACKER.lock().as_mut() {
            if ptr_in != 0 {
                data.handle_free(ptr_in);
            }
            data.handle_malloc(ptr_out, size, trace);
        }
    });
}

/// mmap-class hook.
pub fn on_mmap(ptr: u64, length: u64, prot: i32, fd: i32) {
    if ptr == 0 || RecursionGuard::is_active() {
        return;
    }
    let _guard = RecursionGuard::new();
    with_captured_trace(|trace| {
        if let Some(data) = TRACKER.lock().as_mut() {
            data.handle_mmap(ptr, length, prot, 0, fd, trace);
        }
    });
}

/// munmap hook.
pub fn on_munmap(ptr: u64, length: u64) {
    if ptr == 0 || RecursionGuard::is_active() {
        return;
    }
    let _guard = RecursionGuard::new();
    if let Some(data) = TRACKER.lock().as_mut() {
        data.handle_munmap(ptr, length);
    }
}

/// Regions newly mapped by a dlopen-class event. When the interception
/// knows the caller's address it is used for a synthetic attribution
/// trace, otherwise the current stack is captured.
pub fn on_dlopen(regions: &[MappedRegion], dlopen_addr: Option<u64>) {
    if RecursionGuard::is_active() {
        return;
    }
    let _guard = RecursionGuard::new();

    let emit = |trace: &Trace| {
        if let Some(data) = TRACKER.lock().as_mut() {
            for region in regions {
                data.handle_mmap(region.ptr, region.len, region.prot, region.is_coreclr, -2, trace);
            }
        }
    };

    match dlopen_addr {
        Some(addr) => {
            let mut trace = Trace::new();
            trace.fill_synthetic(addr);
            emit(&trace);
        }
        None => with_captured_trace(emit),
    }
}

/// Regions unmapped by a dlclose-class event.
pub fn on_dlclose(unmaps: &[(u64, u64)]) {
    if RecursionGuard::is_active() {
        return;
    }
    let _guard = RecursionGuard::new();
    if let Some(data) = TRACKER.lock().as_mut() {
        for (ptr, length) in unmaps {
            data.handle_munmap(*ptr, *length);
        }
    }
}

/// Managed object allocation callback.
pub fn on_object_allocate(object_ptr: u64, size: u64) {
    if RecursionGuard::is_active() {
        return;
    }
    let _guard = RecursionGuard::new();
    with_captured_trace(|trace| {
        if let Some(data) = TRACKER.lock().as_mut() {
            data.handle_object_allocation(object_ptr, size, trace);
        }
    });
}

/// GC started; clears the per-cycle object graph.
pub fn on_gc_start() {
    if RecursionGuard::is_active() {
        return;
    }
    let _guard = RecursionGuard::new();
    if let Some(data) = TRACKER.lock().as_mut() {
        data.handle_start_gc();
    }
}

/// A range of objects survived the running GC; `moved_to == start` means
/// they stayed in place.
pub fn on_gc_survived_range(start: u64, length: u64, moved_to: u64) {
    if RecursionGuard::is_active() {
        return;
    }
    let _guard = RecursionGuard::new();
    if let Some(data) = TRACKER.lock().as_mut() {
        data.handle_gc_survived(start, length, moved_to);
    }
}

/// GC finished; flushes the object reference graph.
pub fn on_gc_finish() {
    if RecursionGuard::is_active() {
        return;
    }
    let _guard = RecursionGuard::new();
    if let Some(data) = TRACKER.lock().as_mut() {
        data.handle_finish_gc();
    }
}

/// Object reference reported during a GC cycle.
pub fn on_object_reference(parent_ptr: u64, parent_class: u64, child_ptr: u64, child_class: u64) {
    if RecursionGuard::is_active() {
        return;
    }
    let _guard = RecursionGuard::new();
    if let Some(data) = TRACKER.lock().as_mut() {
        data.object_graph.add_edge(parent_ptr, parent_class, child_ptr, child_class);
    }
}

/// GC root reported during a GC cycle.
pub fn on_gc_root(object_ptr: u64, class_id: u64) {
    if RecursionGuard::is_active() {
        return;
    }
    let _guard = RecursionGuard::new();
    if let Some(data) = TRACKER.lock().as_mut() {
        data.object_graph.add_root(object_ptr, class_id);
    }
}

/// Managed class registration.
pub fn on_class_load(class_id: u64, name: &str) {
    if RecursionGuard::is_active() {
        return;
    }
    let _guard = RecursionGuard::new();
    if let Some(data) = TRACKER.lock().as_mut() {
        data.handle_load_class(class_id, name);
    }
}

/// Mark the module cache dirty after a dlopen/dlclose-class event.
pub fn invalidate_module_cache() {
    let _guard = RecursionGuard::new();
    if let Some(data) = TRACKER.lock().as_mut() {
        data.module_cache_dirty = true;
    }
}
