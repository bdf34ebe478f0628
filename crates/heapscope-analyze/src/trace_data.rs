//! The offline accumulator.
//!
//! Reads the resolved stream in up to three passes:
//!
//! 1. **First pass** builds the string/ip/trace/info tables, discovers the
//!    total run time and computes every global peak with its timestamp.
//!    Allocation records are counted but not attributed.
//! 2. **Second pass** re-reads with the known `(peak, peak_time)` pairs;
//!    the moment a peak is re-attained, each allocation's `peak` is
//!    snapshotted from its current `leaked`. This is what makes peak
//!    attribution reproducible: the per-allocation share of a global peak
//!    is only knowable while the peak is being re-attained.
//! 3. **Third pass** re-attributes for a different cost kind on demand.

use std::cmp::Ordering;
use std::io::BufRead;
use std::path::Path;

use thiserror::Error;

use heapscope_format::{
    AllocationIndex, AllocationInfoSet, FILE_FORMAT_VERSION, FileIndex, FunctionIndex, IpIndex,
    LineReader, MANAGED_IP_BIT, ModuleIndex, PointerMap, StringIndex, TraceIndex, open_stream,
};

use crate::allocation_data::{AllocationData, CoreClrType, CostKind, Stats};
use crate::ranges::AddressRangeMap;

/// Accumulator configuration, fixed for the lifetime of one dataset.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadConfig {
    pub cost_kind: CostKind,
    /// Walk past leading unmanaged frames when building traces.
    pub hide_unmanaged_stack_parts: bool,
    /// Classify traces and ranges by CoreCLR origin.
    pub show_coreclr: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Frame {
    pub function_index: FunctionIndex,
    pub file_index: FileIndex,
    pub line: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstructionPointer {
    pub instruction_pointer: u64,
    pub is_managed: bool,
    pub module_index: ModuleIndex,
    pub module_offset: u64,
    pub frame: Frame,
    pub inlined: Vec<Frame>,
}

impl InstructionPointer {
    /// Structural ordering that ignores the raw address; used by the diff
    /// engine to match frames across runs of the same binary.
    pub fn compare_without_address(&self, other: &InstructionPointer) -> Ordering {
        (self.module_index, self.frame).cmp(&(other.module_index, other.frame))
    }

    pub fn equal_without_address(&self, other: &InstructionPointer) -> bool {
        self.compare_without_address(other) == Ordering::Equal
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraceNode {
    pub ip_index: IpIndex,
    pub parent_index: TraceIndex,
    pub coreclr: CoreClrType,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationInfo {
    pub size: u64,
    pub trace_index: TraceIndex,
    pub is_managed: bool,
}

/// Cost accumulated per backtrace.
#[derive(Debug, Clone, Copy, Default)]
pub struct Allocation {
    pub trace_index: TraceIndex,
    pub data: AllocationData,
}

/// One flattened node of the managed object graph, in DFS pre-order.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjectTreeNode {
    pub gc_num: u32,
    pub num_children: u64,
    pub object_ptr: u64,
    pub class_index: StringIndex,
    pub alloc_index: AllocationIndex,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SystemInfo {
    pub pages: i64,
    pub page_size: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsePass {
    First,
    Second,
    Third,
}

/// Per-pass callbacks, the seam the chart builder hangs off of.
pub trait ReadHooks {
    fn handle_time_stamp(&mut self, _data: &AccumulatedTraceData, _old: i64, _new: i64) {}
    fn handle_allocation(
        &mut self,
        _data: &AccumulatedTraceData,
        _info: &AllocationInfo,
        _index: AllocationIndex,
    ) {
    }
    fn handle_debuggee(&mut self, _command: &str) {}
    fn handle_total_cost_update(&mut self, _data: &AccumulatedTraceData) {}
}

/// Hooks that do nothing.
pub struct NoHooks;

impl ReadHooks for NoHooks {}

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("failed to open trace file: {0}")]
    Io(#[from] std::io::Error),
    #[error("file format version {file:#x} is newer than supported {supported:#x}")]
    UnsupportedFormat { file: u32, supported: u32 },
    #[error("heap snapshot data is incomplete: {0}")]
    CorruptObjectGraph(String),
}

const OP_NEW_STRINGS: [&str; 4] = [
    "operator new(unsigned long)",
    "operator new[](unsigned long)",
    "operator new(unsigned int)",
    "operator new[](unsigned int)",
];

const STOP_STRINGS: [&str; 3] = [
    "main",
    "__libc_start_main",
    "__static_initialization_and_destruction_0",
];

/// Everything accumulated from one resolved stream.
pub struct AccumulatedTraceData {
    pub config: ReadConfig,

    pub strings: Vec<String>,
    pub instruction_pointers: Vec<InstructionPointer>,
    pub traces: Vec<TraceNode>,
    pub allocation_infos: Vec<AllocationInfo>,
    pub allocations: Vec<Allocation>,
    pub object_tree_nodes: Vec<ObjectTreeNode>,
    pub address_ranges: AddressRangeMap,

    pub total_cost: AllocationData,
    pub total_time: i64,
    pub malloc_peak_time: i64,
    pub managed_peak_time: i64,
    pub private_clean_peak_time: i64,
    pub private_dirty_peak_time: i64,
    pub shared_peak_time: i64,
    pub peak_rss: i64,
    pub system_info: SystemInfo,
    pub from_attached: bool,

    /// Functions that terminate a backtrace walk (main and friends).
    pub stop_indices: Vec<StringIndex>,
    pub op_new_ip_indices: Vec<IpIndex>,

    /// CoreCLR partition of the displayed malloc cost.
    pub part_coreclr: Stats,
    pub part_non_coreclr: Stats,
    pub part_untracked: Stats,
    pub part_unknown: Stats,
    /// CoreCLR partition of the mapped-memory cost kinds.
    pub part_coreclr_mmap: Stats,
    pub part_non_coreclr_mmap: Stats,
    pub part_untracked_mmap: Stats,
    pub part_unknown_mmap: Stats,

    // new allocations only ever appear with increasing trace indices,
    // which lets findAllocation skip the search for the common case
    max_allocation_trace_index: TraceIndex,
    op_new_str_indices: Vec<StringIndex>,
    file_version: u32,
}

impl Default for AccumulatedTraceData {
    fn default() -> Self {
        Self::new(ReadConfig::default())
    }
}

impl AccumulatedTraceData {
    pub fn new(config: ReadConfig) -> Self {
        Self {
            config,
            strings: Vec::with_capacity(4096),
            instruction_pointers: Vec::with_capacity(16384),
            traces: Vec::with_capacity(65536),
            allocation_infos: Vec::new(),
            allocations: Vec::with_capacity(16384),
            object_tree_nodes: Vec::new(),
            address_ranges: AddressRangeMap::new(),
            total_cost: AllocationData::default(),
            total_time: 0,
            malloc_peak_time: 0,
            managed_peak_time: 0,
            private_clean_peak_time: 0,
            private_dirty_peak_time: 0,
            shared_peak_time: 0,
            peak_rss: 0,
            system_info: SystemInfo::default(),
            from_attached: false,
            stop_indices: Vec::new(),
            op_new_ip_indices: Vec::new(),
            part_coreclr: Stats::default(),
            part_non_coreclr: Stats::default(),
            part_untracked: Stats::default(),
            part_unknown: Stats::default(),
            part_coreclr_mmap: Stats::default(),
            part_non_coreclr_mmap: Stats::default(),
            part_untracked_mmap: Stats::default(),
            part_unknown_mmap: Stats::default(),
            max_allocation_trace_index: TraceIndex::NONE,
            op_new_str_indices: Vec::new(),
            file_version: 0,
        }
    }

    pub fn stringify(&self, index: StringIndex) -> &str {
        index
            .slot(self.strings.len())
            .map(|slot| self.strings[slot].as_str())
            .unwrap_or("")
    }

    pub fn find_ip(&self, index: IpIndex) -> InstructionPointer {
        index
            .slot(self.instruction_pointers.len())
            .map(|slot| self.instruction_pointers[slot].clone())
            .unwrap_or_default()
    }

    pub fn find_trace(&self, index: TraceIndex) -> TraceNode {
        index
            .slot(self.traces.len())
            .map(|slot| self.traces[slot])
            .unwrap_or_default()
    }

    pub fn is_valid_trace(&self, index: TraceIndex) -> bool {
        index.slot(self.traces.len()).is_some()
    }

    /// The trace one frame above the allocation point.
    pub fn find_prev_trace(&self, index: TraceIndex) -> TraceNode {
        self.find_trace(self.find_trace(index).parent_index)
    }

    pub fn is_stop_index(&self, index: StringIndex) -> bool {
        self.stop_indices.contains(&index)
    }

    pub fn peak_time(&self, kind: CostKind) -> i64 {
        match kind {
            CostKind::Malloc => self.malloc_peak_time,
            CostKind::Managed => self.managed_peak_time,
            CostKind::PrivateClean => self.private_clean_peak_time,
            CostKind::PrivateDirty => self.private_dirty_peak_time,
            CostKind::Shared => self.shared_peak_time,
        }
    }

    fn peak_time_mut(&mut self, kind: CostKind) -> &mut i64 {
        match kind {
            CostKind::Malloc => &mut self.malloc_peak_time,
            CostKind::Managed => &mut self.managed_peak_time,
            CostKind::PrivateClean => &mut self.private_clean_peak_time,
            CostKind::PrivateDirty => &mut self.private_dirty_peak_time,
            CostKind::Shared => &mut self.shared_peak_time,
        }
    }

    /// Find or create the cost record for `trace_index`.
    pub fn find_allocation(&mut self, trace_index: TraceIndex) -> &mut Allocation {
        if trace_index < self.max_allocation_trace_index {
            // previously known trace: binary search in the sorted vector
            let slot = self
                .allocations
                .partition_point(|allocation| allocation.trace_index < trace_index);
            if self
                .allocations
                .get(slot)
                .is_none_or(|allocation| allocation.trace_index != trace_index)
            {
                self.allocations.insert(
                    slot,
                    Allocation {
                        trace_index,
                        ..Allocation::default()
                    },
                );
            }
            &mut self.allocations[slot]
        } else {
            if trace_index != self.max_allocation_trace_index || self.allocations.is_empty() {
                self.allocations.push(Allocation {
                    trace_index,
                    ..Allocation::default()
                });
                self.max_allocation_trace_index = trace_index;
            }
            self.allocations.last_mut().expect("just ensured non-empty")
        }
    }

    /// CoreCLR attribution of a single node by its ip's address range.
    pub fn check_is_node_coreclr(&self, ip_index: IpIndex) -> CoreClrType {
        let ip = self.find_ip(ip_index);
        self.address_ranges.classify(ip.instruction_pointer)
    }

    /// Combined attribution of a whole parent chain.
    pub fn check_call_stack_is_coreclr(&self, mut index: TraceIndex) -> CoreClrType {
        let mut combined = CoreClrType::Unknown;
        while self.is_valid_trace(index) {
            let node = self.find_trace(index);
            index = node.parent_index;
            if node.coreclr == CoreClrType::CoreClr {
                return node.coreclr;
            }
            combined = CoreClrType::combine(combined, node.coreclr);
        }
        combined
    }

    /// First and second pass over `path`.
    pub fn read_initial(&mut self, path: &Path, hooks: &mut dyn ReadHooks) -> Result<(), ReadError> {
        self.read_file(path, ParsePass::First, hooks)?;
        self.read_file(path, ParsePass::Second, hooks)
    }

    pub fn read_file(
        &mut self,
        path: &Path,
        pass: ParsePass,
        hooks: &mut dyn ReadHooks,
    ) -> Result<(), ReadError> {
        let mut input = open_stream(path)?;
        self.read(&mut input, pass, hooks)
    }

    pub fn read(
        &mut self,
        input: &mut dyn BufRead,
        pass: ParsePass,
        hooks: &mut dyn ReadHooks,
    ) -> Result<(), ReadError> {
        let mut reader = LineReader::new();
        let mut time_stamp = 0i64;

        let last_peaks = if pass != ParsePass::First {
            [
                (CostKind::Malloc, self.total_cost.malloc.peak, self.malloc_peak_time),
                (CostKind::Managed, self.total_cost.managed.peak, self.managed_peak_time),
                (
                    CostKind::PrivateClean,
                    self.total_cost.private_clean.peak,
                    self.private_clean_peak_time,
                ),
                (
                    CostKind::PrivateDirty,
                    self.total_cost.private_dirty.peak,
                    self.private_dirty_peak_time,
                ),
                (CostKind::Shared, self.total_cost.shared.peak, self.shared_peak_time),
            ]
        } else {
            [
                (CostKind::Malloc, 0, 0),
                (CostKind::Managed, 0, 0),
                (CostKind::PrivateClean, 0, 0),
                (CostKind::PrivateDirty, 0, 0),
                (CostKind::Shared, 0, 0),
            ]
        };
        let last_peak = |kind: CostKind| {
            last_peaks
                .iter()
                .find(|(k, _, _)| *k == kind)
                .map(|(_, peak, time)| (*peak, *time))
                .expect("all kinds present")
        };

        self.max_allocation_trace_index = TraceIndex::NONE;
        self.total_cost = AllocationData::default();
        self.malloc_peak_time = 0;
        self.managed_peak_time = 0;
        self.private_clean_peak_time = 0;
        self.private_dirty_peak_time = 0;
        self.shared_peak_time = 0;
        self.system_info = SystemInfo::default();
        self.peak_rss = 0;
        self.allocations.clear();
        self.address_ranges.clear();
        let mut smaps_chunk_open = false;

        // v0 backwards compatibility: allocation events carried raw
        // pointers, infos and temporaries are reconstructed here
        let mut compat_infos = AllocationInfoSet::new();
        let mut compat_pointers = PointerMap::new();
        // in v0 this holds the raw pointer, from v1 on the info index;
        // either way a native free directly following the native
        // allocation with the same key is a temporary allocation.
        // managed allocations never touch it
        let mut last_allocation_ptr = 0u64;

        while reader.next_line(input)? {
            match reader.tag() {
                b's' => {
                    if pass != ParsePass::First {
                        continue;
                    }
                    self.strings.push(reader.rest().to_owned());
                    let index = StringIndex::new(self.strings.len() as u32);
                    let text = self.strings.last().expect("just pushed");
                    if OP_NEW_STRINGS.contains(&text.as_str()) {
                        self.op_new_str_indices.push(index);
                    } else if STOP_STRINGS.contains(&text.as_str()) {
                        self.stop_indices.push(index);
                    }
                }
                b't' => {
                    if pass != ParsePass::First {
                        continue;
                    }
                    let (Some(ip_index), Some(parent_index)) = (reader.hex(), reader.hex()) else {
                        tracing::warn!("failed to parse line: {}", reader.line());
                        continue;
                    };
                    let node = TraceNode {
                        ip_index: IpIndex::from_hex(ip_index).unwrap_or_default(),
                        parent_index: TraceIndex::from_hex(parent_index).unwrap_or_default(),
                        coreclr: CoreClrType::Unknown,
                    };
                    let node = self.filter_trace(node);
                    self.traces.push(node);
                }
                b'i' => {
                    if pass != ParsePass::First {
                        continue;
                    }
                    let (Some(raw_ip), Some(is_managed), Some(module_index), Some(module_offset)) =
                        (reader.hex(), reader.hex(), reader.hex(), reader.hex())
                    else {
                        tracing::warn!("failed to parse line: {}", reader.line());
                        continue;
                    };
                    let mut ip = InstructionPointer {
                        instruction_pointer: raw_ip & !MANAGED_IP_BIT,
                        is_managed: is_managed != 0,
                        module_index: ModuleIndex::from_hex(module_index).unwrap_or_default(),
                        module_offset,
                        frame: Frame::default(),
                        inlined: Vec::new(),
                    };
                    let mut read_frame = |reader: &mut LineReader| -> Option<Frame> {
                        let function = reader.hex()?;
                        let file = reader.hex()?;
                        let line = reader.hex()?;
                        Some(Frame {
                            function_index: FunctionIndex::from_hex(function).unwrap_or_default(),
                            file_index: FileIndex::from_hex(file).unwrap_or_default(),
                            line: line as i32,
                        })
                    };
                    // a frame may be truncated to just the function
                    if let Some(function) = reader.hex() {
                        ip.frame.function_index =
                            FunctionIndex::from_hex(function).unwrap_or_default();
                        if let Some(file) = reader.hex() {
                            ip.frame.file_index = FileIndex::from_hex(file).unwrap_or_default();
                            ip.frame.line = reader.hex().unwrap_or(0) as i32;
                            while let Some(inlined) = read_frame(&mut reader) {
                                ip.inlined.push(inlined);
                            }
                        }
                    }
                    self.instruction_pointers.push(ip);
                    let function = self
                        .instruction_pointers
                        .last()
                        .expect("just pushed")
                        .frame
                        .function_index;
                    if self
                        .op_new_str_indices
                        .iter()
                        .any(|index| index.0 == function.0)
                    {
                        self.op_new_ip_indices
                            .push(IpIndex::new(self.instruction_pointers.len() as u32));
                    }
                }
                b'*' => {
                    let (Some(length), Some(prot), Some(is_coreclr), Some(fd), Some(trace), Some(ptr)) = (
                        reader.hex(),
                        reader.hex(),
                        reader.hex(),
                        reader.hex(),
                        reader.hex(),
                        reader.hex(),
                    ) else {
                        tracing::warn!("failed to parse line: {}", reader.line());
                        continue;
                    };
                    let trace_index = TraceIndex::from_hex(trace).unwrap_or_default();

                    self.address_ranges.remove(ptr, length);
                    self.address_ranges.update(ptr, length);
                    for info in self.address_ranges.covered_mut(ptr, length) {
                        info.prot = prot as i32;
                        info.fd = fd as u32 as i32;
                        info.is_coreclr = CoreClrType::from_raw(is_coreclr as i32);
                        info.trace_index = trace_index;
                    }
                    self.address_ranges.coalesce_similar();

                    if pass != ParsePass::First {
                        self.find_allocation(trace_index);
                        hooks.handle_total_cost_update(self);
                    }
                }
                b'/' => {
                    let (Some(length), Some(ptr)) = (reader.hex(), reader.hex()) else {
                        tracing::warn!("failed to parse line: {}", reader.line());
                        continue;
                    };
                    self.address_ranges.remove(ptr, length);
                }
                b'K' => {
                    match reader.hex() {
                        Some(1) => {
                            if smaps_chunk_open {
                                tracing::warn!("wrong trace format (nested smaps chunks)");
                                continue;
                            }
                            smaps_chunk_open = true;
                        }
                        Some(0) => {
                            if !smaps_chunk_open {
                                tracing::warn!("wrong trace format (smaps chunk end without start)");
                                continue;
                            }
                            smaps_chunk_open = false;
                            self.finish_smaps_chunk(pass, time_stamp, &last_peak);
                        }
                        _ => {
                            tracing::warn!("failed to parse line: {}", reader.line());
                            continue;
                        }
                    }
                    hooks.handle_total_cost_update(self);
                }
                b'k' => {
                    if !smaps_chunk_open {
                        tracing::warn!("wrong trace format (smaps data outside of smaps chunk)");
                        continue;
                    }
                    let (
                        Some(addr),
                        Some(diff),
                        Some(_size_kb),
                        Some(private_dirty),
                        Some(private_clean),
                        Some(shared_dirty),
                        Some(shared_clean),
                        Some(prot),
                    ) = (
                        reader.hex(),
                        reader.hex(),
                        reader.hex(),
                        reader.hex(),
                        reader.hex(),
                        reader.hex(),
                        reader.hex(),
                        reader.hex(),
                    )
                    else {
                        tracing::warn!("failed to parse line: {}", reader.line());
                        continue;
                    };

                    const KILOBYTE: i64 = 1024;
                    self.address_ranges.update(addr, diff);
                    for info in self.address_ranges.covered_mut(addr, diff) {
                        info.prot = prot as i32;
                        info.set_physical(
                            diff,
                            private_dirty as i64 * KILOBYTE,
                            private_clean as i64 * KILOBYTE,
                            shared_dirty as i64 * KILOBYTE,
                            shared_clean as i64 * KILOBYTE,
                        );
                    }
                }
                b'+' => {
                    if self.config.cost_kind != CostKind::Malloc
                        && self.config.cost_kind != CostKind::Managed
                    {
                        // allocator details only matter for those kinds
                        continue;
                    }

                    let info;
                    let allocation_index;
                    if self.file_version >= 1 {
                        let Some(index) = reader.hex().and_then(AllocationIndex::from_hex) else {
                            tracing::warn!("failed to parse line: {}", reader.line());
                            continue;
                        };
                        let Some(slot) = index.slot(self.allocation_infos.len()) else {
                            tracing::warn!(
                                "allocation index out of bounds: {:x}, maximum is {:x}",
                                index,
                                self.allocation_infos.len()
                            );
                            continue;
                        };
                        info = self.allocation_infos[slot];
                        allocation_index = index;
                        last_allocation_ptr = index.0 as u64;
                    } else {
                        let (Some(size), Some(trace), Some(ptr)) =
                            (reader.hex(), reader.hex(), reader.hex())
                        else {
                            tracing::warn!("failed to parse line: {}", reader.line());
                            continue;
                        };
                        let trace_index = TraceIndex::from_hex(trace).unwrap_or_default();
                        let (index, new_info) = compat_infos.add(size, trace_index, false);
                        if new_info && pass == ParsePass::First {
                            self.allocation_infos.push(AllocationInfo {
                                size,
                                trace_index,
                                is_managed: false,
                            });
                        }
                        info = AllocationInfo {
                            size,
                            trace_index,
                            is_managed: false,
                        };
                        allocation_index = index;
                        compat_pointers.add_pointer(ptr, index);
                        last_allocation_ptr = ptr;
                    }

                    if info.is_managed {
                        tracing::warn!("native allocation resolves to managed info: {}", reader.line());
                        continue;
                    }

                    if pass != ParsePass::First {
                        let allocation = self.find_allocation(info.trace_index);
                        allocation.data.malloc.leaked += info.size as i64;
                        allocation.data.malloc.allocated += info.size as i64;
                        allocation.data.malloc.allocations += 1;

                        hooks.handle_total_cost_update(self);
                        hooks.handle_allocation(self, &info, allocation_index);
                    }

                    self.total_cost.malloc.allocations += 1;
                    self.total_cost.malloc.allocated += info.size as i64;
                    self.total_cost.malloc.leaked += info.size as i64;
                    let (peak, peak_time) = last_peak(CostKind::Malloc);
                    self.update_peak(CostKind::Malloc, pass, time_stamp, peak, peak_time);
                }
                b'-' => {
                    if self.config.cost_kind != CostKind::Malloc {
                        continue;
                    }

                    let allocation_index;
                    let temporary;
                    if self.file_version >= 1 {
                        let Some(index) = reader.hex().and_then(AllocationIndex::from_hex) else {
                            tracing::warn!("failed to parse line: {}", reader.line());
                            continue;
                        };
                        allocation_index = index;
                        temporary = last_allocation_ptr == index.0 as u64;
                    } else {
                        let Some(ptr) = reader.hex() else {
                            tracing::warn!("failed to parse line: {}", reader.line());
                            continue;
                        };
                        match compat_pointers.take_pointer(ptr) {
                            Some(index) => allocation_index = index,
                            // happens when we attached to a running process
                            None => continue,
                        }
                        temporary = last_allocation_ptr == ptr;
                    }
                    last_allocation_ptr = 0;

                    let Some(slot) = allocation_index.slot(self.allocation_infos.len()) else {
                        tracing::warn!(
                            "allocation index out of bounds: {:x}, maximum is {:x}",
                            allocation_index,
                            self.allocation_infos.len()
                        );
                        continue;
                    };
                    let info = self.allocation_infos[slot];
                    if info.is_managed {
                        tracing::warn!("native free resolves to managed info: {}", reader.line());
                        continue;
                    }

                    self.total_cost.malloc.leaked -= info.size as i64;
                    self.total_cost.malloc.deallocations += 1;
                    if temporary {
                        self.total_cost.malloc.temporary += 1;
                    }

                    if pass != ParsePass::First {
                        let allocation = self.find_allocation(info.trace_index);
                        allocation.data.malloc.leaked -= info.size as i64;
                        allocation.data.malloc.deallocations += 1;
                        if temporary {
                            allocation.data.malloc.temporary += 1;
                        }
                    }
                }
                b'^' => {
                    if self.config.cost_kind != CostKind::Malloc
                        && self.config.cost_kind != CostKind::Managed
                    {
                        continue;
                    }

                    let Some(index) = reader.hex().and_then(AllocationIndex::from_hex) else {
                        tracing::warn!("failed to parse line: {}", reader.line());
                        continue;
                    };
                    let Some(slot) = index.slot(self.allocation_infos.len()) else {
                        tracing::warn!(
                            "allocation index out of bounds: {:x}, maximum is {:x}",
                            index,
                            self.allocation_infos.len()
                        );
                        continue;
                    };
                    let info = self.allocation_infos[slot];
                    if !info.is_managed {
                        tracing::warn!("managed allocation resolves to native info: {}", reader.line());
                        continue;
                    }

                    if pass != ParsePass::First {
                        let allocation = self.find_allocation(info.trace_index);
                        allocation.data.managed.leaked += info.size as i64;
                        allocation.data.managed.allocated += info.size as i64;
                        allocation.data.managed.allocations += 1;

                        hooks.handle_total_cost_update(self);
                        hooks.handle_allocation(self, &info, index);
                    }

                    self.total_cost.managed.allocations += 1;
                    self.total_cost.managed.allocated += info.size as i64;
                    self.total_cost.managed.leaked += info.size as i64;
                    let (peak, peak_time) = last_peak(CostKind::Managed);
                    self.update_peak(CostKind::Managed, pass, time_stamp, peak, peak_time);
                }
                b'~' => {
                    if self.config.cost_kind != CostKind::Managed {
                        continue;
                    }

                    let Some(index) = reader.hex().and_then(AllocationIndex::from_hex) else {
                        tracing::warn!("failed to parse line: {}", reader.line());
                        continue;
                    };
                    let Some(slot) = index.slot(self.allocation_infos.len()) else {
                        tracing::warn!(
                            "allocation index out of bounds: {:x}, maximum is {:x}",
                            index,
                            self.allocation_infos.len()
                        );
                        continue;
                    };
                    let info = self.allocation_infos[slot];
                    if !info.is_managed {
                        tracing::warn!("managed free resolves to native info: {}", reader.line());
                        continue;
                    }

                    self.total_cost.managed.leaked -= info.size as i64;
                    self.total_cost.managed.deallocations += 1;

                    if pass != ParsePass::First {
                        let allocation = self.find_allocation(info.trace_index);
                        allocation.data.managed.leaked -= info.size as i64;
                        allocation.data.managed.deallocations += 1;
                    }
                }
                b'a' => {
                    if pass != ParsePass::First {
                        continue;
                    }
                    let (Some(size), Some(trace), Some(is_managed)) =
                        (reader.hex(), reader.hex(), reader.hex())
                    else {
                        tracing::warn!("failed to parse line: {}", reader.line());
                        continue;
                    };
                    self.allocation_infos.push(AllocationInfo {
                        size,
                        trace_index: TraceIndex::from_hex(trace).unwrap_or_default(),
                        is_managed: is_managed != 0,
                    });
                }
                b'e' => {
                    if pass != ParsePass::First {
                        continue;
                    }
                    let (Some(gc_num), Some(num_children), Some(object_ptr), Some(class), Some(alloc)) = (
                        reader.hex(),
                        reader.hex(),
                        reader.hex(),
                        reader.hex(),
                        reader.hex(),
                    ) else {
                        tracing::warn!("failed to parse line: {}", reader.line());
                        continue;
                    };
                    self.object_tree_nodes.push(ObjectTreeNode {
                        gc_num: gc_num as u32,
                        num_children,
                        object_ptr,
                        class_index: StringIndex::from_hex(class).unwrap_or_default(),
                        alloc_index: AllocationIndex::from_hex(alloc).unwrap_or_default(),
                    });
                }
                b'C' => {
                    // class registration, nothing to accumulate
                    continue;
                }
                b'#' => continue,
                b'c' => {
                    let Some(new_stamp) = reader.dec() else {
                        tracing::warn!("failed to read time stamp: {}", reader.line());
                        continue;
                    };
                    if pass != ParsePass::First {
                        hooks.handle_time_stamp(self, time_stamp, new_stamp);
                    }
                    time_stamp = new_stamp;
                }
                b'R' => {
                    let rss = reader.hex().unwrap_or(0) as i64;
                    if rss > self.peak_rss {
                        self.peak_rss = rss;
                    }
                }
                b'X' => {
                    if pass != ParsePass::First {
                        hooks.handle_debuggee(reader.rest());
                    }
                }
                b'A' => {
                    self.total_cost = AllocationData::default();
                    self.from_attached = true;
                }
                b'v' => {
                    let _writer_version = reader.hex().unwrap_or(0);
                    self.file_version = reader.hex().unwrap_or(0) as u32;
                    if self.file_version > FILE_FORMAT_VERSION {
                        return Err(ReadError::UnsupportedFormat {
                            file: self.file_version,
                            supported: FILE_FORMAT_VERSION,
                        });
                    }
                }
                b'I' => {
                    self.system_info.page_size = reader.hex().unwrap_or(0) as i64;
                    self.system_info.pages = reader.hex().unwrap_or(0) as i64;
                }
                _ => {
                    tracing::warn!("failed to parse line: {}", reader.line());
                }
            }
        }

        if pass == ParsePass::First {
            self.total_time = time_stamp + 1;
        } else {
            hooks.handle_time_stamp(self, time_stamp, self.total_time);
        }

        if self.config.show_coreclr {
            self.summarize_coreclr_parts();
        }

        Ok(())
    }

    /// Apply the op-new skip, the hide-unmanaged walk and the CoreCLR
    /// labeling to a freshly read trace node.
    fn filter_trace(&self, mut node: TraceNode) -> TraceNode {
        let mut coreclr = CoreClrType::Unknown;
        if self.config.show_coreclr {
            coreclr = self.check_is_node_coreclr(node.ip_index);
        }

        // allocator entry points at the tip are implementation noise
        while self.op_new_ip_indices.contains(&node.ip_index) {
            node = self.find_trace(node.parent_index);
        }

        if self.config.hide_unmanaged_stack_parts {
            while node.ip_index.is_valid() {
                if self.find_ip(node.ip_index).is_managed {
                    break;
                }
                node = self.find_trace(node.parent_index);
            }
        }

        if self.config.show_coreclr {
            coreclr = CoreClrType::combine(self.check_is_node_coreclr(node.ip_index), coreclr);
            if coreclr != CoreClrType::CoreClr {
                coreclr =
                    CoreClrType::combine(self.check_call_stack_is_coreclr(node.parent_index), coreclr);
            }
            node.coreclr = coreclr;
        }
        node
    }

    fn update_peak(
        &mut self,
        kind: CostKind,
        pass: ParsePass,
        time_stamp: i64,
        last_peak: i64,
        last_peak_time: i64,
    ) {
        let total = *self.total_cost.display(kind);
        if total.leaked <= total.peak {
            return;
        }
        {
            let total = self.total_cost.display_mut(kind);
            total.peak = total.leaked;
            total.peak_instances = total.allocations - total.deallocations;
        }
        *self.peak_time_mut(kind) = time_stamp;

        let confirmed = pass == ParsePass::Second
            && self.total_cost.display(kind).peak == last_peak
            && time_stamp == last_peak_time;
        if confirmed {
            for allocation in &mut self.allocations {
                let stats = allocation.data.display_mut(kind);
                stats.peak = stats.leaked;
                stats.peak_instances = stats.allocations - stats.deallocations;
            }
        }
    }

    /// Close one smaps chunk: recompute the physical-memory totals from
    /// scratch and update the three mapped-cost peaks.
    fn finish_smaps_chunk(
        &mut self,
        pass: ParsePass,
        time_stamp: i64,
        last_peak: &dyn Fn(CostKind) -> (i64, i64),
    ) {
        self.address_ranges.coalesce_similar();

        for kind in [CostKind::PrivateClean, CostKind::PrivateDirty, CostKind::Shared] {
            let total = self.total_cost.display_mut(kind);
            total.leaked = 0;
            total.allocated = 0;
        }
        if pass != ParsePass::First {
            for allocation in &mut self.allocations {
                for kind in [CostKind::PrivateClean, CostKind::PrivateDirty, CostKind::Shared] {
                    let stats = allocation.data.display_mut(kind);
                    stats.leaked = 0;
                    stats.allocated = 0;
                }
            }
        }

        struct RangeCost {
            trace_index: TraceIndex,
            private_clean: i64,
            private_dirty: i64,
            shared: i64,
        }
        let mut range_costs = Vec::with_capacity(self.address_ranges.len());
        for info in self.address_ranges.iter() {
            if !info.physical.is_set {
                tracing::warn!(
                    "unknown range: {:#x} ({:#x} bytes)",
                    info.start,
                    info.size
                );
                continue;
            }
            range_costs.push(RangeCost {
                trace_index: info.trace_index,
                private_clean: info.private_clean(),
                private_dirty: info.private_dirty(),
                shared: info.shared(),
            });
        }

        for range in &range_costs {
            for (kind, value) in [
                (CostKind::PrivateClean, range.private_clean),
                (CostKind::PrivateDirty, range.private_dirty),
                (CostKind::Shared, range.shared),
            ] {
                let total = self.total_cost.display_mut(kind);
                total.allocated += value;
                total.leaked += value;
                let (peak, peak_time) = last_peak(kind);
                self.update_peak(kind, pass, time_stamp, peak, peak_time);
            }

            if pass != ParsePass::First {
                let allocation = self.find_allocation(range.trace_index);
                allocation.data.private_clean.leaked += range.private_clean;
                allocation.data.private_clean.allocated += range.private_clean;
                allocation.data.private_dirty.leaked += range.private_dirty;
                allocation.data.private_dirty.allocated += range.private_dirty;
                allocation.data.shared.leaked += range.shared;
                allocation.data.shared.allocated += range.shared;
            }
        }

        // on the pass where a mapped-cost peak is confirmed, rebuild the
        // CoreCLR partition peaks for the displayed kind
        if self.config.show_coreclr && pass == ParsePass::Second {
            let kind = self.config.cost_kind;
            if matches!(
                kind,
                CostKind::PrivateClean | CostKind::PrivateDirty | CostKind::Shared
            ) {
                let (peak, peak_time) = last_peak(kind);
                if self.total_cost.display(kind).peak == peak && time_stamp == peak_time {
                    self.part_coreclr_mmap.peak = 0;
                    self.part_non_coreclr_mmap.peak = 0;
                    self.part_unknown_mmap.peak = 0;
                    self.part_untracked_mmap.peak = 0;
                    self.calculate_mmap_part_peaks(kind);
                }
            }
        }
    }

    fn calculate_mmap_part_peaks(&mut self, kind: CostKind) {
        struct RangePeak {
            classification: CoreClrType,
            valid_trace: bool,
            value: i64,
        }
        let mut peaks = Vec::with_capacity(self.address_ranges.len());
        for info in self.address_ranges.iter() {
            if !info.physical.is_set {
                continue;
            }
            let value = match kind {
                CostKind::PrivateClean => info.private_clean(),
                CostKind::PrivateDirty => info.private_dirty(),
                CostKind::Shared => info.shared(),
                _ => unreachable!("only mapped cost kinds have range peaks"),
            };
            let valid_trace = self.is_valid_trace(info.trace_index);
            let classification = if valid_trace {
                CoreClrType::combine(self.find_trace(info.trace_index).coreclr, info.is_coreclr)
            } else {
                CoreClrType::Unknown
            };
            peaks.push(RangePeak {
                classification,
                valid_trace,
                value,
            });
        }

        for peak in peaks {
            let bucket = if !peak.valid_trace {
                &mut self.part_unknown_mmap
            } else {
                match peak.classification {
                    CoreClrType::CoreClr => &mut self.part_coreclr_mmap,
                    CoreClrType::NonCoreClr => &mut self.part_non_coreclr_mmap,
                    CoreClrType::Untracked => &mut self.part_untracked_mmap,
                    CoreClrType::Unknown => &mut self.part_unknown_mmap,
                }
            };
            bucket.peak += peak.value;
        }
    }

    /// End-of-read CoreCLR summary for the displayed cost kind.
    fn summarize_coreclr_parts(&mut self) {
        let kind = self.config.cost_kind;
        match kind {
            CostKind::Malloc | CostKind::Managed => {
                let mut coreclr = Stats::default();
                let mut non_coreclr = Stats::default();
                let mut unknown = Stats::default();
                let mut untracked = Stats::default();
                for allocation in &self.allocations {
                    let stats = *allocation.data.display(kind);
                    if !self.is_valid_trace(allocation.trace_index) {
                        unknown += stats;
                        continue;
                    }
                    match self.find_trace(allocation.trace_index).coreclr {
                        CoreClrType::CoreClr => coreclr += stats,
                        CoreClrType::NonCoreClr => non_coreclr += stats,
                        CoreClrType::Untracked => untracked += stats,
                        CoreClrType::Unknown => unknown += stats,
                    }
                }
                self.part_coreclr = coreclr;
                self.part_non_coreclr = non_coreclr;
                self.part_unknown = unknown;
                self.part_untracked = untracked;
            }
            CostKind::PrivateClean | CostKind::PrivateDirty | CostKind::Shared => {
                let mut coreclr = 0i64;
                let mut non_coreclr = 0i64;
                let mut unknown = 0i64;
                let mut untracked = 0i64;
                for info in self.address_ranges.iter() {
                    let value = match kind {
                        CostKind::PrivateClean => info.private_clean(),
                        CostKind::PrivateDirty => info.private_dirty(),
                        CostKind::Shared => info.shared(),
                        _ => unreachable!(),
                    };
                    if !self.is_valid_trace(info.trace_index) {
                        unknown += value;
                        continue;
                    }
                    let combined = CoreClrType::combine(
                        self.find_trace(info.trace_index).coreclr,
                        info.is_coreclr,
                    );
                    match combined {
                        CoreClrType::CoreClr => coreclr += value,
                        CoreClrType::NonCoreClr => non_coreclr += value,
                        CoreClrType::Untracked => untracked += value,
                        CoreClrType::Unknown => unknown += value,
                    }
                }
                self.part_coreclr_mmap.leaked = coreclr;
                self.part_non_coreclr_mmap.leaked = non_coreclr;
                self.part_unknown_mmap.leaked = unknown;
                self.part_untracked_mmap.leaked = untracked;
            }
        }
    }
}
