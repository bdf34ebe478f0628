//! The raw → resolved transform.

use std::collections::BTreeSet;
use std::io::{self, BufRead, Write};

use rustc_hash::FxHashMap;
use thiserror::Error;

use heapscope_format::{
    AllocationInfoSet, IpIndex, LineReader, MANAGED_IP_BIT, PointerMap, StringIndex, TraceIndex,
};

use crate::resolver::{ModuleTable, Resolver};

#[derive(Debug, Error)]
pub enum InterpretError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// Module and trace records assign implicit indices by their position
    /// in the stream; losing one would silently shift every later index,
    /// so these are not skippable.
    #[error("unrecoverable parse error in line: {0}")]
    CorruptIndexRecord(String),
}

/// Counters reported to stderr on shutdown.
///
/// Signed: frees of pointers allocated before a late attach can push the
/// leak counters below zero.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InterpretStats {
    pub allocations: i64,
    pub leaked_allocations: i64,
    pub managed_allocations: i64,
    pub leaked_managed_allocations: i64,
    pub temporary_allocations: i64,
}

/// Streaming interpreter; owns all interning tables.
pub struct Interpreter<R, W> {
    resolver: R,
    out: W,
    modules: ModuleTable,
    exe: String,
    strings: FxHashMap<String, StringIndex>,
    encountered_ips: FxHashMap<u64, IpIndex>,
    encountered_classes: FxHashMap<u64, StringIndex>,
    managed_names: FxHashMap<u64, String>,
    name_uses: FxHashMap<String, u32>,
    allocation_infos: AllocationInfoSet,
    ptr_to_index: PointerMap,
    managed_ptrs: BTreeSet<u64>,
    gc_managed_ptrs: BTreeSet<u64>,
    in_gc: bool,
    /// Pointer of the most recent allocation; a free of exactly this
    /// pointer with no allocation in between is a temporary allocation.
    last_ptr: u64,
    stats: InterpretStats,
}

impl<R: Resolver, W: Write> Interpreter<R, W> {
    pub fn new(resolver: R, out: W) -> Self {
        Self {
            resolver,
            out,
            modules: ModuleTable::new(),
            exe: String::new(),
            strings: FxHashMap::default(),
            encountered_ips: FxHashMap::default(),
            encountered_classes: FxHashMap::default(),
            managed_names: FxHashMap::default(),
            name_uses: FxHashMap::default(),
            allocation_infos: AllocationInfoSet::new(),
            ptr_to_index: PointerMap::new(),
            managed_ptrs: BTreeSet::new(),
            gc_managed_ptrs: BTreeSet::new(),
            in_gc: false,
            last_ptr: 0,
            stats: InterpretStats::default(),
        }
    }

    /// Consume the raw stream and write the resolved stream.
    pub fn run(&mut self, input: &mut dyn BufRead) -> Result<InterpretStats, InterpretError> {
        let mut reader = LineReader::new();
        while reader.next_line(input)? {
            match reader.tag() {
                b'x' => {
                    self.exe = reader.rest().to_owned();
                }
                b'm' => self.handle_module(&mut reader)?,
                b't' => self.handle_trace_edge(&mut reader)?,
                b'+' => self.handle_alloc(&mut reader)?,
                b'-' => self.handle_free(&mut reader)?,
                b'^' => self.handle_managed_alloc(&mut reader)?,
                b'G' => self.handle_gc_boundary(&mut reader)?,
                b'L' => self.handle_survival_range(&mut reader)?,
                b'n' => self.handle_name(&mut reader),
                b'e' => self.handle_object_edge(&mut reader)?,
                b'C' => self.handle_class(&mut reader)?,
                _ => {
                    // header, timestamps, smaps and map records pass through
                    writeln!(self.out, "{}", reader.line())?;
                }
            }
        }
        self.out.flush()?;
        Ok(self.stats)
    }

    /// The collected statistics so far.
    pub fn stats(&self) -> InterpretStats {
        self.stats
    }

    /// Consume the interpreter and hand back the output sink.
    pub fn into_output(self) -> W {
        self.out
    }

    fn intern(&mut self, text: &str) -> Result<StringIndex, InterpretError> {
        if text.is_empty() {
            return Ok(StringIndex::NONE);
        }
        if let Some(index) = self.strings.get(text) {
            return Ok(*index);
        }
        let index = StringIndex::new(self.strings.len() as u32 + 1);
        self.strings.insert(text.to_owned(), index);
        writeln!(self.out, "s {text}")?;
        Ok(index)
    }

    fn handle_module(&mut self, reader: &mut LineReader) -> Result<(), InterpretError> {
        let corrupt = |reader: &LineReader| InterpretError::CorruptIndexRecord(reader.line().to_owned());

        let Some(file_name) = reader.word() else {
            return Err(corrupt(reader));
        };
        if file_name == "-" {
            self.modules.clear();
            return Ok(());
        }
        let Some(_build_id) = reader.word() else {
            return Err(corrupt(reader));
        };
        let Some(base) = reader.hex() else {
            return Err(corrupt(reader));
        };

        // "x" stands for the traced executable itself
        let path = if file_name == "x" {
            self.exe.clone()
        } else {
            file_name
        };
        let module_index = self.intern(&path)?;

        while let Some(vaddr) = reader.hex() {
            let Some(memsz) = reader.hex() else {
                return Err(corrupt(reader));
            };
            self.modules
                .add_segment(&path, module_index, base + vaddr, base + vaddr + memsz);
        }
        Ok(())
    }

    /// Intern one raw instruction pointer, emitting its `i` record on
    /// first encounter.
    fn add_ip(&mut self, ip: u64, is_managed: bool) -> Result<IpIndex, InterpretError> {
        if ip == 0 {
            return Ok(IpIndex::NONE);
        }
        if let Some(index) = self.encountered_ips.get(&ip) {
            return Ok(*index);
        }
        let index = IpIndex::new(self.encountered_ips.len() as u32 + 1);
        self.encountered_ips.insert(ip, index);

        if is_managed {
            let name = self.managed_names.get(&ip).cloned().unwrap_or_default();
            let function = self.intern(&name)?;
            writeln!(self.out, "i {:x} 1 0 0 {:x}", MANAGED_IP_BIT | ip, function)?;
        } else {
            let found = self
                .modules
                .find(ip)
                .map(|(module_index, path, offset)| (module_index, path.to_owned(), offset));
            match found {
                Some((module_index, path, offset)) => {
                    let info = self.resolver.resolve(&path, offset, ip);
                    // intern everything first: string records must not
                    // interleave with the i record being composed
                    let function = self.intern(&info.frame.function)?;
                    let file = self.intern(&info.frame.file)?;
                    let mut inlined = Vec::with_capacity(info.inlined.len());
                    for frame in &info.inlined {
                        inlined.push((self.intern(&frame.function)?, self.intern(&frame.file)?, frame.line));
                    }

                    write!(self.out, "i {ip:x} 0 {module_index:x} {offset:x}")?;
                    if function.is_valid() || file.is_valid() {
                        write!(self.out, " {function:x}")?;
                        if file.is_valid() {
                            write!(self.out, " {:x} {:x}", file, info.frame.line)?;
                            for (function, file, line) in &inlined {
                                write!(self.out, " {:x} {:x} {:x}", function, file, line)?;
                            }
                        }
                    }
                    writeln!(self.out)?;
                }
                None => {
                    writeln!(self.out, "i {ip:x} 0 0 0")?;
                }
            }
        }
        Ok(index)
    }

    fn handle_trace_edge(&mut self, reader: &mut LineReader) -> Result<(), InterpretError> {
        let (Some(ip), Some(parent), Some(is_managed)) = (reader.hex(), reader.hex(), reader.hex())
        else {
            return Err(InterpretError::CorruptIndexRecord(reader.line().to_owned()));
        };
        let ip_index = self.add_ip(ip, is_managed != 0)?;
        writeln!(self.out, "t {ip_index:x} {parent:x}")?;
        Ok(())
    }

    fn handle_alloc(&mut self, reader: &mut LineReader) -> Result<(), InterpretError> {
        let (Some(size), Some(trace), Some(ptr)) = (reader.hex(), reader.hex(), reader.hex())
        else {
            tracing::warn!("failed to parse line: {}", reader.line());
            return Ok(());
        };
        let Some(trace) = TraceIndex::from_hex(trace) else {
            tracing::warn!("failed to parse line: {}", reader.line());
            return Ok(());
        };

        self.stats.allocations += 1;
        self.stats.leaked_allocations += 1;

        let (index, new_info) = self.allocation_infos.add(size, trace, false);
        if new_info {
            writeln!(self.out, "a {size:x} {trace:x} 0")?;
        }
        self.ptr_to_index.add_pointer(ptr, index);
        self.last_ptr = ptr;
        writeln!(self.out, "+ {index:x}")?;
        Ok(())
    }

    fn handle_free(&mut self, reader: &mut LineReader) -> Result<(), InterpretError> {
        let Some(ptr) = reader.hex() else {
            tracing::warn!("failed to parse line: {}", reader.line());
            return Ok(());
        };
        // a free does not reset the key: only another allocation breaks
        // the temporariness of the most recent one
        let temporary = self.last_ptr == ptr;
        let Some(index) = self.ptr_to_index.take_pointer(ptr) else {
            // free of an unknown pointer happens when attached late
            return Ok(());
        };
        let was_managed = self.managed_ptrs.remove(&ptr);
        writeln!(self.out, "- {index:x}")?;
        if temporary {
            self.stats.temporary_allocations += 1;
        }
        if was_managed {
            self.stats.leaked_managed_allocations -= 1;
        } else {
            self.stats.leaked_allocations -= 1;
        }
        Ok(())
    }

    fn handle_managed_alloc(&mut self, reader: &mut LineReader) -> Result<(), InterpretError> {
        if self.in_gc {
            tracing::warn!(
                "wrong trace format (allocation during GC; concurrent GC is assumed off while profiling)"
            );
            return Ok(());
        }
        let (Some(trace), Some(size), Some(ptr)) = (reader.hex(), reader.hex(), reader.hex())
        else {
            tracing::warn!("failed to parse line: {}", reader.line());
            return Ok(());
        };
        let Some(trace) = TraceIndex::from_hex(trace) else {
            tracing::warn!("failed to parse line: {}", reader.line());
            return Ok(());
        };

        self.stats.managed_allocations += 1;
        self.stats.leaked_managed_allocations += 1;

        let (index, new_info) = self.allocation_infos.add(size, trace, true);
        if new_info {
            writeln!(self.out, "a {size:x} {trace:x} 1")?;
        }
        self.ptr_to_index.add_pointer(ptr, index);
        self.managed_ptrs.insert(ptr);
        self.last_ptr = ptr;
        writeln!(self.out, "^ {index:x}")?;
        Ok(())
    }

    fn handle_gc_boundary(&mut self, reader: &mut LineReader) -> Result<(), InterpretError> {
        let start = match reader.hex() {
            Some(0) => false,
            Some(1) => true,
            _ => {
                tracing::warn!("failed to parse line: {}", reader.line());
                return Ok(());
            }
        };

        if start {
            if self.in_gc {
                tracing::warn!("wrong trace format (nested GC chunks)");
                return Ok(());
            }
            self.in_gc = true;
            debug_assert!(self.gc_managed_ptrs.is_empty());
            return Ok(());
        }

        if !self.in_gc {
            tracing::warn!("wrong trace format (GC chunk end without start)");
            return Ok(());
        }
        self.in_gc = false;

        // everything still in the pre-GC set did not survive
        for ptr in std::mem::take(&mut self.managed_ptrs) {
            let Some(index) = self.ptr_to_index.take_pointer(ptr) else {
                tracing::warn!("wrong trace format (unknown managed pointer) {ptr:#x}");
                continue;
            };
            writeln!(self.out, "~ {index:x}")?;
            self.stats.leaked_managed_allocations -= 1;
        }
        self.managed_ptrs = std::mem::take(&mut self.gc_managed_ptrs);
        Ok(())
    }

    fn handle_survival_range(&mut self, reader: &mut LineReader) -> Result<(), InterpretError> {
        if !self.in_gc {
            tracing::warn!("wrong trace format (range survival event when no GC is running)");
            return Ok(());
        }
        let (Some(length), Some(start), Some(moved_to)) = (reader.hex(), reader.hex(), reader.hex())
        else {
            tracing::warn!("failed to parse line: {}", reader.line());
            return Ok(());
        };

        let target_start = if moved_to != 0 { moved_to } else { start };
        let target_end = target_start + length;

        // survival ranges must not overlap within one GC cycle
        if self
            .gc_managed_ptrs
            .range(target_start..target_end)
            .next()
            .is_some()
        {
            tracing::warn!("wrong trace format (survival ranges intersect during a GC session)");
            return Ok(());
        }

        let sources: Vec<u64> = self
            .managed_ptrs
            .range(start..start + length)
            .copied()
            .collect();

        if target_start == start {
            self.gc_managed_ptrs.extend(sources.iter().copied());
        } else {
            for source in &sources {
                let target = target_start + (source - start);

                // a stale survivor already at the target address is dead
                if let Some(existing) = self.ptr_to_index.take_pointer(target) {
                    if self.managed_ptrs.remove(&target) {
                        writeln!(self.out, "~ {existing:x}")?;
                        self.stats.leaked_managed_allocations -= 1;
                    }
                }
                self.gc_managed_ptrs.insert(target);

                match self.ptr_to_index.take_pointer(*source) {
                    Some(index) => self.ptr_to_index.add_pointer(target, index),
                    None => {
                        tracing::warn!("wrong trace format (survived pointer unknown) {source:#x}")
                    }
                }
            }
        }
        for source in &sources {
            self.managed_ptrs.remove(source);
        }
        Ok(())
    }

    fn handle_name(&mut self, reader: &mut LineReader) {
        let Some(ip) = reader.hex() else {
            tracing::warn!("failed to parse line: {}", reader.line());
            return;
        };
        let name = reader.rest().trim_start();
        if name.is_empty() {
            tracing::warn!("failed to parse line: {}", reader.line());
            return;
        }

        // identical names from distinct ids get a ~N suffix to stay
        // distinguishable after interning
        let uses = self.name_uses.entry(name.to_owned()).or_insert(0);
        *uses += 1;
        let unique = if *uses == 1 {
            name.to_owned()
        } else {
            format!("{name}~{uses}")
        };
        self.managed_names.insert(ip, unique);
    }

    /// Intern a managed class, emitting its `C` registration on first use.
    fn add_class(&mut self, class_ptr: u64) -> Result<StringIndex, InterpretError> {
        if class_ptr == 0 {
            return Ok(StringIndex::NONE);
        }
        if let Some(index) = self.encountered_classes.get(&class_ptr) {
            return Ok(*index);
        }
        let name = self.managed_names.get(&class_ptr).cloned().unwrap_or_default();
        let index = self.intern(&name)?;
        self.encountered_classes.insert(class_ptr, index);
        if index.is_valid() {
            writeln!(self.out, "C {index:x}")?;
        }
        Ok(index)
    }

    fn handle_class(&mut self, reader: &mut LineReader) -> Result<(), InterpretError> {
        let Some(class_ptr) = reader.hex() else {
            tracing::warn!("failed to parse line: {}", reader.line());
            return Ok(());
        };
        self.add_class(class_ptr)?;
        Ok(())
    }

    fn handle_object_edge(&mut self, reader: &mut LineReader) -> Result<(), InterpretError> {
        let (Some(gc_num), Some(children), Some(object_ptr), Some(class_ptr)) =
            (reader.hex(), reader.hex(), reader.hex(), reader.hex())
        else {
            tracing::warn!("failed to parse line: {}", reader.line());
            return Ok(());
        };

        let class_index = self.add_class(class_ptr)?;
        if !class_index.is_valid() && class_ptr != 0 {
            tracing::warn!("unknown class id ({class_ptr:#x}) here: {}", reader.line());
            return Ok(());
        }

        let allocation = match self.ptr_to_index.peek_pointer(object_ptr) {
            Some(index) => index,
            None => {
                if object_ptr != 0 {
                    tracing::warn!("unknown object id ({object_ptr:#x}) here: {}", reader.line());
                }
                heapscope_format::AllocationIndex::NONE
            }
        };
        writeln!(
            self.out,
            "e {gc_num:x} {children:x} {object_ptr:x} {class_index:x} {allocation:x}"
        )?;
        Ok(())
    }

    /// Print shutdown statistics the way the CLI reports them.
    pub fn print_stats(&self, mut sink: impl Write) -> io::Result<()> {
        let stats = &self.stats;
        writeln!(sink, "heapscope stats:")?;
        writeln!(sink, "\tallocations:\t\t\t{}", stats.allocations)?;
        writeln!(sink, "\tleaked allocations:\t\t{}", stats.leaked_allocations)?;
        writeln!(sink, "\tmanaged allocations:\t\t{}", stats.managed_allocations)?;
        writeln!(
            sink,
            "\tmanaged leaked allocations:\t{}",
            stats.leaked_managed_allocations
        )?;
        writeln!(sink, "\ttemporary allocations:\t\t{}", stats.temporary_allocations)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::NullResolver;
    use std::io::Cursor;

    fn interpret(raw: &str) -> (String, InterpretStats) {
        let mut interpreter = Interpreter::new(NullResolver, Vec::new());
        let stats = interpreter
            .run(&mut Cursor::new(raw.as_bytes().to_vec()))
            .unwrap();
        let out = String::from_utf8(interpreter.into_output()).unwrap();
        (out, stats)
    }

    #[test]
    fn test_simple_alloc_free() {
        let (out, stats) = interpret("+ 20 1 100\n- 100\n");
        assert!(out.contains("a 20 1 0\n"));
        assert!(out.contains("+ 1\n"));
        assert!(out.contains("- 1\n"));
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.leaked_allocations, 0);
        assert_eq!(stats.temporary_allocations, 1);
    }

    #[test]
    fn test_temporary_needs_adjacency() {
        // free(A) has malloc(B) in between, only free(B) is temporary
        let (_, stats) = interpret("+ a 1 100\n+ a 1 200\n- 100\n- 200\n");
        assert_eq!(stats.temporary_allocations, 1);
        assert_eq!(stats.leaked_allocations, 0);
    }

    #[test]
    fn test_allocation_info_dedup() {
        let (out, _) = interpret("+ 20 1 100\n- 100\n+ 20 1 300\n");
        // one a record, two + records with the same info index
        assert_eq!(out.matches("a 20 1 0\n").count(), 1);
        assert_eq!(out.matches("+ 1\n").count(), 2);
    }

    #[test]
    fn test_trace_edges_intern_ips() {
        let (out, _) = interpret("t dead 0 0\nt beef 1 0\nt dead 1 0\n");
        assert!(out.contains("i dead 0 0 0\n"));
        assert!(out.contains("i beef 0 0 0\n"));
        assert_eq!(out.matches("i dead").count(), 1);
        assert!(out.contains("t 1 0\n"));
        assert!(out.contains("t 2 1\n"));
        // the third edge reuses the interned ip index
        assert!(out.contains("t 1 1\n"));
    }

    #[test]
    fn test_module_attribution() {
        let raw = "m /lib/libfoo.so -------- 1000 0 2000\nt 1800 0 0\n";
        let (out, _) = interpret(raw);
        assert!(out.contains("s /lib/libfoo.so\n"));
        // module string index 1, offset 0x800
        assert!(out.contains("i 1800 0 1 800\n"));
    }

    #[test]
    fn test_module_cache_invalidation() {
        let raw = "m /lib/libfoo.so -------- 1000 0 2000\nm -\nt 1800 0 0\n";
        let (out, _) = interpret(raw);
        assert!(out.contains("i 1800 0 0 0\n"));
    }

    #[test]
    fn test_managed_ip_gets_high_bit_and_name() {
        let raw = "n 2a App.Main\nt 2a 0 1\n";
        let (out, _) = interpret(raw);
        assert!(out.contains("s App.Main\n"));
        assert!(out.contains(&format!("i {:x} 1 0 0 1\n", MANAGED_IP_BIT | 0x2a)));
    }

    #[test]
    fn test_duplicate_managed_names_uniquified() {
        let raw = "n 1 App.Run\nn 2 App.Run\nt 1 0 1\nt 2 0 1\n";
        let (out, _) = interpret(raw);
        assert!(out.contains("s App.Run\n"));
        assert!(out.contains("s App.Run~2\n"));
    }

    #[test]
    fn test_gc_kills_non_survivors() {
        // two managed allocations, only one survives in place
        let raw = "\
^ 1 10 1000
^ 1 10 2000
G 1
L 10 1000 1000
G 0
";
        let (out, stats) = interpret(raw);
        assert_eq!(stats.managed_allocations, 2);
        assert_eq!(stats.leaked_managed_allocations, 1);
        // the non-survivor at 0x2000 was reported dead
        assert!(out.contains("~ 2\n"));
        assert!(!out.contains("~ 1\n"));
    }

    #[test]
    fn test_gc_compaction_preserves_identity() {
        // two pointers compact to 0x2000.., one stays in place
        let raw = "\
^ 1 8 1000
^ 1 8 1008
^ 2 8 1010
G 1
L 10 1000 2000
L 8 1010 1010
G 0
- 2000
- 2008
- 1010
";
        let (out, stats) = interpret(raw);
        // no managed allocation died in the GC
        assert!(!out.contains('~'));
        // all three freed at their post-GC addresses resolve to infos
        assert_eq!(out.matches("- 1\n").count(), 2);
        assert_eq!(out.matches("- 2\n").count(), 1);
        assert_eq!(stats.leaked_managed_allocations, 0);
    }

    #[test]
    fn test_allocation_during_gc_is_skipped() {
        let raw = "G 1\n^ 1 10 1000\nG 0\n";
        let (out, stats) = interpret(raw);
        assert_eq!(stats.managed_allocations, 0);
        assert!(!out.contains("^"));
    }

    #[test]
    fn test_object_edges_annotated() {
        let raw = "\
n 500 [Node]
C 500
^ 1 10 1000
G 1
e 1 0 1000 500
G 0
";
        let (out, _) = interpret(raw);
        assert!(out.contains("s [Node]\n"));
        assert!(out.contains("C 1\n"));
        // object at 0x1000 resolves to allocation info 1, class string 1
        assert!(out.contains("e 1 0 1000 1 1\n"));
    }

    #[test]
    fn test_passthrough_of_header_records() {
        let raw = "v 10100 2\nI 1000 3e8\nc 42\nR 100\nA\n# comment\n";
        let (out, _) = interpret(raw);
        for line in raw.lines() {
            assert!(out.contains(line), "missing passthrough: {line}");
        }
    }

    #[test]
    fn test_corrupt_trace_record_is_fatal() {
        let mut interpreter = Interpreter::new(NullResolver, Vec::new());
        let result = interpreter.run(&mut Cursor::new(b"t zz 0\n".to_vec()));
        assert!(matches!(result, Err(InterpretError::CorruptIndexRecord(_))));
    }
}
