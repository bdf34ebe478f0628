//! Subcommand implementations.

use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use heapscope_analyze::views::RowData;
use heapscope_analyze::views::flamegraph::{FlameMetric, to_collapsed_stacks};
use heapscope_analyze::{CostKind, ReadConfig, Stats};
use heapscope_format::open_stream;
use heapscope_interpret::{Interpreter, NullResolver};

/// Run the raw → resolved transform from a file or stdin to stdout.
pub fn interpret(input: Option<&Path>) -> Result<()> {
    let stdout = BufWriter::new(io::stdout().lock());
    let mut interpreter = Interpreter::new(NullResolver, stdout);

    match input {
        Some(path) => {
            let mut stream =
                open_stream(path).with_context(|| format!("failed to open {}", path.display()))?;
            interpreter.run(&mut stream)?;
        }
        None => {
            let stdin = io::stdin();
            let mut lock = stdin.lock();
            interpreter.run(&mut lock)?;
        }
    }

    interpreter.print_stats(io::stderr().lock())?;
    Ok(())
}

pub struct AnalyzeOptions {
    pub input: PathBuf,
    pub cost_kind: CostKind,
    pub hide_unmanaged: bool,
    pub show_coreclr: bool,
    pub diff: Option<PathBuf>,
    pub flamegraph: bool,
    pub flame_metric: FlameMetric,
    pub histogram: bool,
    pub objects: bool,
    pub top: usize,
    pub json: bool,
}

pub fn analyze(options: AnalyzeOptions) -> Result<()> {
    let config = ReadConfig {
        cost_kind: options.cost_kind,
        hide_unmanaged_stack_parts: options.hide_unmanaged,
        show_coreclr: options.show_coreclr,
    };
    let results = heapscope_analyze::parse(&options.input, config, options.diff.as_deref())
        .with_context(|| format!("failed to analyze {}", options.input.display()))?;

    let mut out = BufWriter::new(io::stdout().lock());

    if options.flamegraph {
        for line in to_collapsed_stacks(&results.top_down, options.flame_metric) {
            writeln!(out, "{line}")?;
        }
        return Ok(());
    }

    if options.json {
        let document = serde_json::json!({
            "summary": results.summary,
            "bottomUp": results.bottom_up,
            "topDown": results.top_down,
            "callerCallee": results.caller_callee,
            "histogram": results.histogram,
            "objectTree": results.object_tree,
            "charts": results.charts,
        });
        serde_json::to_writer_pretty(&mut out, &document)?;
        writeln!(out)?;
        return Ok(());
    }

    print_summary(&mut out, &results)?;
    print_top_allocations(&mut out, &results, options.top)?;
    if options.histogram {
        print_histogram(&mut out, &results)?;
    }
    if options.objects {
        print_object_tree(&mut out, &results)?;
    }
    Ok(())
}

fn print_summary(out: &mut dyn Write, results: &heapscope_analyze::ParseResults) -> Result<()> {
    let summary = &results.summary;
    if !summary.debuggee.is_empty() {
        writeln!(out, "debuggee: {}", summary.debuggee)?;
    }
    if summary.from_attached {
        writeln!(out, "attached to already running process")?;
    }
    writeln!(out, "total runtime: {}ms", summary.total_time)?;
    writeln!(out, "allocations: {}", summary.cost.allocations)?;
    writeln!(out, "deallocations: {}", summary.cost.deallocations)?;
    writeln!(out, "temporary allocations: {}", summary.cost.temporary)?;
    writeln!(out, "bytes allocated in total: {}", summary.cost.allocated)?;
    writeln!(
        out,
        "peak memory consumption: {} at {}ms",
        summary.cost.peak, summary.peak_time
    )?;
    writeln!(out, "leaked: {}", summary.cost.leaked)?;
    if summary.peak_rss != 0 {
        writeln!(out, "peak RSS: {}", summary.peak_rss)?;
    }
    writeln!(out)?;
    Ok(())
}

fn print_top_allocations(
    out: &mut dyn Write,
    results: &heapscope_analyze::ParseResults,
    top: usize,
) -> Result<()> {
    let mut rows: Vec<&RowData> = results.bottom_up.iter().collect();
    rows.sort_by_key(|row| std::cmp::Reverse(sort_cost(&row.cost)));

    writeln!(out, "top allocation points:")?;
    for row in rows.iter().take(top) {
        writeln!(
            out,
            "  {} ({}) at {}:{}",
            row.location.function, row.location.module, row.location.file, row.location.line
        )?;
        writeln!(
            out,
            "    allocations: {}, peak: {}, leaked: {}, allocated: {}",
            row.cost.allocations, row.cost.peak, row.cost.leaked, row.cost.allocated
        )?;
    }
    writeln!(out)?;
    Ok(())
}

fn sort_cost(stats: &Stats) -> i64 {
    stats.peak
}

fn print_histogram(out: &mut dyn Write, results: &heapscope_analyze::ParseResults) -> Result<()> {
    writeln!(out, "allocation size histogram:")?;
    for row in &results.histogram {
        writeln!(out, "  {}: {}", row.size_label, row.columns[0].allocations)?;
        for column in row.columns.iter().skip(1) {
            let Some(location) = &column.location else {
                break;
            };
            writeln!(out, "    {}: {}", location.function, column.allocations)?;
        }
    }
    writeln!(out)?;
    Ok(())
}

fn print_object_tree(out: &mut dyn Write, results: &heapscope_analyze::ParseResults) -> Result<()> {
    fn print_rows(
        out: &mut dyn Write,
        rows: &[heapscope_analyze::views::object_tree::ObjectRow],
        depth: usize,
    ) -> Result<()> {
        for row in rows {
            writeln!(
                out,
                "{}{} gc#{} objects: {} allocated: {} referenced: {}",
                "  ".repeat(depth + 1),
                if row.class_name.is_empty() { "<root>" } else { &row.class_name },
                row.gc_num,
                row.allocations,
                row.allocated,
                row.referenced
            )?;
            print_rows(out, &row.children, depth + 1)?;
        }
        Ok(())
    }

    writeln!(out, "managed object types:")?;
    print_rows(out, &results.object_tree, 0)?;
    writeln!(out)?;
    Ok(())
}
