use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::filter::EnvFilter;

use heapscope_analyze::CostKind;
use heapscope_analyze::views::flamegraph::FlameMetric;

mod commands;

#[derive(Parser)]
#[command(name = "heapscope", version, about = "Allocation and heap-behavior profiler")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum CostKindArg {
    Malloc,
    Managed,
    PrivateClean,
    PrivateDirty,
    Shared,
}

impl From<CostKindArg> for CostKind {
    fn from(arg: CostKindArg) -> CostKind {
        match arg {
            CostKindArg::Malloc => CostKind::Malloc,
            CostKindArg::Managed => CostKind::Managed,
            CostKindArg::PrivateClean => CostKind::PrivateClean,
            CostKindArg::PrivateDirty => CostKind::PrivateDirty,
            CostKindArg::Shared => CostKind::Shared,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum FlameMetricArg {
    Allocations,
    Allocated,
    Leaked,
    Peak,
    Temporary,
}

impl From<FlameMetricArg> for FlameMetric {
    fn from(arg: FlameMetricArg) -> FlameMetric {
        match arg {
            FlameMetricArg::Allocations => FlameMetric::Allocations,
            FlameMetricArg::Allocated => FlameMetric::Allocated,
            FlameMetricArg::Leaked => FlameMetric::Leaked,
            FlameMetricArg::Peak => FlameMetric::Peak,
            FlameMetricArg::Temporary => FlameMetric::Temporary,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a raw trace stream into the analyzable format.
    ///
    /// Reads the raw stream from FILE (or stdin) and writes the resolved
    /// stream to stdout. Shutdown statistics go to stderr.
    Interpret {
        /// Raw trace file; stdin when omitted.
        input: Option<PathBuf>,
    },
    /// Accumulate a resolved trace and print the requested views.
    Analyze {
        /// Resolved trace file, plain or gzip-compressed.
        input: PathBuf,
        /// Cost kind to attribute and display.
        #[arg(long, value_enum, default_value = "malloc")]
        cost_kind: CostKindArg,
        /// Walk past leading unmanaged frames.
        #[arg(long)]
        hide_unmanaged: bool,
        /// Classify costs by CoreCLR origin.
        #[arg(long)]
        show_coreclr: bool,
        /// Subtract a base trace before reporting.
        #[arg(long)]
        diff: Option<PathBuf>,
        /// Print flame-graph input (collapsed stacks) instead of tables.
        #[arg(long)]
        flamegraph: bool,
        /// Metric used for the flame graph.
        #[arg(long, value_enum, default_value = "peak")]
        flame_metric: FlameMetricArg,
        /// Print the allocation size histogram.
        #[arg(long)]
        histogram: bool,
        /// Print the managed object type tree.
        #[arg(long)]
        objects: bool,
        /// Number of entries in the top-cost lists.
        #[arg(long, default_value_t = 10)]
        top: usize,
        /// Emit everything as JSON.
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Interpret { input } => commands::interpret(input.as_deref()),
        Commands::Analyze {
            input,
            cost_kind,
            hide_unmanaged,
            show_coreclr,
            diff,
            flamegraph,
            flame_metric,
            histogram,
            objects,
            top,
            json,
        } => commands::analyze(commands::AnalyzeOptions {
            input,
            cost_kind: cost_kind.into(),
            hide_unmanaged,
            show_coreclr,
            diff,
            flamegraph,
            flame_metric: flame_metric.into(),
            histogram,
            objects,
            top,
            json,
        }),
    }
}
