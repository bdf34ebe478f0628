//! End-to-end parse orchestration.
//!
//! Mirrors what a frontend needs: run the two accumulation passes,
//! optionally subtract a diff base, build the independent views in
//! parallel, then run the third pass for the chart series.

use std::path::Path;

use serde::Serialize;

use crate::allocation_data::{CostKind, Stats};
use crate::trace_data::{
    AccumulatedTraceData, AllocationInfo, ParsePass, ReadConfig, ReadError, ReadHooks,
};
use crate::views::charts::{ChartBuilder, ChartData};
use crate::views::histogram::{CountedAllocationInfo, HistogramRow, build_size_histogram};
use crate::views::object_tree::{ObjectRow, build_object_tree};
use crate::views::tree::{CallerCalleeRow, merge_allocations, to_caller_callee, to_top_down};
use crate::views::RowData;

/// Headline numbers of one parsed dataset.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Summary {
    pub debuggee: String,
    pub cost: Stats,
    pub total_time: i64,
    pub peak_time: i64,
    pub peak_rss: i64,
    pub total_system_memory: i64,
    pub from_attached: bool,
    pub part_coreclr: Stats,
    pub part_non_coreclr: Stats,
    pub part_untracked: Stats,
    pub part_unknown: Stats,
}

/// All five chart series.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Charts {
    pub consumed: ChartData,
    pub instances: ChartData,
    pub allocations: ChartData,
    pub allocated: ChartData,
    pub temporary: ChartData,
}

/// The parsed dataset plus every derived view.
pub struct ParseResults {
    pub data: AccumulatedTraceData,
    pub summary: Summary,
    pub diff_mode: bool,
    pub bottom_up: Vec<RowData>,
    pub top_down: Vec<RowData>,
    pub caller_callee: Vec<CallerCalleeRow>,
    pub histogram: Vec<HistogramRow>,
    pub object_tree: Vec<ObjectRow>,
    pub charts: Charts,
}

/// Second-pass hooks: collects the per-info hit counts for the size
/// histogram and the debuggee command line.
#[derive(Default)]
struct CollectorHooks {
    counted: Vec<CountedAllocationInfo>,
    debuggee: String,
}

impl ReadHooks for CollectorHooks {
    fn handle_allocation(
        &mut self,
        _data: &AccumulatedTraceData,
        info: &AllocationInfo,
        index: heapscope_format::AllocationIndex,
    ) {
        let slot = index.0 as usize;
        if slot == 0 {
            return;
        }
        if slot - 1 == self.counted.len() {
            self.counted.push(CountedAllocationInfo {
                info: *info,
                allocations: 1,
            });
        } else if let Some(entry) = self.counted.get_mut(slot - 1) {
            entry.allocations += 1;
        }
    }

    fn handle_debuggee(&mut self, command: &str) {
        self.debuggee = command.to_owned();
    }
}

/// Parse `path`, optionally diffing against `diff_base`, and build all
/// views.
pub fn parse(
    path: &Path,
    config: ReadConfig,
    diff_base: Option<&Path>,
) -> Result<ParseResults, ReadError> {
    let mut hooks = CollectorHooks::default();
    let mut data = AccumulatedTraceData::new(config);
    data.read_file(path, ParsePass::First, &mut hooks)?;
    data.read_file(path, ParsePass::Second, &mut hooks)?;

    let diff_mode = match diff_base {
        Some(base_path) => {
            let mut base = AccumulatedTraceData::new(config);
            let mut base_hooks = CollectorHooks::default();
            base.read_file(base_path, ParsePass::First, &mut base_hooks)?;
            base.read_file(base_path, ParsePass::Second, &mut base_hooks)?;
            data.diff(&base);
            true
        }
        None => false,
    };

    let bottom_up = merge_allocations(&data, true);

    // the views only read the dataset, build them concurrently
    let counted = std::mem::take(&mut hooks.counted);
    let (top_down, (caller_callee, (histogram, object_tree))) = rayon::join(
        || to_top_down(&bottom_up),
        || {
            rayon::join(
                || to_caller_callee(&bottom_up, diff_mode),
                || {
                    rayon::join(
                        || build_size_histogram(&data, counted),
                        || build_object_tree(&data),
                    )
                },
            )
        },
    );
    let object_tree = object_tree?;

    // third pass: chart series over the known peaks
    let mut charts = Charts::default();
    if !diff_mode {
        let mut builder = ChartBuilder::new();
        builder.prepare(&data);
        data.read_file(path, ParsePass::Third, &mut builder)?;
        charts = Charts {
            consumed: builder.consumed,
            instances: builder.instances,
            allocations: builder.allocations,
            allocated: builder.allocated,
            temporary: builder.temporary,
        };
    }

    let summary = summarize(&data, &hooks.debuggee);

    Ok(ParseResults {
        summary,
        diff_mode,
        bottom_up,
        top_down,
        caller_callee,
        histogram,
        object_tree,
        charts,
        data,
    })
}

fn summarize(data: &AccumulatedTraceData, debuggee: &str) -> Summary {
    let kind = data.config.cost_kind;
    let mapped_kind = matches!(
        kind,
        CostKind::PrivateClean | CostKind::PrivateDirty | CostKind::Shared
    );
    Summary {
        debuggee: debuggee.to_owned(),
        cost: *data.total_cost.display(kind),
        total_time: data.total_time,
        peak_time: data.peak_time(kind),
        peak_rss: data.peak_rss * 1024,
        total_system_memory: data.system_info.pages * data.system_info.page_size,
        from_attached: data.from_attached,
        part_coreclr: if mapped_kind { data.part_coreclr_mmap } else { data.part_coreclr },
        part_non_coreclr: if mapped_kind {
            data.part_non_coreclr_mmap
        } else {
            data.part_non_coreclr
        },
        part_untracked: if mapped_kind {
            data.part_untracked_mmap
        } else {
            data.part_untracked
        },
        part_unknown: if mapped_kind { data.part_unknown_mmap } else { data.part_unknown },
    }
}
