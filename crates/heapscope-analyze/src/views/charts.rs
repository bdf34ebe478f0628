//! Time-series chart construction.
//!
//! Runs as the third-pass hooks: after the peaks are known, the stream is
//! re-read and a row is appended per sampled timestamp, carrying the total
//! in column 0 and the top hotspots in the remaining columns.

use rustc_hash::FxHashMap;
use serde::Serialize;

use heapscope_format::IpIndex;

use crate::trace_data::{AccumulatedTraceData, ReadHooks};
use crate::views::location_for;

/// Chart resolution; one run produces at most this many rows per series.
pub const MAX_CHART_DATAPOINTS: i64 = 500;

/// Cost columns per row: total plus the top hotspots.
pub const MAX_NUM_COST: usize = 20;

#[derive(Debug, Clone, Serialize)]
pub struct ChartRows {
    pub time_stamp: i64,
    pub cost: [i64; MAX_NUM_COST],
}

impl Default for ChartRows {
    fn default() -> Self {
        Self {
            time_stamp: 0,
            cost: [0; MAX_NUM_COST],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChartData {
    pub rows: Vec<ChartRows>,
    /// Column label per cost slot; slot 0 is the total.
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
struct LabelIds {
    consumed: i32,
    instances: i32,
    allocations: i32,
    allocated: i32,
    temporary: i32,
}

impl Default for LabelIds {
    fn default() -> Self {
        Self {
            consumed: -1,
            instances: -1,
            allocations: -1,
            allocated: -1,
            temporary: -1,
        }
    }
}

struct ChartMergeData {
    ip: IpIndex,
    untracked: bool,
    consumed: i64,
    instances: i64,
    allocations: i64,
    allocated: i64,
    temporary: i64,
}

/// Builds the five chart series during the third pass.
#[derive(Default)]
pub struct ChartBuilder {
    pub consumed: ChartData,
    pub instances: ChartData,
    pub allocations: ChartData,
    pub allocated: ChartData,
    pub temporary: ChartData,

    label_ids: FxHashMap<IpIndex, LabelIds>,
    max_consumed_since_last_time_stamp: i64,
    max_instances_since_last_time_stamp: i64,
    last_time_stamp: i64,
    enabled: bool,
}

impl ChartBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick the top hotspots from the fully attributed allocations and
    /// label the chart columns. Must run after the second pass.
    pub fn prepare(&mut self, data: &AccumulatedTraceData) {
        for series in [
            &mut self.consumed,
            &mut self.instances,
            &mut self.allocations,
            &mut self.allocated,
            &mut self.temporary,
        ] {
            series.rows.reserve(MAX_CHART_DATAPOINTS as usize);
            // null row at the origin; label 0 is the total column
            series.rows.push(ChartRows::default());
            series.labels = vec!["total".to_owned()];
        }

        let kind = data.config.cost_kind;
        let mut merged: Vec<ChartMergeData> = Vec::with_capacity(data.allocations.len());
        // merge the cost by the instruction pointer above the tip
        for allocation in &data.allocations {
            let ip = data.find_prev_trace(allocation.trace_index).ip_index;
            let untracked = !allocation.trace_index.is_valid();
            let stats = allocation.data.display(kind);
            let slot = merged.partition_point(|entry| entry.ip < ip);
            if merged.get(slot).is_none_or(|entry| entry.ip != ip) {
                merged.insert(
                    slot,
                    ChartMergeData {
                        ip,
                        untracked,
                        consumed: 0,
                        instances: 0,
                        allocations: 0,
                        allocated: 0,
                        temporary: 0,
                    },
                );
            }
            let entry = &mut merged[slot];
            // track the peak contributions in the consumed chart
            entry.consumed += stats.peak;
            entry.instances += stats.allocations - stats.deallocations;
            entry.allocations += stats.allocations;
            entry.allocated += stats.allocated;
            entry.temporary += stats.temporary;
        }

        Self::pick_top_entries(data, &mut merged, |entry| entry.consumed, &mut self.consumed, &mut self.label_ids, |ids| &mut ids.consumed);
        Self::pick_top_entries(data, &mut merged, |entry| entry.instances, &mut self.instances, &mut self.label_ids, |ids| &mut ids.instances);
        Self::pick_top_entries(data, &mut merged, |entry| entry.allocations, &mut self.allocations, &mut self.label_ids, |ids| &mut ids.allocations);
        Self::pick_top_entries(data, &mut merged, |entry| entry.allocated, &mut self.allocated, &mut self.label_ids, |ids| &mut ids.allocated);
        Self::pick_top_entries(data, &mut merged, |entry| entry.temporary, &mut self.temporary, &mut self.label_ids, |ids| &mut ids.temporary);

        self.enabled = true;
        self.max_consumed_since_last_time_stamp = 0;
        self.max_instances_since_last_time_stamp = 0;
        self.last_time_stamp = 0;
    }

    fn pick_top_entries(
        data: &AccumulatedTraceData,
        merged: &mut [ChartMergeData],
        member: impl Fn(&ChartMergeData) -> i64,
        series: &mut ChartData,
        label_ids: &mut FxHashMap<IpIndex, LabelIds>,
        slot_of: impl Fn(&mut LabelIds) -> &mut i32,
    ) {
        merged.sort_by(|lhs, rhs| member(rhs).cmp(&member(lhs)));
        for (rank, entry) in merged.iter().take(MAX_NUM_COST - 1).enumerate() {
            if member(entry) == 0 {
                break;
            }
            let ids = label_ids.entry(entry.ip).or_default();
            *slot_of(ids) = rank as i32 + 1;

            let ip = data.find_ip(entry.ip);
            let location = location_for(data, &ip, entry.untracked);
            series
                .labels
                .push(format!("{} ({})", location.function, location.module));
        }
    }

    fn append_rows(&mut self, data: &AccumulatedTraceData, time_stamp: i64) {
        let kind = data.config.cost_kind;
        let total = data.total_cost.display(kind);

        let now_consumed = self.max_consumed_since_last_time_stamp;
        self.max_consumed_since_last_time_stamp = 0;
        let now_instances = self.max_instances_since_last_time_stamp;
        self.max_instances_since_last_time_stamp = 0;
        self.last_time_stamp = time_stamp;

        let row = |cost: i64| {
            let mut row = ChartRows {
                time_stamp,
                ..ChartRows::default()
            };
            row.cost[0] = cost;
            row
        };
        let mut consumed = row(now_consumed);
        let mut instances = row(now_instances);
        let mut allocated = row(total.allocated);
        let mut allocations = row(total.allocations);
        let mut temporary = row(total.temporary);

        for allocation in &data.allocations {
            let ip = data.find_prev_trace(allocation.trace_index).ip_index;
            let Some(ids) = self.label_ids.get(&ip) else {
                continue;
            };
            let stats = allocation.data.display(kind);
            let add = |cost: i64, label: i32, row: &mut ChartRows| {
                if cost != 0 && label != -1 {
                    row.cost[label as usize] += cost;
                }
            };
            add(stats.leaked, ids.consumed, &mut consumed);
            add(stats.allocations - stats.deallocations, ids.instances, &mut instances);
            add(stats.allocated, ids.allocated, &mut allocated);
            add(stats.allocations, ids.allocations, &mut allocations);
            add(stats.temporary, ids.temporary, &mut temporary);
        }

        self.consumed.rows.push(consumed);
        self.instances.rows.push(instances);
        self.allocated.rows.push(allocated);
        self.allocations.rows.push(allocations);
        self.temporary.rows.push(temporary);
    }
}

impl ReadHooks for ChartBuilder {
    fn handle_time_stamp(&mut self, data: &AccumulatedTraceData, _old_stamp: i64, new_stamp: i64) {
        if !self.enabled {
            return;
        }
        let kind = data.config.cost_kind;
        let total = data.total_cost.display(kind);
        self.max_consumed_since_last_time_stamp =
            self.max_consumed_since_last_time_stamp.max(total.leaked);
        self.max_instances_since_last_time_stamp = self
            .max_instances_since_last_time_stamp
            .max(total.allocations - total.deallocations);

        // subsample long runs down to the chart resolution
        let stamp_spacing = data.total_time / MAX_CHART_DATAPOINTS;
        if new_stamp != data.total_time && new_stamp - self.last_time_stamp < stamp_spacing {
            return;
        }
        self.append_rows(data, new_stamp);
    }

    fn handle_total_cost_update(&mut self, data: &AccumulatedTraceData) {
        if !self.enabled {
            return;
        }
        let kind = data.config.cost_kind;
        let total = data.total_cost.display(kind);
        self.max_consumed_since_last_time_stamp =
            self.max_consumed_since_last_time_stamp.max(total.leaked);
        self.max_instances_since_last_time_stamp = self
            .max_instances_since_last_time_stamp
            .max(total.allocations - total.deallocations);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation_data::CostKind;
    use crate::trace_data::{NoHooks, ParsePass, ReadConfig};
    use std::io::Cursor;

    const STREAM: &str = "\
v 10100 2
s libapp.so
s main
s alloc
i 1000 0 1 0 2
i 2000 0 1 0 3
t 1 0
t 2 1
a 10 2 0
+ 1
c 1
+ 1
c 2
- 1
c 3
";

    fn charted() -> (AccumulatedTraceData, ChartBuilder) {
        let mut data = AccumulatedTraceData::new(ReadConfig {
            cost_kind: CostKind::Malloc,
            ..ReadConfig::default()
        });
        let mut bytes = Cursor::new(STREAM.as_bytes().to_vec());
        data.read(&mut bytes, ParsePass::First, &mut NoHooks).unwrap();
        let mut bytes = Cursor::new(STREAM.as_bytes().to_vec());
        data.read(&mut bytes, ParsePass::Second, &mut NoHooks).unwrap();

        let mut builder = ChartBuilder::new();
        builder.prepare(&data);
        let mut bytes = Cursor::new(STREAM.as_bytes().to_vec());
        data.read(&mut bytes, ParsePass::Third, &mut builder).unwrap();
        (data, builder)
    }

    #[test]
    fn test_total_column_tracks_consumption() {
        let (data, builder) = charted();
        assert_eq!(data.total_time, 4);

        let rows = &builder.consumed.rows;
        // origin row plus one row per surviving timestamp sample
        assert!(rows.len() >= 2);
        let peak_row = rows.iter().map(|row| row.cost[0]).max().unwrap();
        assert_eq!(peak_row, 0x20);
        // the final row reflects the remaining leak
        assert_eq!(rows.last().unwrap().cost[0], 0x10);
    }

    #[test]
    fn test_labels_name_hotspots() {
        let (_, builder) = charted();
        assert_eq!(builder.consumed.labels[0], "total");
        assert!(builder.consumed.labels[1].contains("libapp.so"));
    }

    #[test]
    fn test_allocation_series_is_monotonic() {
        let (_, builder) = charted();
        let counts: Vec<i64> = builder.allocations.rows.iter().map(|row| row.cost[0]).collect();
        assert!(counts.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(*counts.last().unwrap(), 2);
    }
}
