//! Allocation size histogram.

use serde::Serialize;

use crate::trace_data::{AccumulatedTraceData, AllocationInfo};
use crate::views::{Location, location_for};

/// Columns per row: the total plus the top allocation sites.
pub const NUM_COLUMNS: usize = 10;

/// Count of how many times one allocation info was hit.
#[derive(Debug, Clone, Copy, Default)]
pub struct CountedAllocationInfo {
    pub info: AllocationInfo,
    pub allocations: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HistogramColumn {
    pub allocations: i64,
    pub location: Option<Location>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistogramRow {
    /// Upper bound of the bucket, inclusive.
    pub size: u64,
    pub size_label: String,
    /// `columns[0]` is the bucket total, the rest the top sites.
    pub columns: Vec<HistogramColumn>,
}

impl HistogramRow {
    fn new(size: u64, size_label: &str) -> Self {
        Self {
            size,
            size_label: size_label.to_owned(),
            columns: vec![HistogramColumn::default(); NUM_COLUMNS],
        }
    }
}

const BUCKETS: [(u64, &str); 9] = [
    (8, "0B to 8B"),
    (16, "9B to 16B"),
    (32, "17B to 32B"),
    (64, "33B to 64B"),
    (128, "65B to 128B"),
    (256, "129B to 256B"),
    (512, "257B to 512B"),
    (1024, "512B to 1KB"),
    (u64::MAX, "more than 1KB"),
];

struct ColumnData {
    location: Location,
    allocations: i64,
}

fn insert_columns(row: &mut HistogramRow, column_data: &mut Vec<ColumnData>) {
    column_data.sort_by(|lhs, rhs| rhs.allocations.cmp(&lhs.allocations));
    for (slot, column) in column_data.iter().take(NUM_COLUMNS - 1).enumerate() {
        row.columns[slot + 1] = HistogramColumn {
            allocations: column.allocations,
            location: Some(column.location.clone()),
        };
    }
}

/// Bucket the counted allocation infos by size; each bucket carries its
/// total and the top allocation sites by hit count.
pub fn build_size_histogram(
    data: &AccumulatedTraceData,
    mut counted: Vec<CountedAllocationInfo>,
) -> Vec<HistogramRow> {
    let mut rows = Vec::new();
    if counted.is_empty() {
        return rows;
    }
    counted.sort_by_key(|entry| (entry.info.size, entry.allocations));

    let mut bucket = 0usize;
    let mut row = HistogramRow::new(BUCKETS[bucket].0, BUCKETS[bucket].1);
    let mut column_data: Vec<ColumnData> = Vec::with_capacity(128);

    for entry in &counted {
        if entry.info.size > row.size {
            insert_columns(&mut row, &mut column_data);
            column_data.clear();
            rows.push(row);
            bucket += 1;
            while entry.info.size > BUCKETS[bucket].0 {
                rows.push(HistogramRow::new(BUCKETS[bucket].0, BUCKETS[bucket].1));
                bucket += 1;
            }
            row = HistogramRow::new(BUCKETS[bucket].0, BUCKETS[bucket].1);
            row.columns[0].allocations = entry.allocations;
        } else {
            row.columns[0].allocations += entry.allocations;
        }

        let trace = data.find_prev_trace(entry.info.trace_index);
        let untracked = !entry.info.trace_index.is_valid();
        let ip = data.find_ip(trace.ip_index);
        let location = location_for(data, &ip, untracked);
        match column_data
            .iter_mut()
            .find(|column| column.location == location)
        {
            Some(column) => column.allocations += entry.allocations,
            None => column_data.push(ColumnData {
                location,
                allocations: entry.allocations,
            }),
        }
    }
    insert_columns(&mut row, &mut column_data);
    rows.push(row);
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use heapscope_format::TraceIndex;

    fn counted(size: u64, trace: u32, allocations: i64) -> CountedAllocationInfo {
        CountedAllocationInfo {
            info: AllocationInfo {
                size,
                trace_index: TraceIndex::new(trace),
                is_managed: false,
            },
            allocations,
        }
    }

    #[test]
    fn test_buckets_by_size() {
        let data = AccumulatedTraceData::default();
        let rows = build_size_histogram(
            &data,
            vec![counted(4, 0, 10), counted(8, 0, 5), counted(12, 0, 3)],
        );
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].size, 8);
        assert_eq!(rows[0].columns[0].allocations, 15);
        assert_eq!(rows[1].size, 16);
        assert_eq!(rows[1].columns[0].allocations, 3);
    }

    #[test]
    fn test_oversized_lands_in_open_bucket() {
        let data = AccumulatedTraceData::default();
        let rows = build_size_histogram(&data, vec![counted(4, 0, 1), counted(1_000_000, 0, 2)]);
        let last = rows.last().unwrap();
        assert_eq!(last.size, u64::MAX);
        assert_eq!(last.columns[0].allocations, 2);
    }

    #[test]
    fn test_empty_input() {
        let data = AccumulatedTraceData::default();
        assert!(build_size_histogram(&data, Vec::new()).is_empty());
    }

    #[test]
    fn test_top_columns_sorted_by_count() {
        let data = AccumulatedTraceData::default();
        // two distinct sites in one bucket; untracked traces share the
        // same location so use distinct ones via is_managed trick is not
        // possible here, the counts still merge into one column
        let rows = build_size_histogram(&data, vec![counted(4, 0, 1), counted(6, 0, 9)]);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].columns[0].allocations, 10);
        assert_eq!(rows[0].columns[1].allocations, 10);
        assert!(rows[0].columns[2].location.is_none());
    }
}
