//! Flame-graph input.
//!
//! Emits the collapsed-stack text format: one line per unique stack with
//! its self cost, `frame;frame;...;frame cost`. Fed from the top-down
//! tree so the root of each line is the outermost caller.

use crate::allocation_data::Stats;
use crate::views::RowData;

/// Which number a flame graph is drawn over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlameMetric {
    Allocations,
    Allocated,
    Leaked,
    Peak,
    Temporary,
}

impl FlameMetric {
    fn pick(self, stats: &Stats) -> i64 {
        match self {
            FlameMetric::Allocations => stats.allocations,
            FlameMetric::Allocated => stats.allocated,
            FlameMetric::Leaked => stats.leaked,
            FlameMetric::Peak => stats.peak,
            FlameMetric::Temporary => stats.temporary,
        }
    }
}

fn walk(rows: &[RowData], metric: FlameMetric, path: &mut Vec<String>, out: &mut Vec<String>) {
    for row in rows {
        path.push(row.location.function.clone());

        let children_cost: i64 = row
            .children
            .iter()
            .map(|child| metric.pick(&child.cost))
            .sum();
        let self_cost = metric.pick(&row.cost) - children_cost;
        if self_cost > 0 {
            out.push(format!("{} {}", path.join(";"), self_cost));
        }

        walk(&row.children, metric, path, out);
        path.pop();
    }
}

/// Collapse a top-down tree into flame-graph input lines.
pub fn to_collapsed_stacks(top_down: &[RowData], metric: FlameMetric) -> Vec<String> {
    let mut out = Vec::new();
    walk(top_down, metric, &mut Vec::new(), &mut out);
    out
}
