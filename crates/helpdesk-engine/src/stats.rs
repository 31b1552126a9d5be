use helpdesk_core::{NodeCounts, OutcomeKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::recorder::{OutcomeRecorder, RecorderError};

const NODE_COLUMN_WIDTH: usize = 30;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeStat {
    pub node_id: String,
    pub visited: u64,
    pub solved: u64,
    pub solve_rate: f64,
}

impl NodeStat {
    fn from_counts(node_id: &str, counts: &NodeCounts) -> Self {
        Self {
            node_id: node_id.to_string(),
            visited: counts.visited,
            solved: counts.solved,
            solve_rate: counts.solve_rate(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatsReport {
    pub top_visited: Vec<NodeStat>,
    pub top_solved: Vec<NodeStat>,
}

impl StatsReport {
    pub fn is_empty(&self) -> bool {
        self.top_visited.is_empty() && self.top_solved.is_empty()
    }

    /// Plain-text table for chat replies.
    pub fn render(&self) -> String {
        if self.is_empty() {
            return "No data yet.".to_string();
        }

        let mut out = String::new();
        if !self.top_visited.is_empty() {
            out.push_str("Most visited:\n");
            for stat in &self.top_visited {
                let _ = writeln!(
                    out,
                    "`{:<width$}` {}",
                    stat.node_id,
                    stat.visited,
                    width = NODE_COLUMN_WIDTH
                );
            }
        }
        if !self.top_solved.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str("Most solved:\n");
            for stat in &self.top_solved {
                let _ = writeln!(
                    out,
                    "`{:<width$}` {} ({:.1}%)",
                    stat.node_id,
                    stat.solved,
                    stat.solve_rate * 100.0,
                    width = NODE_COLUMN_WIDTH
                );
            }
        }
        out.trim_end().to_string()
    }
}

/// Read-only rankings over whatever the recorder has accumulated.
pub struct StatsReporter<'a> {
    recorder: &'a dyn OutcomeRecorder,
}

impl<'a> StatsReporter<'a> {
    pub fn new(recorder: &'a dyn OutcomeRecorder) -> Self {
        Self { recorder }
    }

    pub fn top_visited(&self, limit: usize) -> Result<Vec<NodeStat>, RecorderError> {
        Ok(rank(&self.recorder.all_counts()?, OutcomeKind::Visited, limit))
    }

    pub fn top_solved(&self, limit: usize) -> Result<Vec<NodeStat>, RecorderError> {
        Ok(rank(&self.recorder.all_counts()?, OutcomeKind::Solved, limit))
    }

    pub fn solve_rate(&self, node_id: &str) -> Result<f64, RecorderError> {
        Ok(self.recorder.counts_for(node_id)?.solve_rate())
    }

    pub fn report(&self, limit: usize) -> Result<StatsReport, RecorderError> {
        let counts = self.recorder.all_counts()?;
        Ok(StatsReport {
            top_visited: rank(&counts, OutcomeKind::Visited, limit),
            top_solved: rank(&counts, OutcomeKind::Solved, limit),
        })
    }
}

/// Nodes with a non-zero count for `kind`, highest first, ties by node id.
fn rank(counts: &BTreeMap<String, NodeCounts>, kind: OutcomeKind, limit: usize) -> Vec<NodeStat> {
    let mut ranked: Vec<(&String, &NodeCounts)> = counts
        .iter()
        .filter(|(_, counts)| counts.get(kind) > 0)
        .collect();
    ranked.sort_by(|(left_id, left), (right_id, right)| {
        right
            .get(kind)
            .cmp(&left.get(kind))
            .then_with(|| left_id.cmp(right_id))
    });
    ranked
        .into_iter()
        .take(limit)
        .map(|(node_id, counts)| NodeStat::from_counts(node_id, counts))
        .collect()
}
