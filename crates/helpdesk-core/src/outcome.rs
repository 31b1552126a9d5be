use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Visited,
    Solved,
}

impl OutcomeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Visited => "visited",
            Self::Solved => "solved",
        }
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutcomeKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim() {
            "visited" => Ok(Self::Visited),
            "solved" => Ok(Self::Solved),
            other => Err(format!("Unknown outcome kind: {other}")),
        }
    }
}

pub fn resolution_tag_for(node_id: &str) -> String {
    format!("{node_id}:solved")
}

/// One step of a traversal, as handed to the outcome recorder. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HitRecord {
    pub node_id: String,
    pub kind: OutcomeKind,
    pub session_id: String,
    pub ts: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_tag: Option<String>,
}

impl HitRecord {
    pub fn visited(
        node_id: impl Into<String>,
        session_id: impl Into<String>,
        ts: DateTime<Utc>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            kind: OutcomeKind::Visited,
            session_id: session_id.into(),
            ts,
            resolution_tag: None,
        }
    }

    pub fn solved(
        node_id: impl Into<String>,
        resolution_tag: impl Into<String>,
        session_id: impl Into<String>,
        ts: DateTime<Utc>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            kind: OutcomeKind::Solved,
            session_id: session_id.into(),
            ts,
            resolution_tag: Some(resolution_tag.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeCounts {
    pub visited: u64,
    pub solved: u64,
}

impl NodeCounts {
    pub fn get(&self, kind: OutcomeKind) -> u64 {
        match kind {
            OutcomeKind::Visited => self.visited,
            OutcomeKind::Solved => self.solved,
        }
    }

    pub fn add(&mut self, kind: OutcomeKind, amount: u64) {
        match kind {
            OutcomeKind::Visited => self.visited = self.visited.saturating_add(amount),
            OutcomeKind::Solved => self.solved = self.solved.saturating_add(amount),
        }
    }

    /// `solved / visited`, 0 when nothing was visited, clamped to [0, 1].
    pub fn solve_rate(&self) -> f64 {
        if self.visited == 0 {
            return 0.0;
        }
        (self.solved as f64 / self.visited as f64).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solve_rate_is_zero_without_visits() {
        let counts = NodeCounts {
            visited: 0,
            solved: 3,
        };
        assert_eq!(counts.solve_rate(), 0.0);
    }

    #[test]
    fn solve_rate_is_bounded() {
        let mut counts = NodeCounts::default();
        counts.add(OutcomeKind::Visited, 4);
        counts.add(OutcomeKind::Solved, 1);
        assert_eq!(counts.solve_rate(), 0.25);

        counts.add(OutcomeKind::Solved, 10);
        assert_eq!(counts.solve_rate(), 1.0);
    }

    #[test]
    fn outcome_kind_round_trips_through_str() {
        for kind in [OutcomeKind::Visited, OutcomeKind::Solved] {
            assert_eq!(kind.as_str().parse::<OutcomeKind>(), Ok(kind));
        }
        assert!("hit".parse::<OutcomeKind>().is_err());
    }

    #[test]
    fn solved_record_carries_resolution_tag() {
        let ts = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).expect("ts");
        let record = HitRecord::solved("sol_A", resolution_tag_for("sol_A"), "s-1", ts);
        assert_eq!(record.kind, OutcomeKind::Solved);
        assert_eq!(record.resolution_tag.as_deref(), Some("sol_A:solved"));
    }
}
