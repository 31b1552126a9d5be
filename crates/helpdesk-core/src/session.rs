use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::tree::CollectField;

/// More options than this are offered as a select menu instead of buttons.
pub const OPTION_MENU_THRESHOLD: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub user_id: String,
    pub context_id: String,
}

impl SessionKey {
    pub fn new(user_id: impl Into<String>, context_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            context_id: context_id.into(),
        }
    }

    /// Deterministic id for the `generation`-th traversal under this key.
    pub fn session_id(&self, started_at: DateTime<Utc>, generation: u64) -> String {
        let digest = crate::sha256_hex(
            format!(
                "{}\u{0}{}\u{0}{}\u{0}{generation}",
                self.user_id,
                self.context_id,
                started_at.timestamp_millis()
            )
            .as_bytes(),
        );
        format!("ts-{}", &digest[..16])
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user_id, self.context_id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Solved,
    Abandoned,
    TimedOut,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Solved => "solved",
            Self::Abandoned => "abandoned",
            Self::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Solved,
    Abandoned,
    Restarted,
    LoopDetected,
    Idle,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub context_id: String,
    pub state: SessionState,
    pub current_node: String,
    pub history: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub last_interaction_at: DateTime<Utc>,
    pub steps: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<EndReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.user_id.clone(), self.context_id.clone())
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OptionLayout {
    Buttons,
    Menu,
}

impl OptionLayout {
    pub fn for_option_count(count: usize) -> Self {
        if count > OPTION_MENU_THRESHOLD {
            Self::Menu
        } else {
            Self::Buttons
        }
    }
}

/// Prompt payload for the platform layer after a start or a choice.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NextStep {
    Question {
        session_id: String,
        node_id: String,
        prompt: String,
        options: Vec<String>,
        layout: OptionLayout,
    },
    Solved {
        session_id: String,
        node_id: String,
        prompt: String,
        resolution_tag: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        collect: Vec<CollectField>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        did_not_help: Option<String>,
    },
}

impl NextStep {
    pub fn node_id(&self) -> &str {
        match self {
            Self::Question { node_id, .. } | Self::Solved { node_id, .. } => node_id,
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            Self::Question { session_id, .. } | Self::Solved { session_id, .. } => session_id,
        }
    }

    pub fn is_solved(&self) -> bool {
        matches!(self, Self::Solved { .. })
    }
}
