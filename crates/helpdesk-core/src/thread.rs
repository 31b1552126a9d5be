use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const MENTION_PLACEHOLDER: &str = "@MENTION";

pub const DEFAULT_TRIAGE_TEMPLATE: &str = "\
Hey @MENTION, to help troubleshoot please fill in what you can:

OS: (e.g. Windows 10, Windows 11)
App version:
Game version:
Launcher + version: (e.g. MultiMC 0.7.0, Prism 8.0)
Java version: (run `java -version`)
GPU: (e.g. NVIDIA RTX 3060, AMD RX 6700 XT)
Display mode: Fullscreen / Windowed / Borderless
What happened: (steps to reproduce + what you expected vs what you got)
Full launcher log: (Edit Instance > Minecraft Log, not `latest.log`)

Optional: other mods installed, injector.log, screenshot/video, your config";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ThreadState {
    Open,
    TriageRequested,
    Archived,
}

impl ThreadState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::TriageRequested => "triage-requested",
            Self::Archived => "archived",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Archived)
    }
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ThreadState {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim() {
            "open" => Ok(Self::Open),
            "triage-requested" => Ok(Self::TriageRequested),
            "archived" => Ok(Self::Archived),
            other => Err(format!("Unknown thread state: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchedThread {
    pub thread_id: String,
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    pub state: ThreadState,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    #[serde(default)]
    pub archive_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThreadCreated {
    pub thread_id: String,
    pub tag: String,
    #[serde(default)]
    pub owner_id: Option<String>,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThreadActivity {
    pub thread_id: String,
    pub ts: DateTime<Utc>,
}

/// Fields of the triage request posted into a freshly watched thread.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriagePost {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mention: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apply_tag: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveRequest {
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_tag: Option<String>,
    pub notice: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("external call failed ({operation}): {message}")]
pub struct GatewayError {
    pub operation: &'static str,
    pub message: String,
}

impl GatewayError {
    pub fn new(operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            operation,
            message: message.into(),
        }
    }
}

/// Outbound commands toward the forum platform.
pub trait ForumGateway: Send + Sync {
    fn post_triage_template(&self, thread_id: &str, post: &TriagePost)
        -> Result<(), GatewayError>;

    fn archive_thread(&self, thread_id: &str, request: &ArchiveRequest)
        -> Result<(), GatewayError>;
}

pub fn mention_for(owner_id: &str) -> String {
    format!("<@{owner_id}>")
}

/// Substitutes the owner mention into a triage template. Without an owner the
/// placeholder collapses to "there".
pub fn render_triage_message(template: &str, owner_id: Option<&str>) -> String {
    let mention = owner_id
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(mention_for)
        .unwrap_or_else(|| "there".to_string());
    template.replace(MENTION_PLACEHOLDER, &mention)
}

/// Single-line command input uses a literal `\n` for line breaks.
pub fn normalize_template_input(raw: &str) -> String {
    raw.replace("\\n", "\n")
}

pub fn closing_notice(inactivity_hours: i64) -> String {
    format!(
        "\u{23f3} No replies in {inactivity_hours}h - marking as done. Post again to reopen."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_replaces_mention_with_owner() {
        let message = render_triage_message("Hey @MENTION, logs please", Some("42"));
        assert_eq!(message, "Hey <@42>, logs please");
    }

    #[test]
    fn render_without_owner_uses_neutral_greeting() {
        let message = render_triage_message(DEFAULT_TRIAGE_TEMPLATE, None);
        assert!(message.starts_with("Hey there,"));
        assert!(!message.contains(MENTION_PLACEHOLDER));
    }

    #[test]
    fn template_input_unescapes_newlines() {
        assert_eq!(normalize_template_input("a\\nb"), "a\nb");
    }

    #[test]
    fn thread_state_parses_kebab_names() {
        assert_eq!(
            "triage-requested".parse::<ThreadState>(),
            Ok(ThreadState::TriageRequested)
        );
        assert!(ThreadState::Archived.is_terminal());
        assert!("closed".parse::<ThreadState>().is_err());
    }

    #[test]
    fn closing_notice_mentions_threshold() {
        assert!(closing_notice(72).contains("72h"));
    }
}
