use helpdesk_core::{SessionState, TreeError};
use thiserror::Error;

use crate::recorder::RecorderError;

pub const MANUAL_SUPPORT_MESSAGE: &str = "Looks like we're going in circles. \
     Please open a post in the support forum so someone can take a look.";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown session: {0}")]
    NotFound(String),
    #[error("node {node_id} has no option labelled {label:?}")]
    InvalidChoice { node_id: String, label: String },
    #[error("session {session_id} already ended ({state})")]
    SessionClosed {
        session_id: String,
        state: SessionState,
    },
    #[error("node {node_id} offers no follow-up")]
    NoFollowUp { node_id: String },
    #[error("session {session_id} exceeded {max_steps} steps")]
    LoopDetected { session_id: String, max_steps: u32 },
    #[error("tree error: {0}")]
    Tree(#[from] TreeError),
    #[error("recorder error: {0}")]
    Recorder(#[from] RecorderError),
}

impl EngineError {
    /// Stable machine-readable code for the platform layer.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidChoice { .. } => "invalid_choice",
            Self::SessionClosed { .. } => "session_closed",
            Self::NoFollowUp { .. } => "no_follow_up",
            Self::LoopDetected { .. } => "loop_detected",
            Self::Tree(_) => "tree_error",
            Self::Recorder(_) => "recorder_error",
        }
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "Session expired, please restart.",
            Self::InvalidChoice { .. } => "Please pick one of the listed options.",
            Self::SessionClosed { .. } => "This troubleshooting session already ended.",
            Self::NoFollowUp { .. } => "There is nothing else to try from here.",
            Self::LoopDetected { .. } | Self::Tree(_) | Self::Recorder(_) => MANUAL_SUPPORT_MESSAGE,
        }
    }
}
