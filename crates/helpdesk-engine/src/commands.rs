use chrono::{DateTime, Utc};
use helpdesk_core::{NextStep, Session, SessionState};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::EngineError;
use crate::session::SessionEngine;
use crate::stats::{StatsReport, StatsReporter};

pub const DEFAULT_STATS_LIMIT: usize = 10;

fn default_stats_limit() -> usize {
    DEFAULT_STATS_LIMIT
}

/// Inbound troubleshooting commands as delivered by the platform bridge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum TroubleshootCommand {
    Start {
        user_id: String,
        context_id: String,
    },
    Choose {
        session_id: String,
        label: String,
    },
    Abandon {
        session_id: String,
    },
    /// "Still having issues" after a solution: continue at its fallback node.
    FollowUp {
        session_id: String,
    },
    Restart {
        user_id: String,
        context_id: String,
    },
    Stats {
        #[serde(default = "default_stats_limit")]
        limit: usize,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandResponse {
    Prompt {
        step: NextStep,
    },
    Ended {
        session_id: String,
        state: SessionState,
    },
    Stats {
        report: StatsReport,
        text: String,
    },
    Error {
        code: String,
        message: String,
    },
}

impl CommandResponse {
    pub fn from_error(err: &EngineError) -> Self {
        Self::Error {
            code: err.code().to_string(),
            message: err.user_message().to_string(),
        }
    }

    fn ended(session: &Session) -> Self {
        Self::Ended {
            session_id: session.session_id.clone(),
            state: session.state,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

pub fn dispatch(
    engine: &SessionEngine,
    command: TroubleshootCommand,
    now: DateTime<Utc>,
) -> CommandResponse {
    let outcome = match command {
        TroubleshootCommand::Start {
            user_id,
            context_id,
        } => engine
            .start(&user_id, &context_id, now)
            .map(|(_, step)| CommandResponse::Prompt { step }),
        TroubleshootCommand::Choose { session_id, label } => engine
            .choose(&session_id, &label, now)
            .map(|step| CommandResponse::Prompt { step }),
        TroubleshootCommand::Abandon { session_id } => engine
            .abandon(&session_id, now)
            .map(|session| CommandResponse::ended(&session)),
        TroubleshootCommand::FollowUp { session_id } => engine
            .follow_up(&session_id, now)
            .map(|(_, step)| CommandResponse::Prompt { step }),
        TroubleshootCommand::Restart {
            user_id,
            context_id,
        } => engine
            .restart(&user_id, &context_id, now)
            .map(|(_, step)| CommandResponse::Prompt { step }),
        TroubleshootCommand::Stats { limit } => StatsReporter::new(engine.recorder())
            .report(limit)
            .map_err(EngineError::from)
            .map(|report| {
                let text = report.render();
                CommandResponse::Stats { report, text }
            }),
    };

    outcome.unwrap_or_else(|err| {
        if matches!(err, EngineError::Tree(_) | EngineError::Recorder(_)) {
            warn!(event = "command_failed", code = err.code(), error = %err);
        }
        CommandResponse::from_error(&err)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::MemoryRecorder;
    use crate::session::EngineConfig;
    use chrono::TimeZone;
    use helpdesk_core::{DecisionTree, GraphDescription};
    use std::sync::Arc;

    fn engine() -> SessionEngine {
        let description: GraphDescription = serde_json::from_value(serde_json::json!({
            "nodes": {
                "root": {"type": "question", "prompt": "Crash on start?", "options": [
                    {"label": "Yes", "next": "fix"}
                ]},
                "fix": {
                    "type": "solution",
                    "prompt": "Update your drivers.",
                    "tag": "drivers",
                    "did_not_help": "support"
                },
                "support": {"type": "solution", "prompt": "Ask in the forum.", "tag": "manual"}
            }
        }))
        .expect("description");
        let tree = DecisionTree::load(&description).expect("tree");
        SessionEngine::new(
            Arc::new(tree),
            Arc::new(MemoryRecorder::new()),
            EngineConfig::default(),
        )
    }

    fn now() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_771_855_200_000)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn commands_parse_from_tagged_json() {
        let command: TroubleshootCommand =
            serde_json::from_str(r#"{"command":"stats"}"#).expect("stats");
        assert_eq!(
            command,
            TroubleshootCommand::Stats {
                limit: DEFAULT_STATS_LIMIT
            }
        );
    }

    #[test]
    fn start_then_choose_reaches_the_tagged_solution() {
        let engine = engine();
        let response = dispatch(
            &engine,
            TroubleshootCommand::Start {
                user_id: "u1".into(),
                context_id: "guild".into(),
            },
            now(),
        );
        let step = match response {
            CommandResponse::Prompt { step } => step,
            other => panic!("expected prompt, got {other:?}"),
        };

        let response = dispatch(
            &engine,
            TroubleshootCommand::Choose {
                session_id: step.session_id().to_string(),
                label: "Yes".into(),
            },
            now(),
        );
        match response {
            CommandResponse::Prompt {
                step: NextStep::Solved { resolution_tag, .. },
            } => assert_eq!(resolution_tag, "drivers"),
            other => panic!("expected solution, got {other:?}"),
        }

        let response = dispatch(
            &engine,
            TroubleshootCommand::FollowUp {
                session_id: step.session_id().to_string(),
            },
            now(),
        );
        match response {
            CommandResponse::Prompt {
                step: NextStep::Solved { node_id, .. },
            } => assert_eq!(node_id, "support"),
            other => panic!("expected fallback, got {other:?}"),
        }

        let response = dispatch(&engine, TroubleshootCommand::Stats { limit: 3 }, now());
        match response {
            CommandResponse::Stats { text, .. } => assert!(text.contains("Most solved:")),
            other => panic!("expected stats, got {other:?}"),
        }
    }

    #[test]
    fn errors_carry_code_and_user_message() {
        let engine = engine();
        let response = dispatch(
            &engine,
            TroubleshootCommand::Abandon {
                session_id: "ts-gone".into(),
            },
            now(),
        );
        assert_eq!(
            response,
            CommandResponse::Error {
                code: "not_found".into(),
                message: "Session expired, please restart.".into(),
            }
        );
        assert!(response.is_error());
    }
}
