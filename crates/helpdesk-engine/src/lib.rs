pub mod commands;
pub mod error;
pub mod recorder;
pub mod session;
pub mod stats;

pub use commands::{dispatch, CommandResponse, TroubleshootCommand, DEFAULT_STATS_LIMIT};
pub use error::EngineError;
pub use recorder::{MemoryRecorder, OutcomeRecorder, RecorderError, StoreRecorder};
pub use session::{EngineConfig, SessionEngine};
pub use stats::{NodeStat, StatsReport, StatsReporter};
