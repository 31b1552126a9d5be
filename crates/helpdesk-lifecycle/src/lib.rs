mod monitor;

pub use monitor::{
    CreatedOutcome, LifecycleConfig, LifecycleError, ScanReport, ThreadLifecycleMonitor,
    TriageOutcome, TRIAGE_TEMPLATE_KEY,
};
