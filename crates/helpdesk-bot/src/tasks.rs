use chrono::Utc;
use helpdesk_engine::SessionEngine;
use helpdesk_lifecycle::ThreadLifecycleMonitor;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// Idle expiry, eviction and recorder backlog retries share one cadence.
pub const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Periodic inactivity scan. The first tick fires immediately so a restart catches up.
pub fn start_scan_loop(monitor: Arc<ThreadLifecycleMonitor>, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let monitor = Arc::clone(&monitor);
            match tokio::task::spawn_blocking(move || monitor.run_scan(Utc::now())).await {
                Ok(Ok(report)) => debug!(
                    event = "scan_tick",
                    due = report.due,
                    archived = report.archived,
                    failed = report.failed,
                    triage_posted = report.triage_posted,
                ),
                Ok(Err(err)) => error!(event = "scan_failed", error = %err),
                Err(err) => error!(event = "scan_join_failed", error = %err),
            }
        }
    });
}

pub fn start_session_sweeper(engine: Arc<SessionEngine>, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let engine = Arc::clone(&engine);
            let swept = tokio::task::spawn_blocking(move || {
                let now = Utc::now();
                let expired = engine.expire_idle(now).len();
                let evicted = engine.evict_closed(now);
                let flushed = if engine.backlog_len() > 0 {
                    engine.flush_backlog().ok()
                } else {
                    None
                };
                (expired, evicted, flushed)
            })
            .await;
            match swept {
                Ok((expired, evicted, flushed)) => {
                    if expired > 0 || evicted > 0 {
                        info!(event = "session_sweep", expired, evicted);
                    }
                    if let Some(flushed) = flushed {
                        debug!(event = "backlog_retry", flushed);
                    }
                }
                Err(err) => error!(event = "sweep_join_failed", error = %err),
            }
        }
    });
}
