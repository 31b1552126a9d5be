use chrono::{DateTime, Duration, TimeZone, Utc};
use helpdesk_core::{
    ArchiveRequest, ForumGateway, GatewayError, ThreadActivity, ThreadCreated, ThreadState,
    TriagePost,
};
use helpdesk_lifecycle::{
    CreatedOutcome, LifecycleConfig, ScanReport, ThreadLifecycleMonitor, TriageOutcome,
};
use helpdesk_storage::{HelpdeskStore, SharedStore};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, OnceLock};
use tempfile::NamedTempFile;

fn ts(offset_ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(1_771_855_200_000 + offset_ms)
        .single()
        .expect("valid timestamp")
}

fn hours(value: i64) -> i64 {
    value * 3_600_000
}

/// Gateway double: pops scripted failures first, records every call.
#[derive(Default)]
struct ScriptedGateway {
    post_failures: Mutex<VecDeque<String>>,
    archive_failures: Mutex<VecDeque<String>>,
    posts: Mutex<Vec<String>>,
    archives: Mutex<Vec<(String, ArchiveRequest)>>,
    during_archive: OnceLock<Box<dyn Fn() + Send + Sync>>,
}

impl ScriptedGateway {
    fn fail_next_post(&self, message: &str) {
        self.post_failures
            .lock()
            .expect("post failures")
            .push_back(message.to_string());
    }

    fn fail_next_archive(&self, message: &str) {
        self.archive_failures
            .lock()
            .expect("archive failures")
            .push_back(message.to_string());
    }

    fn post_count(&self) -> usize {
        self.posts.lock().expect("posts").len()
    }

    fn archive_calls(&self) -> Vec<(String, ArchiveRequest)> {
        self.archives.lock().expect("archives").clone()
    }
}

impl ForumGateway for ScriptedGateway {
    fn post_triage_template(
        &self,
        thread_id: &str,
        _post: &TriagePost,
    ) -> Result<(), GatewayError> {
        self.posts
            .lock()
            .expect("posts")
            .push(thread_id.to_string());
        match self.post_failures.lock().expect("post failures").pop_front() {
            Some(message) => Err(GatewayError::new("post_triage_template", message)),
            None => Ok(()),
        }
    }

    fn archive_thread(
        &self,
        thread_id: &str,
        request: &ArchiveRequest,
    ) -> Result<(), GatewayError> {
        self.archives
            .lock()
            .expect("archives")
            .push((thread_id.to_string(), request.clone()));
        if let Some(hook) = self.during_archive.get() {
            hook();
        }
        match self
            .archive_failures
            .lock()
            .expect("archive failures")
            .pop_front()
        {
            Some(message) => Err(GatewayError::new("archive_thread", message)),
            None => Ok(()),
        }
    }
}

fn config(owner_id: &str) -> LifecycleConfig {
    LifecycleConfig {
        watched_tag: "Bug".to_string(),
        ongoing_tag: "Ongoing".to_string(),
        done_tag: "Done".to_string(),
        inactivity_threshold: Duration::hours(72),
        lease_ttl: Duration::minutes(2),
        owner_id: owner_id.to_string(),
    }
}

fn setup() -> (ThreadLifecycleMonitor, Arc<ScriptedGateway>, SharedStore) {
    let store = SharedStore::new(HelpdeskStore::open_in_memory().expect("store"));
    let gateway = Arc::new(ScriptedGateway::default());
    let monitor = ThreadLifecycleMonitor::new(store.clone(), gateway.clone(), config("scan-a"));
    (monitor, gateway, store)
}

fn create(monitor: &ThreadLifecycleMonitor, thread_id: &str) {
    let (outcome, _) = monitor
        .on_thread_created(&ThreadCreated {
            thread_id: thread_id.to_string(),
            tag: "bug".to_string(),
            owner_id: Some("owner-1".to_string()),
            ts: ts(0),
        })
        .expect("created");
    assert_eq!(outcome, CreatedOutcome::Registered);
}

#[test]
fn silent_thread_is_archived_once_after_threshold() {
    let (monitor, gateway, _) = setup();
    create(&monitor, "t-1");

    assert!(monitor.due_for_archive(ts(hours(71))).expect("due").is_empty());
    let report = monitor.run_scan(ts(hours(71))).expect("early scan");
    assert_eq!(report, ScanReport::default());

    let report = monitor.run_scan(ts(hours(73))).expect("scan");
    assert_eq!(report.due, 1);
    assert_eq!(report.archived, 1);

    let calls = gateway.archive_calls();
    assert_eq!(calls.len(), 1);
    let (thread_id, request) = &calls[0];
    assert_eq!(thread_id, "t-1");
    assert_eq!(request.tag, "Done");
    assert_eq!(request.remove_tag.as_deref(), Some("Ongoing"));
    assert!(request.notice.contains("72h"));

    let thread = monitor.thread("t-1").expect("load").expect("thread");
    assert_eq!(thread.state, ThreadState::Archived);
    assert_eq!(thread.archived_at, Some(ts(hours(73))));

    let report = monitor.run_scan(ts(hours(80))).expect("second scan");
    assert_eq!(report.due, 0);
    assert_eq!(gateway.archive_calls().len(), 1);
}

#[test]
fn activity_defers_archiving() {
    let (monitor, gateway, _) = setup();
    create(&monitor, "t-1");

    assert!(monitor
        .on_thread_activity(&ThreadActivity {
            thread_id: "t-1".to_string(),
            ts: ts(hours(70)),
        })
        .expect("activity"));
    assert!(!monitor
        .on_thread_activity(&ThreadActivity {
            thread_id: "t-1".to_string(),
            ts: ts(hours(10)),
        })
        .expect("stale activity"));

    assert_eq!(monitor.run_scan(ts(hours(73))).expect("scan").archived, 0);
    assert_eq!(monitor.run_scan(ts(hours(141))).expect("scan").archived, 0);
    assert_eq!(monitor.run_scan(ts(hours(142))).expect("scan").archived, 1);
    assert_eq!(gateway.archive_calls().len(), 1);
}

#[test]
fn archived_thread_is_not_reopened_by_activity() {
    let (monitor, _, _) = setup();
    create(&monitor, "t-1");
    monitor.run_scan(ts(hours(73))).expect("scan");

    let moved = monitor
        .on_thread_activity(&ThreadActivity {
            thread_id: "t-1".to_string(),
            ts: ts(hours(74)),
        })
        .expect("activity");
    assert!(!moved);
    let thread = monitor.thread("t-1").expect("load").expect("thread");
    assert_eq!(thread.state, ThreadState::Archived);
}

#[test]
fn failed_archive_stays_pending_and_next_scan_retries() {
    let (monitor, gateway, _) = setup();
    create(&monitor, "t-1");
    gateway.fail_next_archive("rate limited");

    let report = monitor.run_scan(ts(hours(73))).expect("scan");
    assert_eq!((report.claimed, report.failed, report.archived), (1, 1, 0));
    let thread = monitor.thread("t-1").expect("load").expect("thread");
    assert_eq!(thread.state, ThreadState::TriageRequested);
    assert_eq!(thread.archive_attempts, 1);
    assert!(thread
        .last_error
        .as_deref()
        .is_some_and(|error| error.contains("rate limited")));

    let report = monitor.run_scan(ts(hours(74))).expect("retry");
    assert_eq!(report.archived, 1);
    let thread = monitor.thread("t-1").expect("load").expect("thread");
    assert_eq!(thread.state, ThreadState::Archived);
    assert_eq!(thread.archive_attempts, 2);
    assert_eq!(thread.last_error, None);
    assert_eq!(gateway.archive_calls().len(), 2);
}

#[test]
fn failed_triage_post_is_retried_by_scan() {
    let (monitor, gateway, _) = setup();
    gateway.fail_next_post("bridge offline");

    let (outcome, triage) = monitor
        .on_thread_created(&ThreadCreated {
            thread_id: "t-1".to_string(),
            tag: "BUG".to_string(),
            owner_id: None,
            ts: ts(0),
        })
        .expect("created");
    assert_eq!(outcome, CreatedOutcome::Registered);
    assert_eq!(triage, Some(TriageOutcome::Failed));
    let thread = monitor.thread("t-1").expect("load").expect("thread");
    assert_eq!(thread.state, ThreadState::Open);
    assert!(monitor.due_for_archive(ts(hours(100))).expect("due").is_empty());

    let report = monitor.run_scan(ts(hours(1))).expect("scan");
    assert_eq!(report.triage_pending, 1);
    assert_eq!(report.triage_posted, 1);
    assert_eq!(gateway.post_count(), 2);
    let thread = monitor.thread("t-1").expect("load").expect("thread");
    assert_eq!(thread.state, ThreadState::TriageRequested);
}

#[test]
fn late_triage_post_restarts_the_inactivity_clock() {
    let (monitor, gateway, _) = setup();
    gateway.fail_next_post("bridge offline");
    create(&monitor, "t-1");

    let report = monitor.run_scan(ts(hours(73))).expect("scan");
    assert_eq!(report.triage_posted, 1);
    assert_eq!((report.due, report.archived), (0, 0));
    assert!(gateway.archive_calls().is_empty());
    let thread = monitor.thread("t-1").expect("load").expect("thread");
    assert_eq!(thread.state, ThreadState::TriageRequested);
    assert_eq!(thread.last_activity_at, ts(hours(73)));

    assert_eq!(monitor.run_scan(ts(hours(144))).expect("scan").archived, 0);
    assert_eq!(monitor.run_scan(ts(hours(145))).expect("scan").archived, 1);
    assert_eq!(gateway.archive_calls().len(), 1);
}

#[test]
fn overlapping_scan_cannot_claim_a_thread_in_flight() {
    let (monitor, gateway, store) = setup();
    create(&monitor, "t-1");

    let second = Arc::new(ThreadLifecycleMonitor::new(
        store,
        gateway.clone(),
        config("scan-b"),
    ));
    let nested_reports: Arc<Mutex<Vec<ScanReport>>> = Arc::default();
    {
        let second = Arc::clone(&second);
        let nested_reports = Arc::clone(&nested_reports);
        let hook: Box<dyn Fn() + Send + Sync> = Box::new(move || {
            let report = second.run_scan(ts(hours(73))).expect("nested scan");
            nested_reports.lock().expect("reports").push(report);
        });
        assert!(gateway.during_archive.set(hook).is_ok());
    }

    let report = monitor.run_scan(ts(hours(73))).expect("scan");
    assert_eq!(report.archived, 1);

    let nested = nested_reports.lock().expect("reports");
    assert_eq!(nested.len(), 1);
    assert_eq!(nested[0].due, 1);
    assert_eq!(nested[0].claimed, 0);
    assert_eq!(nested[0].skipped, 1);
    assert_eq!(gateway.archive_calls().len(), 1);
}

#[test]
fn state_survives_reopening_the_database() {
    let file = NamedTempFile::new().expect("temp db");
    {
        let store = SharedStore::new(HelpdeskStore::open(file.path()).expect("open"));
        let monitor = ThreadLifecycleMonitor::new(
            store,
            Arc::new(ScriptedGateway::default()),
            config("scan-a"),
        );
        create(&monitor, "t-1");
        monitor
            .set_triage_template("Hello @MENTION")
            .expect("template");
    }

    let store = SharedStore::new(HelpdeskStore::open(file.path()).expect("reopen"));
    let gateway = Arc::new(ScriptedGateway::default());
    let monitor = ThreadLifecycleMonitor::new(store, gateway.clone(), config("scan-c"));
    assert_eq!(
        monitor.triage_template().expect("template"),
        "Hello @MENTION"
    );
    assert_eq!(monitor.run_scan(ts(hours(73))).expect("scan").archived, 1);
    assert_eq!(gateway.archive_calls().len(), 1);
}
