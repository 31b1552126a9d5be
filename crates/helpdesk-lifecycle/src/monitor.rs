use chrono::{DateTime, Duration, Utc};
use helpdesk_core::{
    closing_notice, mention_for, normalize_template_input, render_triage_message, ArchiveRequest,
    ForumGateway, ThreadActivity, ThreadCreated, ThreadState, TriagePost, WatchedThread,
    DEFAULT_TRIAGE_TEMPLATE,
};
use helpdesk_storage::{SharedStore, StorageError};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const TRIAGE_TEMPLATE_KEY: &str = "triage_message";

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("triage template must not be empty")]
    EmptyTemplate,
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Tag that puts a new thread under watch. Compared case-insensitively.
    pub watched_tag: String,
    pub ongoing_tag: String,
    pub done_tag: String,
    pub inactivity_threshold: Duration,
    pub lease_ttl: Duration,
    /// Lease owner written by this process.
    pub owner_id: String,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            watched_tag: "bug".to_string(),
            ongoing_tag: "ongoing".to_string(),
            done_tag: "done".to_string(),
            inactivity_threshold: Duration::hours(24),
            lease_ttl: Duration::seconds(120),
            owner_id: format!("helpdesk-{}", std::process::id()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CreatedOutcome {
    /// Tag did not match the watched tag.
    Ignored,
    Duplicate,
    Registered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriageOutcome {
    Posted,
    Failed,
    /// Already past `open`, unknown, or another caller holds the lease.
    Skipped,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub triage_pending: usize,
    pub triage_posted: usize,
    pub triage_failed: usize,
    pub due: usize,
    pub claimed: usize,
    pub archived: usize,
    pub failed: usize,
    pub skipped: usize,
}

pub struct ThreadLifecycleMonitor {
    store: SharedStore,
    gateway: Arc<dyn ForumGateway>,
    config: LifecycleConfig,
}

impl ThreadLifecycleMonitor {
    pub fn new(
        store: SharedStore,
        gateway: Arc<dyn ForumGateway>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            config,
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn watches(&self, tag: &str) -> bool {
        tag.trim()
            .eq_ignore_ascii_case(self.config.watched_tag.trim())
    }

    /// Starts watching a thread in `open`. Redelivered events leave the stored row alone.
    pub fn register(&self, event: &ThreadCreated) -> Result<CreatedOutcome, LifecycleError> {
        if !self.watches(&event.tag) {
            debug!(
                event = "thread_ignored",
                thread_id = %event.thread_id,
                tag = %event.tag,
            );
            return Ok(CreatedOutcome::Ignored);
        }

        let thread = WatchedThread {
            thread_id: event.thread_id.clone(),
            tag: event.tag.clone(),
            owner_id: event.owner_id.clone(),
            state: ThreadState::Open,
            created_at: event.ts,
            last_activity_at: event.ts,
            archive_attempts: 0,
            last_error: None,
            archived_at: None,
        };
        if !self.store.with(|store| store.insert_watched_thread(&thread))? {
            return Ok(CreatedOutcome::Duplicate);
        }
        info!(
            event = "thread_registered",
            thread_id = %thread.thread_id,
            tag = %thread.tag,
        );
        Ok(CreatedOutcome::Registered)
    }

    /// Posts the triage template into an `open` thread and moves it to `triage-requested`.
    /// A successful post restarts the inactivity clock at `now`.
    pub fn request_triage(
        &self,
        thread_id: &str,
        now: DateTime<Utc>,
    ) -> Result<TriageOutcome, LifecycleError> {
        let Some(thread) = self.store.with(|store| store.watched_thread(thread_id))? else {
            return Ok(TriageOutcome::Skipped);
        };
        let owner = &self.config.owner_id;
        let claimed = self
            .store
            .with(|store| store.claim_triage(thread_id, owner, now, self.config.lease_ttl))?;
        if !claimed {
            return Ok(TriageOutcome::Skipped);
        }

        let template = match self.triage_template() {
            Ok(template) => template,
            Err(err) => {
                self.store.with(|store| {
                    store.release_triage_claim(thread_id, owner, &err.to_string())
                })?;
                return Err(err);
            }
        };
        let post = TriagePost {
            message: render_triage_message(&template, thread.owner_id.as_deref()),
            mention: thread.owner_id.as_deref().map(mention_for),
            apply_tag: Some(self.config.ongoing_tag.clone()),
        };

        match self.gateway.post_triage_template(thread_id, &post) {
            Ok(()) => {
                if !self
                    .store
                    .with(|store| store.commit_triage(thread_id, owner, now))?
                {
                    warn!(event = "triage_commit_lost", thread_id = %thread_id);
                    return Ok(TriageOutcome::Skipped);
                }
                info!(event = "triage_requested", thread_id = %thread_id);
                Ok(TriageOutcome::Posted)
            }
            Err(err) => {
                warn!(
                    event = "triage_post_failed",
                    thread_id = %thread_id,
                    error = %err,
                );
                self.store.with(|store| {
                    store.release_triage_claim(thread_id, owner, &err.to_string())
                })?;
                Ok(TriageOutcome::Failed)
            }
        }
    }

    pub fn on_thread_created(
        &self,
        event: &ThreadCreated,
    ) -> Result<(CreatedOutcome, Option<TriageOutcome>), LifecycleError> {
        let outcome = self.register(event)?;
        if outcome != CreatedOutcome::Registered {
            return Ok((outcome, None));
        }
        let triage = self.request_triage(&event.thread_id, event.ts)?;
        Ok((outcome, Some(triage)))
    }

    /// Returns whether the activity clock moved.
    pub fn on_thread_activity(&self, event: &ThreadActivity) -> Result<bool, LifecycleError> {
        let moved = self
            .store
            .with(|store| store.touch_thread_activity(&event.thread_id, event.ts))?;
        if moved {
            debug!(event = "thread_activity", thread_id = %event.thread_id);
        }
        Ok(moved)
    }

    pub fn due_for_archive(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<WatchedThread>, LifecycleError> {
        let cutoff = now - self.config.inactivity_threshold;
        Ok(self.store.with(|store| store.threads_idle_since(cutoff))?)
    }

    pub fn thread(&self, thread_id: &str) -> Result<Option<WatchedThread>, LifecycleError> {
        Ok(self.store.with(|store| store.watched_thread(thread_id))?)
    }

    /// One pass: retry pending triage posts, then archive every thread past the
    /// inactivity threshold. The store is never locked across a gateway call.
    pub fn run_scan(&self, now: DateTime<Utc>) -> Result<ScanReport, LifecycleError> {
        let mut report = ScanReport::default();

        let pending = self
            .store
            .with(|store| store.threads_in_state(ThreadState::Open))?;
        report.triage_pending = pending.len();
        for thread in &pending {
            match self.request_triage(&thread.thread_id, now)? {
                TriageOutcome::Posted => report.triage_posted += 1,
                TriageOutcome::Failed => report.triage_failed += 1,
                TriageOutcome::Skipped => {}
            }
        }

        let cutoff = now - self.config.inactivity_threshold;
        let due = self.store.with(|store| store.threads_idle_since(cutoff))?;
        report.due = due.len();
        let owner = &self.config.owner_id;
        let request = ArchiveRequest {
            tag: self.config.done_tag.clone(),
            remove_tag: Some(self.config.ongoing_tag.clone()),
            notice: closing_notice(self.config.inactivity_threshold.num_hours()),
        };

        for thread in &due {
            let thread_id = thread.thread_id.as_str();
            let claimed = self.store.with(|store| {
                store.claim_archive(thread_id, owner, cutoff, now, self.config.lease_ttl)
            })?;
            if !claimed {
                report.skipped += 1;
                continue;
            }
            report.claimed += 1;

            match self.gateway.archive_thread(thread_id, &request) {
                Ok(()) => {
                    if self
                        .store
                        .with(|store| store.commit_archive(thread_id, owner, now))?
                    {
                        report.archived += 1;
                        info!(
                            event = "thread_archived",
                            thread_id = %thread_id,
                            idle_since = %thread.last_activity_at,
                        );
                    } else {
                        warn!(event = "archive_commit_lost", thread_id = %thread_id);
                    }
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(
                        event = "archive_failed",
                        thread_id = %thread_id,
                        attempts = thread.archive_attempts + 1,
                        error = %err,
                    );
                    self.store.with(|store| {
                        store.release_archive_claim(thread_id, owner, &err.to_string())
                    })?;
                }
            }
        }

        if report.claimed > 0 || report.triage_pending > 0 {
            info!(
                event = "scan_complete",
                archived = report.archived,
                failed = report.failed,
                triage_posted = report.triage_posted,
            );
        }
        Ok(report)
    }

    pub fn triage_template(&self) -> Result<String, LifecycleError> {
        let stored = self.store.with(|store| store.setting(TRIAGE_TEMPLATE_KEY))?;
        Ok(stored.unwrap_or_else(|| DEFAULT_TRIAGE_TEMPLATE.to_string()))
    }

    /// Stores a new template; literal `\n` sequences become line breaks.
    pub fn set_triage_template(&self, raw: &str) -> Result<String, LifecycleError> {
        let template = normalize_template_input(raw);
        if template.trim().is_empty() {
            return Err(LifecycleError::EmptyTemplate);
        }
        self.store
            .with(|store| store.set_setting(TRIAGE_TEMPLATE_KEY, &template))?;
        info!(event = "triage_template_updated", length = template.len());
        Ok(template)
    }

    pub fn reset_triage_template(&self) -> Result<(), LifecycleError> {
        self.store
            .with(|store| store.delete_setting(TRIAGE_TEMPLATE_KEY))?;
        info!(event = "triage_template_reset");
        Ok(())
    }
}
