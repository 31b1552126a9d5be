use chrono::{DateTime, Duration, Utc};
use helpdesk_core::{
    DecisionTree, EndReason, HitRecord, NextStep, NodeKind, OptionLayout, Session, SessionKey,
    SessionState, TreeError, TreeNode,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::recorder::{OutcomeRecorder, RecorderError};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Moves allowed per session before it is aborted as a loop.
    pub max_steps: u32,
    pub idle_timeout: Duration,
    pub closed_retention: Duration,
    pub record_attempts: u32,
    /// Oldest queued records are dropped beyond this many.
    pub backlog_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: 64,
            idle_timeout: Duration::minutes(30),
            closed_retention: Duration::minutes(60),
            record_attempts: 3,
            backlog_limit: 10_000,
        }
    }
}

type SessionHandle = Arc<Mutex<Session>>;

struct SessionEntry {
    key: SessionKey,
    handle: SessionHandle,
}

#[derive(Default)]
struct SessionIndex {
    sessions: HashMap<String, SessionEntry>,
    active: HashMap<SessionKey, String>,
    generations: HashMap<SessionKey, u64>,
}

/// Owns every troubleshooting session. The index lock covers lookup and insert only and
/// is never held while waiting on a session lock; each session is stepped under its
/// own mutex.
pub struct SessionEngine {
    tree: Arc<DecisionTree>,
    recorder: Arc<dyn OutcomeRecorder>,
    config: EngineConfig,
    index: Mutex<SessionIndex>,
    backlog: Mutex<VecDeque<HitRecord>>,
}

impl SessionEngine {
    pub fn new(
        tree: Arc<DecisionTree>,
        recorder: Arc<dyn OutcomeRecorder>,
        config: EngineConfig,
    ) -> Self {
        Self {
            tree,
            recorder,
            config,
            index: Mutex::new(SessionIndex::default()),
            backlog: Mutex::new(VecDeque::new()),
        }
    }

    pub fn tree(&self) -> &DecisionTree {
        &self.tree
    }

    pub fn recorder(&self) -> &dyn OutcomeRecorder {
        self.recorder.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the caller's active session, or opens a new one at the root.
    pub fn start(
        &self,
        user_id: &str,
        context_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(Session, NextStep), EngineError> {
        let key = SessionKey::new(user_id, context_id);
        let root = self.tree.root().to_string();
        self.resume_or_open(key, &root, now)
    }

    /// Follows the edge labelled `label` from the session's current node.
    pub fn choose(
        &self,
        session_id: &str,
        label: &str,
        now: DateTime<Utc>,
    ) -> Result<NextStep, EngineError> {
        let handle = self.handle(session_id)?;
        let mut session = lock(&handle);
        ensure_active(&session)?;

        let current = self.tree.node(&session.current_node)?;
        let edge = current
            .edge(label)
            .ok_or_else(|| EngineError::InvalidChoice {
                node_id: current.id.clone(),
                label: label.to_string(),
            })?;

        let steps = session.steps.saturating_add(1);
        if steps > self.config.max_steps {
            close(&mut session, SessionState::TimedOut, EndReason::LoopDetected, now);
            warn!(
                event = "session_loop_detected",
                session_id = %session.session_id,
                node_id = %session.current_node,
                max_steps = self.config.max_steps,
            );
            return Err(EngineError::LoopDetected {
                session_id: session.session_id.clone(),
                max_steps: self.config.max_steps,
            });
        }

        let target = self
            .tree
            .node_at(edge.target)
            .ok_or_else(|| TreeError::NodeNotFound(format!("#{}", edge.target)))?;

        let previous = std::mem::replace(&mut session.current_node, target.id.clone());
        session.history.push(previous);
        session.steps = steps;
        session.last_interaction_at = now;

        let mut records = vec![HitRecord::visited(
            target.id.clone(),
            session.session_id.clone(),
            now,
        )];
        if let Some(tag) = target.resolution_tag() {
            close(&mut session, SessionState::Solved, EndReason::Solved, now);
            records.push(HitRecord::solved(
                target.id.clone(),
                tag,
                session.session_id.clone(),
                now,
            ));
            info!(
                event = "session_solved",
                session_id = %session.session_id,
                node_id = %target.id,
                steps = session.steps,
            );
        } else {
            debug!(
                event = "session_step",
                session_id = %session.session_id,
                node_id = %target.id,
                steps = session.steps,
            );
        }
        self.record_all(&records);

        self.step_for(&session)
    }

    pub fn abandon(&self, session_id: &str, now: DateTime<Utc>) -> Result<Session, EngineError> {
        self.end(session_id, EndReason::Abandoned, now)
    }

    /// Abandons the caller's active session, if any, and starts over at the root.
    pub fn restart(
        &self,
        user_id: &str,
        context_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(Session, NextStep), EngineError> {
        if let Some(active) = self.active_session(user_id, context_id) {
            match self.end(&active.session_id, EndReason::Restarted, now) {
                Ok(_) | Err(EngineError::SessionClosed { .. }) | Err(EngineError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        self.start(user_id, context_id, now)
    }

    /// "Still having issues": continues a solved session's user at the solution's
    /// fallback node. Any other active session for the same user and context is ended.
    pub fn follow_up(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(Session, NextStep), EngineError> {
        let handle = self.handle(session_id)?;
        let (key, node_id) = {
            let session = lock(&handle);
            match session.state {
                SessionState::Solved => {}
                SessionState::Active => {
                    return Err(EngineError::NoFollowUp {
                        node_id: session.current_node.clone(),
                    })
                }
                state => {
                    return Err(EngineError::SessionClosed {
                        session_id: session.session_id.clone(),
                        state,
                    })
                }
            }
            (
                SessionKey::new(&session.user_id, &session.context_id),
                session.current_node.clone(),
            )
        };

        let fallback = match &self.tree.node(&node_id)?.kind {
            NodeKind::Solution {
                did_not_help: Some(position),
                ..
            } => self
                .tree
                .node_at(*position)
                .ok_or_else(|| TreeError::NodeNotFound(format!("#{position}")))?,
            _ => return Err(EngineError::NoFollowUp { node_id }),
        };

        if let Some(active) = self.active_session(&key.user_id, &key.context_id) {
            match self.end(&active.session_id, EndReason::Restarted, now) {
                Ok(_) | Err(EngineError::SessionClosed { .. }) | Err(EngineError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        debug!(
            event = "session_follow_up",
            session_id = %session_id,
            from = %node_id,
            to = %fallback.id,
        );
        self.resume_or_open(key, &fallback.id, now)
    }

    /// Times out active sessions with no interaction for longer than the idle timeout.
    pub fn expire_idle(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut expired = Vec::new();
        for handle in self.handles() {
            let mut session = lock(&handle);
            if session.is_active() && now - session.last_interaction_at > self.config.idle_timeout
            {
                close(&mut session, SessionState::TimedOut, EndReason::Idle, now);
                expired.push(session.session_id.clone());
            }
        }
        if !expired.is_empty() {
            info!(event = "sessions_expired", count = expired.len());
        }
        expired
    }

    /// Forgets terminal sessions that ended more than `closed_retention` ago. Sessions
    /// busy in another call are left for the next sweep.
    pub fn evict_closed(&self, now: DateTime<Utc>) -> usize {
        let retention = self.config.closed_retention;
        let candidates: Vec<(String, SessionHandle)> = lock(&self.index)
            .sessions
            .iter()
            .map(|(session_id, entry)| (session_id.clone(), Arc::clone(&entry.handle)))
            .collect();

        let expired: Vec<String> = candidates
            .into_iter()
            .filter(|(_, handle)| match handle.try_lock() {
                Ok(session) => retention_elapsed(&session, now, retention),
                Err(TryLockError::Poisoned(poisoned)) => {
                    retention_elapsed(&poisoned.into_inner(), now, retention)
                }
                Err(TryLockError::WouldBlock) => false,
            })
            .map(|(session_id, _)| session_id)
            .collect();
        if expired.is_empty() {
            return 0;
        }

        let mut index = lock(&self.index);
        let SessionIndex {
            sessions,
            active,
            generations,
        } = &mut *index;
        let mut evicted = 0;
        for session_id in &expired {
            if sessions.remove(session_id).is_some() {
                evicted += 1;
            }
        }
        active.retain(|_, session_id| sessions.contains_key(session_id));
        let live: HashSet<&SessionKey> = sessions.values().map(|entry| &entry.key).collect();
        generations.retain(|key, _| live.contains(key));
        evicted
    }

    pub fn session(&self, session_id: &str) -> Result<Session, EngineError> {
        let handle = self.handle(session_id)?;
        let session = lock(&handle).clone();
        Ok(session)
    }

    pub fn active_session(&self, user_id: &str, context_id: &str) -> Option<Session> {
        let key = SessionKey::new(user_id, context_id);
        let handle = {
            let index = lock(&self.index);
            let session_id = index.active.get(&key)?;
            Arc::clone(&index.sessions.get(session_id)?.handle)
        };
        let session = lock(&handle);
        session.is_active().then(|| session.clone())
    }

    pub fn session_count(&self) -> usize {
        lock(&self.index).sessions.len()
    }

    pub fn backlog_len(&self) -> usize {
        lock(&self.backlog).len()
    }

    /// Retries queued records in order, stopping at the first failure.
    pub fn flush_backlog(&self) -> Result<usize, RecorderError> {
        let mut backlog = lock(&self.backlog);
        let mut flushed = 0;
        while let Some(record) = backlog.front() {
            if let Err(err) = self.write_with_retry(record) {
                warn!(
                    event = "backlog_flush_failed",
                    pending = backlog.len(),
                    error = %err,
                );
                return Err(err);
            }
            backlog.pop_front();
            flushed += 1;
        }
        if flushed > 0 {
            info!(event = "backlog_flushed", count = flushed);
        }
        Ok(flushed)
    }

    fn end(
        &self,
        session_id: &str,
        reason: EndReason,
        now: DateTime<Utc>,
    ) -> Result<Session, EngineError> {
        let handle = self.handle(session_id)?;
        let mut session = lock(&handle);
        ensure_active(&session)?;
        close(&mut session, SessionState::Abandoned, reason, now);
        info!(
            event = "session_abandoned",
            session_id = %session.session_id,
            reason = ?reason,
        );
        Ok(session.clone())
    }

    fn handle(&self, session_id: &str) -> Result<SessionHandle, EngineError> {
        lock(&self.index)
            .sessions
            .get(session_id)
            .map(|entry| Arc::clone(&entry.handle))
            .ok_or_else(|| EngineError::NotFound(session_id.to_string()))
    }

    fn handles(&self) -> Vec<SessionHandle> {
        lock(&self.index)
            .sessions
            .values()
            .map(|entry| Arc::clone(&entry.handle))
            .collect()
    }

    /// Returns the key's active session, or opens one at `entry_id`. A session found in
    /// the index is locked only after the index lock is released; one that turns out to
    /// have ended is skipped on the next pass.
    fn resume_or_open(
        &self,
        key: SessionKey,
        entry_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(Session, NextStep), EngineError> {
        let entry = self.tree.node(entry_id)?;
        let mut ended: Option<String> = None;
        loop {
            let mut index = lock(&self.index);
            let existing = index
                .active
                .get(&key)
                .filter(|session_id| ended.as_deref() != Some(session_id.as_str()))
                .and_then(|session_id| index.sessions.get(session_id))
                .map(|found| Arc::clone(&found.handle));
            if let Some(handle) = existing {
                drop(index);
                let session = lock(&handle);
                if session.is_active() {
                    let snapshot = session.clone();
                    drop(session);
                    let step = self.step_for(&snapshot)?;
                    return Ok((snapshot, step));
                }
                ended = Some(session.session_id.clone());
                continue;
            }

            let generation = index.generations.entry(key.clone()).or_insert(0);
            let session_id = key.session_id(now, *generation);
            *generation += 1;

            let mut session = Session {
                session_id: session_id.clone(),
                user_id: key.user_id.clone(),
                context_id: key.context_id.clone(),
                state: SessionState::Active,
                current_node: entry.id.clone(),
                history: Vec::new(),
                started_at: now,
                last_interaction_at: now,
                steps: 0,
                end_reason: None,
                ended_at: None,
            };
            let mut records = vec![HitRecord::visited(
                entry.id.clone(),
                session_id.clone(),
                now,
            )];
            if let Some(tag) = entry.resolution_tag() {
                close(&mut session, SessionState::Solved, EndReason::Solved, now);
                records.push(HitRecord::solved(
                    entry.id.clone(),
                    tag,
                    session_id.clone(),
                    now,
                ));
            }

            let handle = Arc::new(Mutex::new(session));
            // Fresh handle: nobody else can hold it yet.
            let session = lock(&handle);
            if session.is_active() {
                index.active.insert(key.clone(), session_id.clone());
            } else {
                index.active.remove(&key);
            }
            index.sessions.insert(
                session_id.clone(),
                SessionEntry {
                    key: key.clone(),
                    handle: Arc::clone(&handle),
                },
            );
            drop(index);

            info!(
                event = "session_started",
                session_id = %session_id,
                user_id = %key.user_id,
                context_id = %key.context_id,
                node_id = %entry.id,
            );
            self.record_all(&records);

            let snapshot = session.clone();
            drop(session);
            let step = self.step_for(&snapshot)?;
            return Ok((snapshot, step));
        }
    }

    fn step_for(&self, session: &Session) -> Result<NextStep, EngineError> {
        let node = self.tree.node(&session.current_node)?;
        Ok(next_step(&self.tree, node, &session.session_id))
    }

    /// Writes one transition's records in order. Once anything is queued, every later
    /// record queues behind it.
    fn record_all(&self, records: &[HitRecord]) {
        {
            let mut backlog = lock(&self.backlog);
            if !backlog.is_empty() {
                self.enqueue(&mut backlog, records);
                return;
            }
        }

        for (position, record) in records.iter().enumerate() {
            if let Err(err) = self.write_with_retry(record) {
                warn!(
                    event = "record_failed",
                    session_id = %record.session_id,
                    node_id = %record.node_id,
                    kind = %record.kind,
                    attempts = self.config.record_attempts.max(1),
                    error = %err,
                );
                self.enqueue(&mut lock(&self.backlog), &records[position..]);
                return;
            }
        }
    }

    fn enqueue(&self, backlog: &mut VecDeque<HitRecord>, records: &[HitRecord]) {
        backlog.extend(records.iter().cloned());
        let limit = self.config.backlog_limit.max(1);
        if backlog.len() > limit {
            let dropped = backlog.len() - limit;
            backlog.drain(..dropped);
            warn!(event = "backlog_overflow", dropped, limit);
        }
    }

    fn write_with_retry(&self, record: &HitRecord) -> Result<(), RecorderError> {
        let attempts = self.config.record_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.recorder.record(record) {
                Ok(()) => return Ok(()),
                Err(err) if attempt >= attempts => return Err(err),
                Err(err) => {
                    debug!(event = "record_retry", attempt, error = %err);
                    attempt += 1;
                }
            }
        }
    }
}

fn next_step(tree: &DecisionTree, node: &TreeNode, session_id: &str) -> NextStep {
    match &node.kind {
        NodeKind::Question { edges } => NextStep::Question {
            session_id: session_id.to_string(),
            node_id: node.id.clone(),
            prompt: node.prompt.clone(),
            options: edges.iter().map(|edge| edge.label.clone()).collect(),
            layout: OptionLayout::for_option_count(edges.len()),
        },
        NodeKind::Solution {
            resolution_tag,
            collect,
            did_not_help,
        } => NextStep::Solved {
            session_id: session_id.to_string(),
            node_id: node.id.clone(),
            prompt: node.prompt.clone(),
            resolution_tag: resolution_tag.clone(),
            collect: collect.clone(),
            did_not_help: did_not_help
                .and_then(|position| tree.node_at(position))
                .map(|fallback| fallback.id.clone()),
        },
    }
}

fn ensure_active(session: &Session) -> Result<(), EngineError> {
    if session.state.is_terminal() {
        return Err(EngineError::SessionClosed {
            session_id: session.session_id.clone(),
            state: session.state,
        });
    }
    Ok(())
}

fn retention_elapsed(session: &Session, now: DateTime<Utc>, retention: Duration) -> bool {
    match session.ended_at {
        Some(ended_at) if session.state.is_terminal() => now - ended_at >= retention,
        _ => false,
    }
}

fn close(session: &mut Session, state: SessionState, reason: EndReason, now: DateTime<Utc>) {
    session.state = state;
    session.end_reason = Some(reason);
    session.ended_at = Some(now);
    session.last_interaction_at = now;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
