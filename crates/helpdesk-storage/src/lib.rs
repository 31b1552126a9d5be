use chrono::{DateTime, Duration, SecondsFormat, Utc};
use helpdesk_core::{HitRecord, NodeCounts, OutcomeKind, ThreadState, WatchedThread};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

pub const HELPDESK_SCHEMA_VERSION: i64 = 2;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unknown stored value: {0}")]
    UnknownValue(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("store lock poisoned")]
    Poisoned,
}

pub struct HelpdeskStore {
    conn: Connection,
}

impl HelpdeskStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let mut current = self.schema_version()?;
        if current > HELPDESK_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: HELPDESK_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_outcome_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
            current = 1;
        }

        if current < 2 {
            let sql = include_str!("../migrations/0002_watched_threads.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 2", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    /// Appends the hit and bumps its counter in one transaction; durable once this returns.
    pub fn record_hit(&self, record: &HitRecord) -> Result<(), StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        let ts = format_ts(record.ts);
        tx.execute(
            "
            INSERT INTO hit_events (node_id, outcome_kind, session_id, ts, resolution_tag)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
            params![
                record.node_id,
                record.kind.as_str(),
                record.session_id,
                ts,
                record.resolution_tag,
            ],
        )?;
        tx.execute(
            "
            INSERT INTO node_counters (node_id, outcome_kind, count, updated_at)
            VALUES (?1, ?2, 1, ?3)
            ON CONFLICT(node_id, outcome_kind) DO UPDATE SET
                count = count + 1,
                updated_at = excluded.updated_at
            ",
            params![record.node_id, record.kind.as_str(), ts],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn counts_for(&self, node_id: &str) -> Result<NodeCounts, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT outcome_kind, count
            FROM node_counters
            WHERE node_id = ?1
            ",
        )?;
        let rows = statement.query_map([node_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = NodeCounts::default();
        for row in rows {
            let (kind, count) = row?;
            counts.add(parse_outcome_kind(&kind)?, count.max(0) as u64);
        }
        Ok(counts)
    }

    pub fn all_counts(&self) -> Result<BTreeMap<String, NodeCounts>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT node_id, outcome_kind, count
            FROM node_counters
            ORDER BY node_id ASC
            ",
        )?;
        let rows = statement.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut all = BTreeMap::<String, NodeCounts>::new();
        for row in rows {
            let (node_id, kind, count) = row?;
            all.entry(node_id)
                .or_default()
                .add(parse_outcome_kind(&kind)?, count.max(0) as u64);
        }
        Ok(all)
    }

    pub fn hit_events_for_session(&self, session_id: &str) -> Result<Vec<HitRecord>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT node_id, outcome_kind, session_id, ts, resolution_tag
            FROM hit_events
            WHERE session_id = ?1
            ORDER BY seq ASC
            ",
        )?;
        let rows = statement.query_map([session_id], |row| {
            let kind: String = row.get(1)?;
            let kind = parse_outcome_kind(&kind).map_err(|err| conversion_error(1, err))?;
            let ts = parse_timestamp(row.get::<_, String>(3)?)
                .map_err(|err| conversion_error(3, err))?;
            Ok(HitRecord {
                node_id: row.get(0)?,
                kind,
                session_id: row.get(2)?,
                ts,
                resolution_tag: row.get(4)?,
            })
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    pub fn hit_event_count(&self) -> Result<i64, StorageError> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM hit_events", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn setting(&self, key: &str) -> Result<Option<String>, StorageError> {
        let value = self
            .conn
            .query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete_setting(&self, key: &str) -> Result<bool, StorageError> {
        let changes = self
            .conn
            .execute("DELETE FROM settings WHERE key = ?1", [key])?;
        Ok(changes > 0)
    }

    /// Returns false when the thread is already known; the stored row is left untouched.
    pub fn insert_watched_thread(&self, thread: &WatchedThread) -> Result<bool, StorageError> {
        let changes = self.conn.execute(
            "
            INSERT OR IGNORE INTO watched_threads (
                thread_id,
                tag,
                owner_id,
                state,
                created_at,
                last_activity_at,
                archive_attempts,
                last_error,
                archived_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ",
            params![
                thread.thread_id,
                thread.tag,
                thread.owner_id,
                thread.state.as_str(),
                format_ts(thread.created_at),
                format_ts(thread.last_activity_at),
                i64::from(thread.archive_attempts),
                thread.last_error,
                thread.archived_at.map(format_ts),
            ],
        )?;
        Ok(changes > 0)
    }

    pub fn watched_thread(&self, thread_id: &str) -> Result<Option<WatchedThread>, StorageError> {
        let thread = self
            .conn
            .query_row(
                &format!("SELECT {THREAD_COLUMNS} FROM watched_threads WHERE thread_id = ?1"),
                [thread_id],
                thread_from_row,
            )
            .optional()?;
        Ok(thread)
    }

    pub fn threads_in_state(&self, state: ThreadState) -> Result<Vec<WatchedThread>, StorageError> {
        let mut statement = self.conn.prepare(&format!(
            "
            SELECT {THREAD_COLUMNS}
            FROM watched_threads
            WHERE state = ?1
            ORDER BY created_at ASC, thread_id ASC
            "
        ))?;
        let rows = statement.query_map([state.as_str()], thread_from_row)?;
        collect_rows(rows)
    }

    /// `triage-requested` threads idle since `cutoff` or earlier, oldest activity first.
    pub fn threads_idle_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WatchedThread>, StorageError> {
        let mut statement = self.conn.prepare(&format!(
            "
            SELECT {THREAD_COLUMNS}
            FROM watched_threads
            WHERE state = 'triage-requested' AND last_activity_at <= ?1
            ORDER BY last_activity_at ASC, thread_id ASC
            "
        ))?;
        let rows = statement.query_map([format_ts(cutoff)], thread_from_row)?;
        collect_rows(rows)
    }

    pub fn thread_count(&self, state: ThreadState) -> Result<i64, StorageError> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM watched_threads WHERE state = ?1",
            [state.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Check-and-set on a single thread's state.
    pub fn transition_thread(
        &self,
        thread_id: &str,
        from: ThreadState,
        to: ThreadState,
    ) -> Result<bool, StorageError> {
        let changes = self.conn.execute(
            "
            UPDATE watched_threads
            SET state = ?3, last_error = NULL
            WHERE thread_id = ?1 AND state = ?2
            ",
            params![thread_id, from.as_str(), to.as_str()],
        )?;
        Ok(changes > 0)
    }

    /// Moves the activity clock forward. Archived threads and older timestamps are ignored.
    pub fn touch_thread_activity(
        &self,
        thread_id: &str,
        ts: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let changes = self.conn.execute(
            "
            UPDATE watched_threads
            SET last_activity_at = ?2
            WHERE thread_id = ?1 AND state != 'archived' AND last_activity_at < ?2
            ",
            params![thread_id, format_ts(ts)],
        )?;
        Ok(changes > 0)
    }

    pub fn record_thread_error(&self, thread_id: &str, message: &str) -> Result<(), StorageError> {
        self.conn.execute(
            "UPDATE watched_threads SET last_error = ?2 WHERE thread_id = ?1",
            params![thread_id, message],
        )?;
        Ok(())
    }

    /// Takes the archive lease for a due thread. Only one owner can hold it until it
    /// expires, so overlapping scans never archive the same thread twice.
    pub fn claim_archive(
        &self,
        thread_id: &str,
        owner_id: &str,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
        lease_ttl: Duration,
    ) -> Result<bool, StorageError> {
        let changes = self.conn.execute(
            "
            UPDATE watched_threads
            SET lease_owner = ?2, lease_expires_at = ?3
            WHERE thread_id = ?1
              AND state = 'triage-requested'
              AND last_activity_at <= ?4
              AND (lease_expires_at IS NULL OR lease_expires_at <= ?5)
            ",
            params![
                thread_id,
                owner_id,
                format_ts(now + lease_ttl),
                format_ts(cutoff),
                format_ts(now),
            ],
        )?;
        Ok(changes > 0)
    }

    pub fn commit_archive(
        &self,
        thread_id: &str,
        owner_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let changes = self.conn.execute(
            "
            UPDATE watched_threads
            SET state = 'archived',
                archived_at = ?3,
                archive_attempts = archive_attempts + 1,
                last_error = NULL,
                lease_owner = NULL,
                lease_expires_at = NULL
            WHERE thread_id = ?1 AND state = 'triage-requested' AND lease_owner = ?2
            ",
            params![thread_id, owner_id, format_ts(now)],
        )?;
        Ok(changes > 0)
    }

    pub fn release_archive_claim(
        &self,
        thread_id: &str,
        owner_id: &str,
        error: &str,
    ) -> Result<bool, StorageError> {
        let changes = self.conn.execute(
            "
            UPDATE watched_threads
            SET archive_attempts = archive_attempts + 1,
                last_error = ?3,
                lease_owner = NULL,
                lease_expires_at = NULL
            WHERE thread_id = ?1 AND lease_owner = ?2
            ",
            params![thread_id, owner_id, error],
        )?;
        Ok(changes > 0)
    }

    /// Lease on an `open` thread while its triage post is in flight.
    pub fn claim_triage(
        &self,
        thread_id: &str,
        owner_id: &str,
        now: DateTime<Utc>,
        lease_ttl: Duration,
    ) -> Result<bool, StorageError> {
        let changes = self.conn.execute(
            "
            UPDATE watched_threads
            SET lease_owner = ?2, lease_expires_at = ?3
            WHERE thread_id = ?1
              AND state = 'open'
              AND (lease_expires_at IS NULL OR lease_expires_at <= ?4)
            ",
            params![
                thread_id,
                owner_id,
                format_ts(now + lease_ttl),
                format_ts(now),
            ],
        )?;
        Ok(changes > 0)
    }

    /// Moves a claimed `open` thread to `triage-requested`. The triage post counts as
    /// activity, so the inactivity clock starts no earlier than `posted_at`.
    pub fn commit_triage(
        &self,
        thread_id: &str,
        owner_id: &str,
        posted_at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let changes = self.conn.execute(
            "
            UPDATE watched_threads
            SET state = 'triage-requested',
                last_activity_at = MAX(last_activity_at, ?3),
                last_error = NULL,
                lease_owner = NULL,
                lease_expires_at = NULL
            WHERE thread_id = ?1 AND state = 'open' AND lease_owner = ?2
            ",
            params![thread_id, owner_id, format_ts(posted_at)],
        )?;
        Ok(changes > 0)
    }

    pub fn release_triage_claim(
        &self,
        thread_id: &str,
        owner_id: &str,
        error: &str,
    ) -> Result<bool, StorageError> {
        let changes = self.conn.execute(
            "
            UPDATE watched_threads
            SET last_error = ?3, lease_owner = NULL, lease_expires_at = NULL
            WHERE thread_id = ?1 AND state = 'open' AND lease_owner = ?2
            ",
            params![thread_id, owner_id, error],
        )?;
        Ok(changes > 0)
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "
                SELECT 1
                FROM sqlite_master
                WHERE type='table' AND name = ?1
                LIMIT 1
                ",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }
}

/// Cloneable handle that serializes access to one connection, locking per call.
#[derive(Clone)]
pub struct SharedStore {
    inner: Arc<Mutex<HelpdeskStore>>,
}

impl SharedStore {
    pub fn new(store: HelpdeskStore) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    pub fn with<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&HelpdeskStore) -> Result<T, StorageError>,
    {
        let guard = self.inner.lock().map_err(|_| StorageError::Poisoned)?;
        f(&guard)
    }
}

const THREAD_COLUMNS: &str = "thread_id, tag, owner_id, state, created_at, last_activity_at, \
     archive_attempts, last_error, archived_at";

fn thread_from_row(row: &Row<'_>) -> rusqlite::Result<WatchedThread> {
    let state: String = row.get(3)?;
    let state = state
        .parse::<ThreadState>()
        .map_err(|err| conversion_error(3, StorageError::UnknownValue(err)))?;
    let created_at =
        parse_timestamp(row.get::<_, String>(4)?).map_err(|err| conversion_error(4, err))?;
    let last_activity_at =
        parse_timestamp(row.get::<_, String>(5)?).map_err(|err| conversion_error(5, err))?;
    let archived_at = row
        .get::<_, Option<String>>(8)?
        .map(parse_timestamp)
        .transpose()
        .map_err(|err| conversion_error(8, err))?;

    Ok(WatchedThread {
        thread_id: row.get(0)?,
        tag: row.get(1)?,
        owner_id: row.get(2)?,
        state,
        created_at,
        last_activity_at,
        archive_attempts: row.get::<_, i64>(6)?.clamp(0, i64::from(u32::MAX)) as u32,
        last_error: row.get(7)?,
        archived_at,
    })
}

fn collect_rows<I>(rows: I) -> Result<Vec<WatchedThread>, StorageError>
where
    I: Iterator<Item = rusqlite::Result<WatchedThread>>,
{
    let mut threads = Vec::new();
    for row in rows {
        threads.push(row?);
    }
    Ok(threads)
}

fn conversion_error(column: usize, err: StorageError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(err))
}

fn parse_outcome_kind(value: &str) -> Result<OutcomeKind, StorageError> {
    value.parse::<OutcomeKind>().map_err(StorageError::UnknownValue)
}

/// Fixed-width UTC form so that SQL string comparison orders like time.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(value: String) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(err.to_string()))
}
