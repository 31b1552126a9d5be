use helpdesk_core::{HitRecord, NodeCounts};
use helpdesk_storage::{SharedStore, StorageError};
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("recorder unavailable: {0}")]
    Unavailable(String),
}

/// Durable sink for traversal events plus the aggregate counters derived from them.
pub trait OutcomeRecorder: Send + Sync {
    fn record(&self, record: &HitRecord) -> Result<(), RecorderError>;

    fn counts_for(&self, node_id: &str) -> Result<NodeCounts, RecorderError>;

    fn all_counts(&self) -> Result<BTreeMap<String, NodeCounts>, RecorderError>;
}

/// Write-through recorder backed by the sqlite store.
#[derive(Clone)]
pub struct StoreRecorder {
    store: SharedStore,
}

impl StoreRecorder {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }
}

impl OutcomeRecorder for StoreRecorder {
    fn record(&self, record: &HitRecord) -> Result<(), RecorderError> {
        self.store.with(|store| store.record_hit(record))?;
        Ok(())
    }

    fn counts_for(&self, node_id: &str) -> Result<NodeCounts, RecorderError> {
        Ok(self.store.with(|store| store.counts_for(node_id))?)
    }

    fn all_counts(&self) -> Result<BTreeMap<String, NodeCounts>, RecorderError> {
        Ok(self.store.with(|store| store.all_counts())?)
    }
}

#[derive(Debug, Default)]
struct MemoryLog {
    records: Vec<HitRecord>,
    counts: BTreeMap<String, NodeCounts>,
}

#[derive(Debug, Default)]
pub struct MemoryRecorder {
    inner: Mutex<MemoryLog>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record accepted so far, in write order.
    pub fn records(&self) -> Vec<HitRecord> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .records
            .clone()
    }
}

impl OutcomeRecorder for MemoryRecorder {
    fn record(&self, record: &HitRecord) -> Result<(), RecorderError> {
        let mut log = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        log.counts
            .entry(record.node_id.clone())
            .or_default()
            .add(record.kind, 1);
        log.records.push(record.clone());
        Ok(())
    }

    fn counts_for(&self, node_id: &str) -> Result<NodeCounts, RecorderError> {
        let log = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(log.counts.get(node_id).copied().unwrap_or_default())
    }

    fn all_counts(&self) -> Result<BTreeMap<String, NodeCounts>, RecorderError> {
        let log = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(log.counts.clone())
    }
}
