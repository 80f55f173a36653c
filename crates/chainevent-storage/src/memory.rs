//! In-memory storage backend.
//!
//! Keeps records and cursors in RAM. Useful for tests and short-lived runs
//! that don't need persistence.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use chainevent_core::error::StoreError;
use chainevent_core::store::{CursorKind, CursorStore, RecordStore};
use chainevent_core::types::{Record, StoredRecord};

#[derive(Default)]
struct AliasLog {
    records: BTreeMap<u64, Record>,
    by_identity: HashMap<(String, u64), u64>,
    last_id: u64,
}

/// In-memory record and cursor store.
///
/// Ids start at 1 per alias. All data is lost when the process exits.
#[derive(Default)]
pub struct MemoryStore {
    logs: Mutex<HashMap<String, AliasLog>>,
    cursors: Mutex<HashMap<(String, CursorKind), u64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>, StoreError> {
    m.lock()
        .map_err(|_| StoreError::Backend("memory store lock poisoned".into()))
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn insert_record(&self, alias: &str, record: &Record) -> Result<u64, StoreError> {
        let mut logs = lock(&self.logs)?;
        let log = logs.entry(alias.to_string()).or_default();

        let identity = (record.tx_hash.clone(), record.log_index);
        if let Some(id) = log.by_identity.get(&identity) {
            return Ok(*id);
        }

        log.last_id += 1;
        let id = log.last_id;
        log.records.insert(id, record.clone());
        log.by_identity.insert(identity, id);
        Ok(id)
    }

    async fn list_records(
        &self,
        alias: &str,
        after_id: u64,
        limit: usize,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let logs = lock(&self.logs)?;
        let Some(log) = logs.get(alias) else {
            return Ok(Vec::new());
        };
        Ok(log
            .records
            .range(after_id.saturating_add(1)..)
            .take(limit)
            .map(|(id, record)| StoredRecord {
                id: *id,
                record: record.clone(),
            })
            .collect())
    }

    async fn record_count(&self, alias: &str) -> Result<u64, StoreError> {
        let logs = lock(&self.logs)?;
        Ok(logs.get(alias).map_or(0, |log| log.records.len() as u64))
    }
}

#[async_trait]
impl CursorStore for MemoryStore {
    async fn cursor(&self, alias: &str, kind: CursorKind) -> Result<Option<u64>, StoreError> {
        let cursors = lock(&self.cursors)?;
        Ok(cursors.get(&(alias.to_string(), kind)).copied())
    }

    async fn advance_cursor(
        &self,
        alias: &str,
        kind: CursorKind,
        value: u64,
    ) -> Result<(), StoreError> {
        let mut cursors = lock(&self.cursors)?;
        cursors
            .entry((alias.to_string(), kind))
            .and_modify(|current| *current = (*current).max(value))
            .or_insert(value);
        Ok(())
    }
}
