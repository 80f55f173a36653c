//! Storage contract for records and cursors.
//!
//! Records are append-only and deduplicated on `(alias, tx_hash, log_index)`.
//! Cursors are per-alias counters that only move forward: the read cursor is
//! the last block fully scanned, the notify cursor the highest local id
//! delivered to the webhook.
//!
//! Implementations live in `chainevent-storage` (`MemoryStore`, `SqliteStore`).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::StoreError;
use crate::types::{Record, StoredRecord};

/// Which of a subscription's two cursors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CursorKind {
    /// Last block number fully scanned.
    Read,
    /// Highest record id delivered.
    Notify,
}

impl CursorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CursorKind::Read => "read",
            CursorKind::Notify => "notify",
        }
    }
}

impl fmt::Display for CursorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only record log, partitioned by alias.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Stores `record` and returns its local id.
    ///
    /// Inserting a record whose `(tx_hash, log_index)` already exists under
    /// `alias` is not an error: the existing id is returned and nothing is
    /// written.
    async fn insert_record(&self, alias: &str, record: &Record) -> Result<u64, StoreError>;

    /// Records with `id > after_id`, ascending, at most `limit`.
    async fn list_records(
        &self,
        alias: &str,
        after_id: u64,
        limit: usize,
    ) -> Result<Vec<StoredRecord>, StoreError>;

    /// Number of records stored under `alias`.
    async fn record_count(&self, alias: &str) -> Result<u64, StoreError>;
}

/// Monotonic per-alias counters.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Current value, `None` if the cursor was never set.
    async fn cursor(&self, alias: &str, kind: CursorKind) -> Result<Option<u64>, StoreError>;

    /// Moves the cursor to `value` if it is greater than the stored value,
    /// creating it when absent. A lower or equal value is a silent no-op.
    async fn advance_cursor(
        &self,
        alias: &str,
        kind: CursorKind,
        value: u64,
    ) -> Result<(), StoreError>;

    async fn read_cursor(&self, alias: &str) -> Result<Option<u64>, StoreError> {
        self.cursor(alias, CursorKind::Read).await
    }

    async fn set_read_cursor(&self, alias: &str, block: u64) -> Result<(), StoreError> {
        self.advance_cursor(alias, CursorKind::Read, block).await
    }

    async fn notify_cursor(&self, alias: &str) -> Result<Option<u64>, StoreError> {
        self.cursor(alias, CursorKind::Notify).await
    }

    async fn set_notify_cursor(&self, alias: &str, id: u64) -> Result<(), StoreError> {
        self.advance_cursor(alias, CursorKind::Notify, id).await
    }
}

/// Everything a worker needs from storage.
pub trait EventStore: RecordStore + CursorStore {}

impl<T: RecordStore + CursorStore + ?Sized> EventStore for T {}
