//! SQLite storage backend.
//!
//! One `records` table partitioned by alias and one `cursors` table keyed by
//! `(alias, kind)`. Uses `sqlx` with WAL mode for concurrent read performance.
//!
//! # Usage
//! ```rust,no_run
//! use chainevent_storage::sqlite::SqliteStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStore::open("./chainevent.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStore::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use chainevent_core::error::StoreError;
use chainevent_core::store::{CursorKind, CursorStore, RecordStore};
use chainevent_core::types::{Record, StoredRecord};

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// SQLite-backed record and cursor store.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./chainevent.db"`) or a full
    /// SQLite URL (`"sqlite:./chainevent.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(backend)?;

        let store = Self { pool };
        store.init_schema(true).await?;
        Ok(store)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Pinned to a single connection that never expires, since every
    /// connection to `:memory:` is a separate database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(backend)?;

        let store = Self { pool };
        store.init_schema(false).await?;
        Ok(store)
    }

    async fn init_schema(&self, wal: bool) -> Result<(), StoreError> {
        if wal {
            sqlx::query("PRAGMA journal_mode=WAL;")
                .execute(&self.pool)
                .await
                .map_err(backend)?;
        }

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS records (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                alias        TEXT    NOT NULL,
                tx_hash      TEXT    NOT NULL,
                log_index    INTEGER NOT NULL,
                block_number INTEGER NOT NULL,
                event_name   TEXT,
                body         TEXT    NOT NULL,
                created_at   INTEGER NOT NULL,
                UNIQUE (alias, tx_hash, log_index)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_alias_id ON records (alias, id);")
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS cursors (
                alias      TEXT    NOT NULL,
                kind       TEXT    NOT NULL,
                value      INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (alias, kind)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(())
    }

    async fn existing_id(&self, alias: &str, record: &Record) -> Result<Option<u64>, StoreError> {
        let row = sqlx::query(
            "SELECT id FROM records WHERE alias = ? AND tx_hash = ? AND log_index = ?",
        )
        .bind(alias)
        .bind(&record.tx_hash)
        .bind(record.log_index as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        Ok(row.map(|r| r.get::<i64, _>("id") as u64))
    }
}

// ─── RecordStore impl ────────────────────────────────────────────────────────

#[async_trait]
impl RecordStore for SqliteStore {
    async fn insert_record(&self, alias: &str, record: &Record) -> Result<u64, StoreError> {
        let body =
            serde_json::to_string(record).map_err(|e| StoreError::Serialization(e.to_string()))?;

        let result = sqlx::query(
            "INSERT INTO records
             (alias, tx_hash, log_index, block_number, event_name, body, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (alias, tx_hash, log_index) DO NOTHING",
        )
        .bind(alias)
        .bind(&record.tx_hash)
        .bind(record.log_index as i64)
        .bind(record.block_number as i64)
        .bind(record.event_name.as_deref())
        .bind(&body)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 1 {
            let id = result.last_insert_rowid() as u64;
            debug!(alias, id, block = record.block_number, "record stored");
            return Ok(id);
        }

        self.existing_id(alias, record).await?.ok_or_else(|| {
            StoreError::Backend(format!(
                "record {}:{} neither inserted nor found",
                record.tx_hash, record.log_index
            ))
        })
    }

    async fn list_records(
        &self,
        alias: &str,
        after_id: u64,
        limit: usize,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, body FROM records
             WHERE alias = ? AND id > ?
             ORDER BY id ASC
             LIMIT ?",
        )
        .bind(alias)
        .bind(after_id as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let body: String = row.get("body");
            let record: Record = serde_json::from_str(&body)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            records.push(StoredRecord {
                id: row.get::<i64, _>("id") as u64,
                record,
            });
        }
        Ok(records)
    }

    async fn record_count(&self, alias: &str) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM records WHERE alias = ?")
            .bind(alias)
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;

        let cnt: i64 = row.get("cnt");
        Ok(cnt as u64)
    }
}

// ─── CursorStore impl ────────────────────────────────────────────────────────

#[async_trait]
impl CursorStore for SqliteStore {
    async fn cursor(&self, alias: &str, kind: CursorKind) -> Result<Option<u64>, StoreError> {
        let row = sqlx::query("SELECT value FROM cursors WHERE alias = ? AND kind = ?")
            .bind(alias)
            .bind(kind.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        Ok(row.map(|r| r.get::<i64, _>("value") as u64))
    }

    async fn advance_cursor(
        &self,
        alias: &str,
        kind: CursorKind,
        value: u64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO cursors (alias, kind, value, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (alias, kind) DO UPDATE
             SET value = excluded.value, updated_at = excluded.updated_at
             WHERE excluded.value > cursors.value",
        )
        .bind(alias)
        .bind(kind.as_str())
        .bind(value as i64)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        debug!(alias, kind = %kind, value, "cursor advanced");
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::record;

    #[tokio::test]
    async fn insert_is_idempotent() {
        let store = SqliteStore::in_memory().await.unwrap();
        let rec = record("usdt", 101, 0);

        let first = store.insert_record("usdt", &rec).await.unwrap();
        let second = store.insert_record("usdt", &rec).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.record_count("usdt").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn record_body_roundtrips() {
        let store = SqliteStore::in_memory().await.unwrap();
        let rec = record("usdt", 101, 4);
        let id = store.insert_record("usdt", &rec).await.unwrap();

        let listed = store.list_records("usdt", 0, 10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);
        assert_eq!(listed[0].record, rec);
    }

    #[tokio::test]
    async fn list_is_partitioned_and_ordered() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut usdt_ids = Vec::new();
        for i in 0..4 {
            usdt_ids.push(store.insert_record("usdt", &record("usdt", 200 + i, 0)).await.unwrap());
            store.insert_record("dai", &record("dai", 200 + i, 0)).await.unwrap();
        }

        let all = store.list_records("usdt", 0, 100).await.unwrap();
        assert_eq!(all.iter().map(|r| r.id).collect::<Vec<_>>(), usdt_ids);
        assert!(all.iter().all(|r| r.record.alias == "usdt"));

        let after_first = store.list_records("usdt", usdt_ids[0], 2).await.unwrap();
        assert_eq!(
            after_first.iter().map(|r| r.id).collect::<Vec<_>>(),
            usdt_ids[1..3].to_vec()
        );
        assert_eq!(store.record_count("dai").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn cursor_upsert_is_monotonic() {
        let store = SqliteStore::in_memory().await.unwrap();
        assert_eq!(store.cursor("usdt", CursorKind::Notify).await.unwrap(), None);

        store.set_notify_cursor("usdt", 0).await.unwrap();
        assert_eq!(store.notify_cursor("usdt").await.unwrap(), Some(0));

        store.set_notify_cursor("usdt", 7).await.unwrap();
        store.set_notify_cursor("usdt", 3).await.unwrap();
        store.set_notify_cursor("usdt", 7).await.unwrap();
        assert_eq!(store.notify_cursor("usdt").await.unwrap(), Some(7));

        assert_eq!(store.read_cursor("usdt").await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_database_survives_reopen() {
        let path = std::env::temp_dir().join(format!(
            "chainevent-test-{}-{}.db",
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        let path_str = path.to_string_lossy().to_string();

        {
            let store = SqliteStore::open(&path_str).await.unwrap();
            store.insert_record("usdt", &record("usdt", 1, 0)).await.unwrap();
            store.set_read_cursor("usdt", 42).await.unwrap();
        }

        let reopened = SqliteStore::open(&path_str).await.unwrap();
        assert_eq!(reopened.record_count("usdt").await.unwrap(), 1);
        assert_eq!(reopened.read_cursor("usdt").await.unwrap(), Some(42));

        drop(reopened);
        let _ = std::fs::remove_file(&path);
    }
}
