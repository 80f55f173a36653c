//! Per-subscription polling loop.
//!
//! Each iteration scans at most `max_window` blocks past the read cursor, up
//! to the tracker's safe height, stores whatever matched and then advances
//! the cursor to the end of the window. A failed iteration leaves the cursor
//! where it was, so the same window is scanned again after a backoff.
//!
//! ```text
//! Waiting ──delay──▶ Polling ──ok──▶ Waiting (short delay)
//!                       │  └─caught up─▶ Waiting (idle delay)
//!                       └─error──▶ Backoff ──▶ Waiting
//! ```

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use chainevent_core::error::{StoreError, TransportError};
use chainevent_core::store::EventStore;
use chainevent_core::tracker::ChainTracker;
use chainevent_core::transport::ChainTransport;

use crate::filter::LogFilterDecoder;

/// Poller tuning.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Most blocks scanned per iteration.
    pub max_window: u64,
    /// Delay after an iteration that made progress.
    pub active_delay: Duration,
    /// Delay once the cursor has caught up with the safe height.
    pub idle_delay: Duration,
    /// Delay after a chain RPC failure.
    pub transport_backoff: Duration,
    /// Delay after a storage failure.
    pub storage_backoff: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            max_window: 5,
            active_delay: Duration::from_millis(100),
            idle_delay: Duration::from_secs(2),
            transport_backoff: Duration::from_secs(5),
            storage_backoff: Duration::from_secs(10),
        }
    }
}

/// Result of a single successful iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Nothing to scan: the cursor is at or past the safe height.
    Idle { cursor: u64, safe_height: u64 },
    /// Blocks `[from, to]` were scanned and the cursor now sits at `to`.
    Scanned { from: u64, to: u64, stored: usize },
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Drives one subscription from its start block to the chain's safe height.
pub struct SubscriptionPoller {
    decoder: LogFilterDecoder,
    start_block: u64,
    tracker: Arc<ChainTracker>,
    transport: Arc<dyn ChainTransport>,
    store: Arc<dyn EventStore>,
    config: PollerConfig,
}

impl SubscriptionPoller {
    pub fn new(
        decoder: LogFilterDecoder,
        start_block: u64,
        tracker: Arc<ChainTracker>,
        transport: Arc<dyn ChainTransport>,
        store: Arc<dyn EventStore>,
    ) -> Self {
        Self {
            decoder,
            start_block,
            tracker,
            transport,
            store,
            config: PollerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: PollerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn alias(&self) -> &str {
        self.decoder.alias()
    }

    /// Last fully scanned block. A stored cursor below `start_block` is ignored.
    async fn current_cursor(&self) -> Result<u64, StoreError> {
        let stored = self.store.read_cursor(self.alias()).await?;
        Ok(stored.unwrap_or(self.start_block).max(self.start_block))
    }

    /// Runs one iteration: scan the next window, store matches, advance the cursor.
    pub async fn poll_once(&self) -> Result<PollOutcome, PollError> {
        let alias = self.alias();
        let safe_height = self.tracker.safe_height().await;
        let cursor = self.current_cursor().await?;

        if cursor >= safe_height {
            return Ok(PollOutcome::Idle {
                cursor,
                safe_height,
            });
        }

        let from = cursor + 1;
        let to = safe_height.min(cursor.saturating_add(self.config.max_window.max(1)));

        let records = self
            .decoder
            .fetch_records(self.transport.as_ref(), from, to)
            .await?;

        for record in &records {
            let id = self.store.insert_record(alias, record).await?;
            debug!(alias, id, block = record.block_number, tx = %record.tx_hash, "record ingested");
        }

        self.store.set_read_cursor(alias, to).await?;

        if !records.is_empty() {
            info!(alias, from, to, stored = records.len(), "window scanned");
        } else {
            debug!(alias, from, to, "window scanned, no matches");
        }

        Ok(PollOutcome::Scanned {
            from,
            to,
            stored: records.len(),
        })
    }

    /// Polls until `shutdown` is cancelled.
    ///
    /// An in-flight iteration is abandoned on shutdown; since the cursor only
    /// moves after every record of the window is stored, the window is simply
    /// scanned again on the next start.
    pub async fn run(self, shutdown: CancellationToken) {
        let alias = self.alias().to_string();
        info!(alias = %alias, start_block = self.start_block, "poller started");

        let mut delay = self.config.active_delay;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            let outcome = tokio::select! {
                _ = shutdown.cancelled() => break,
                outcome = self.poll_once() => outcome,
            };

            delay = match outcome {
                Ok(PollOutcome::Scanned { .. }) => self.config.active_delay,
                Ok(PollOutcome::Idle { .. }) => self.config.idle_delay,
                Err(PollError::Transport(e)) => {
                    warn!(alias = %alias, error = %e, "log fetch failed, backing off");
                    self.config.transport_backoff
                }
                Err(PollError::Store(e)) => {
                    error!(alias = %alias, error = %e, "storage failed, backing off");
                    self.config.storage_backoff
                }
            };
        }

        info!(alias = %alias, "poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi;
    use async_trait::async_trait;
    use chainevent_core::store::{CursorKind, CursorStore, RecordStore};
    use chainevent_core::transport::{LogQuery, RawLog};
    use chainevent_core::types::{Record, StoredRecord, Subscription};
    use chainevent_storage::MemoryStore;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex;

    const TOKEN: &str = "0xdac17f958d2ee523a2206206994597c13d831ec7";
    const TRANSFER_SIG: &str =
        "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

    struct MockChain {
        head: AtomicU64,
        logs: Vec<RawLog>,
        fail_logs: AtomicBool,
        queries: Mutex<Vec<(u64, u64)>>,
    }

    impl MockChain {
        fn new(head: u64, blocks_with_logs: &[u64]) -> Arc<Self> {
            let logs = blocks_with_logs
                .iter()
                .map(|b| RawLog {
                    address: TOKEN.into(),
                    topics: vec![
                        TRANSFER_SIG.into(),
                        format!("0x{:064x}", 0xaa),
                        format!("0x{:064x}", 0xbb),
                    ],
                    data: format!("0x{:064x}", b),
                    block_number: format!("0x{b:x}"),
                    block_hash: format!("0x{b:064x}"),
                    tx_hash: format!("0x{:064x}", b * 7),
                    log_index: "0x0".into(),
                    removed: None,
                })
                .collect();
            Arc::new(Self {
                head: AtomicU64::new(head),
                logs,
                fail_logs: AtomicBool::new(false),
                queries: Mutex::new(Vec::new()),
            })
        }

        fn queries(&self) -> Vec<(u64, u64)> {
            self.queries.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChainTransport for MockChain {
        async fn block_number(&self) -> Result<u64, TransportError> {
            Ok(self.head.load(Ordering::SeqCst))
        }

        async fn filter_logs(&self, query: &LogQuery) -> Result<Vec<RawLog>, TransportError> {
            if self.fail_logs.load(Ordering::SeqCst) {
                return Err(TransportError::Http("503 Service Unavailable".into()));
            }
            self.queries
                .lock()
                .unwrap()
                .push((query.from_block, query.to_block));
            Ok(self
                .logs
                .iter()
                .filter(|l| {
                    let b = l.block_number_u64();
                    b >= query.from_block && b <= query.to_block
                })
                .cloned()
                .collect())
        }
    }

    fn poller(
        chain: Arc<MockChain>,
        store: Arc<MemoryStore>,
        start: u64,
        delay: u64,
    ) -> SubscriptionPoller {
        let sub = Subscription::new("usdt", abi::ERC20)
            .with_address(TOKEN)
            .with_event("Transfer")
            .with_start_block(start);
        let decoder = LogFilterDecoder::new(&sub).unwrap();
        let tracker = Arc::new(ChainTracker::new(chain.clone(), delay));
        SubscriptionPoller::new(decoder, start, tracker, chain, store)
    }

    #[tokio::test]
    async fn end_to_end_windows_then_idle() {
        let chain = MockChain::new(110, &[101, 104, 106, 109]);
        let store = Arc::new(MemoryStore::new());
        let p = poller(chain.clone(), store.clone(), 100, 3);

        assert_eq!(
            p.poll_once().await.unwrap(),
            PollOutcome::Scanned { from: 101, to: 105, stored: 2 }
        );
        assert_eq!(store.read_cursor("usdt").await.unwrap(), Some(105));

        assert_eq!(
            p.poll_once().await.unwrap(),
            PollOutcome::Scanned { from: 106, to: 107, stored: 1 }
        );
        assert_eq!(store.read_cursor("usdt").await.unwrap(), Some(107));

        assert_eq!(
            p.poll_once().await.unwrap(),
            PollOutcome::Idle { cursor: 107, safe_height: 107 }
        );

        assert_eq!(chain.queries(), vec![(101, 105), (106, 107)]);
        assert_eq!(store.record_count("usdt").await.unwrap(), 3);
        let stored = store.list_records("usdt", 0, 10).await.unwrap();
        let blocks: Vec<u64> = stored.iter().map(|r| r.record.block_number).collect();
        assert_eq!(blocks, vec![101, 104, 106]);
    }

    #[tokio::test]
    async fn window_is_bounded() {
        let chain = MockChain::new(200, &[]);
        let store = Arc::new(MemoryStore::new());
        let p = poller(chain, store.clone(), 100, 0);

        p.poll_once().await.unwrap();
        assert_eq!(store.read_cursor("usdt").await.unwrap(), Some(105));
    }

    #[tokio::test]
    async fn cursor_advances_without_matches() {
        let chain = MockChain::new(103, &[]);
        let store = Arc::new(MemoryStore::new());
        let p = poller(chain, store.clone(), 100, 0);

        assert_eq!(
            p.poll_once().await.unwrap(),
            PollOutcome::Scanned { from: 101, to: 103, stored: 0 }
        );
        assert_eq!(store.read_cursor("usdt").await.unwrap(), Some(103));
    }

    #[tokio::test]
    async fn transport_error_leaves_cursor() {
        let chain = MockChain::new(110, &[101]);
        chain.fail_logs.store(true, Ordering::SeqCst);
        let store = Arc::new(MemoryStore::new());
        let p = poller(chain.clone(), store.clone(), 100, 3);

        assert!(matches!(p.poll_once().await, Err(PollError::Transport(_))));
        assert_eq!(store.read_cursor("usdt").await.unwrap(), None);

        chain.fail_logs.store(false, Ordering::SeqCst);
        assert_eq!(
            p.poll_once().await.unwrap(),
            PollOutcome::Scanned { from: 101, to: 105, stored: 1 }
        );
    }

    /// `MemoryStore` whose inserts can be switched to fail.
    struct FlakyStore {
        inner: MemoryStore,
        fail_inserts: AtomicBool,
    }

    #[async_trait]
    impl RecordStore for FlakyStore {
        async fn insert_record(&self, alias: &str, record: &Record) -> Result<u64, StoreError> {
            if self.fail_inserts.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("database is locked".into()));
            }
            self.inner.insert_record(alias, record).await
        }

        async fn list_records(
            &self,
            alias: &str,
            after_id: u64,
            limit: usize,
        ) -> Result<Vec<StoredRecord>, StoreError> {
            self.inner.list_records(alias, after_id, limit).await
        }

        async fn record_count(&self, alias: &str) -> Result<u64, StoreError> {
            self.inner.record_count(alias).await
        }
    }

    #[async_trait]
    impl CursorStore for FlakyStore {
        async fn cursor(&self, alias: &str, kind: CursorKind) -> Result<Option<u64>, StoreError> {
            self.inner.cursor(alias, kind).await
        }

        async fn advance_cursor(
            &self,
            alias: &str,
            kind: CursorKind,
            value: u64,
        ) -> Result<(), StoreError> {
            self.inner.advance_cursor(alias, kind, value).await
        }
    }

    #[tokio::test]
    async fn storage_error_leaves_cursor() {
        let chain = MockChain::new(110, &[101, 104]);
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            fail_inserts: AtomicBool::new(true),
        });
        let sub = Subscription::new("usdt", abi::ERC20)
            .with_address(TOKEN)
            .with_event("Transfer")
            .with_start_block(100);
        let tracker = Arc::new(ChainTracker::new(chain.clone(), 3));
        let p = SubscriptionPoller::new(
            LogFilterDecoder::new(&sub).unwrap(),
            100,
            tracker,
            chain.clone(),
            store.clone(),
        );

        assert!(matches!(p.poll_once().await, Err(PollError::Store(_))));
        assert_eq!(store.read_cursor("usdt").await.unwrap(), None);
        assert_eq!(store.record_count("usdt").await.unwrap(), 0);

        store.fail_inserts.store(false, Ordering::SeqCst);
        assert_eq!(
            p.poll_once().await.unwrap(),
            PollOutcome::Scanned { from: 101, to: 105, stored: 2 }
        );
        assert_eq!(store.read_cursor("usdt").await.unwrap(), Some(105));
        assert_eq!(chain.queries(), vec![(101, 105), (101, 105)]);
    }

    #[tokio::test]
    async fn resumes_from_stored_cursor() {
        let chain = MockChain::new(110, &[]);
        let store = Arc::new(MemoryStore::new());
        store.set_read_cursor("usdt", 104).await.unwrap();
        let p = poller(chain, store, 100, 0);

        assert_eq!(
            p.poll_once().await.unwrap(),
            PollOutcome::Scanned { from: 105, to: 109, stored: 0 }
        );
    }

    #[tokio::test]
    async fn start_block_ahead_of_safe_height_idles() {
        let chain = MockChain::new(50, &[]);
        let store = Arc::new(MemoryStore::new());
        let p = poller(chain.clone(), store, 100, 0);

        assert!(matches!(p.poll_once().await.unwrap(), PollOutcome::Idle { cursor: 100, .. }));
        assert!(chain.queries().is_empty());
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let chain = MockChain::new(110, &[101, 106]);
        let store = Arc::new(MemoryStore::new());
        let p = poller(chain, store.clone(), 100, 3).with_config(PollerConfig {
            active_delay: Duration::from_millis(1),
            idle_delay: Duration::from_millis(5),
            ..PollerConfig::default()
        });

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(p.run(shutdown.clone()));

        for _ in 0..200 {
            if store.read_cursor("usdt").await.unwrap() == Some(107) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(store.read_cursor("usdt").await.unwrap(), Some(107));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("poller did not stop")
            .unwrap();
        assert_eq!(store.record_count("usdt").await.unwrap(), 2);
    }
}
