//! Webhook delivery.
//!
//! A [`NotifyDispatcher`] walks a subscription's records in id order and
//! POSTs each one to the webhook. The notify cursor only moves past records
//! the webhook accepted, so a record is delivered at least once; a failure
//! stops the batch and the same record is retried after a backoff.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use chainevent_core::error::{NotifyError, StoreError};
use chainevent_core::store::EventStore;

// ─── Webhook ─────────────────────────────────────────────────────────────────

/// Destination for record payloads.
#[async_trait]
pub trait Webhook: Send + Sync {
    /// Delivers one payload; `Ok` only when the receiver accepted it.
    async fn deliver(&self, payload: &Value) -> Result<(), NotifyError>;

    fn endpoint(&self) -> &str;
}

/// JSON POST over HTTP. Only a `200 OK` counts as delivered.
pub struct HttpWebhook {
    url: String,
    client: reqwest::Client,
}

impl HttpWebhook {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl Webhook for HttpWebhook {
    async fn deliver(&self, payload: &Value) -> Result<(), NotifyError> {
        let resp = self
            .client
            .post(&self.url)
            .json(payload)
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        match resp.status().as_u16() {
            200 => Ok(()),
            status => Err(NotifyError::Status { status }),
        }
    }

    fn endpoint(&self) -> &str {
        &self.url
    }
}

// ─── Dispatcher ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct NotifyConfig {
    /// Records fetched per iteration.
    pub batch_size: usize,
    /// Delay before the first iteration, and after a full batch.
    pub initial_delay: Duration,
    /// Delay after a partial batch.
    pub interval: Duration,
    /// Delay after a delivery or storage failure.
    pub backoff: Duration,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            initial_delay: Duration::from_millis(100),
            interval: Duration::from_secs(1),
            backoff: Duration::from_secs(3),
        }
    }
}

/// What one successful iteration did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    /// Notify cursor after the iteration.
    pub cursor: u64,
    /// The batch was full, so more records are probably waiting.
    pub full_batch: bool,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("delivery of record {local_id} failed after {delivered} delivered: {source}")]
    Delivery {
        local_id: u64,
        delivered: usize,
        #[source]
        source: NotifyError,
    },
}

/// Forwards one subscription's records to its webhook.
pub struct NotifyDispatcher {
    alias: String,
    store: Arc<dyn EventStore>,
    webhook: Arc<dyn Webhook>,
    config: NotifyConfig,
}

impl NotifyDispatcher {
    pub fn new(
        alias: impl Into<String>,
        store: Arc<dyn EventStore>,
        webhook: Arc<dyn Webhook>,
    ) -> Self {
        Self {
            alias: alias.into(),
            store,
            webhook,
            config: NotifyConfig::default(),
        }
    }

    pub fn with_config(mut self, config: NotifyConfig) -> Self {
        self.config = config;
        self
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Creates the notify cursor at 0 if it does not exist yet.
    pub async fn init(&self) -> Result<(), StoreError> {
        if self.store.notify_cursor(&self.alias).await?.is_none() {
            self.store.set_notify_cursor(&self.alias, 0).await?;
        }
        Ok(())
    }

    /// Delivers the next batch in id order.
    ///
    /// On a delivery failure the cursor is moved past the records delivered
    /// before it, never past the failed one.
    pub async fn dispatch_once(&self) -> Result<DispatchReport, DispatchError> {
        let alias = self.alias.as_str();
        let cursor = self.store.notify_cursor(alias).await?.unwrap_or(0);
        let batch = self
            .store
            .list_records(alias, cursor, self.config.batch_size)
            .await?;

        let mut last = cursor;
        let mut delivered = 0;
        for stored in &batch {
            if let Err(source) = self.webhook.deliver(&stored.payload()).await {
                if delivered > 0 {
                    self.store.set_notify_cursor(alias, last).await?;
                }
                return Err(DispatchError::Delivery {
                    local_id: stored.id,
                    delivered,
                    source,
                });
            }
            debug!(alias, local_id = stored.id, "record delivered");
            last = stored.id;
            delivered += 1;
        }

        if delivered > 0 {
            self.store.set_notify_cursor(alias, last).await?;
            info!(alias, delivered, cursor = last, "batch delivered");
        }

        Ok(DispatchReport {
            delivered,
            cursor: last,
            full_batch: batch.len() >= self.config.batch_size,
        })
    }

    /// Delivers until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let alias = self.alias.clone();
        info!(alias = %alias, webhook = %self.webhook.endpoint(), "notifier started");

        loop {
            match self.init().await {
                Ok(()) => break,
                Err(e) => {
                    error!(alias = %alias, error = %e, "notify cursor init failed, backing off");
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            info!(alias = %alias, "notifier stopped");
                            return;
                        }
                        _ = tokio::time::sleep(self.config.backoff) => {}
                    }
                }
            }
        }

        let mut delay = self.config.initial_delay;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            let outcome = tokio::select! {
                _ = shutdown.cancelled() => break,
                outcome = self.dispatch_once() => outcome,
            };

            delay = match outcome {
                Ok(report) if report.full_batch => self.config.initial_delay,
                Ok(_) => self.config.interval,
                Err(DispatchError::Delivery {
                    local_id,
                    delivered,
                    source,
                }) => {
                    warn!(alias = %alias, local_id, delivered, error = %source, "webhook delivery failed, backing off");
                    self.config.backoff
                }
                Err(DispatchError::Store(e)) => {
                    error!(alias = %alias, error = %e, "storage failed, backing off");
                    self.config.backoff
                }
            };
        }

        info!(alias = %alias, "notifier stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainevent_core::store::{CursorStore, RecordStore};
    use chainevent_core::types::{FieldMap, FieldValue, Record};
    use chainevent_storage::MemoryStore;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockWebhook {
        received: Mutex<Vec<u64>>,
        reject: Mutex<HashSet<u64>>,
    }

    impl MockWebhook {
        fn received(&self) -> Vec<u64> {
            self.received.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Webhook for MockWebhook {
        async fn deliver(&self, payload: &Value) -> Result<(), NotifyError> {
            let id = payload["local_id"].as_u64().unwrap();
            self.received.lock().unwrap().push(id);
            if self.reject.lock().unwrap().contains(&id) {
                return Err(NotifyError::Status { status: 500 });
            }
            Ok(())
        }

        fn endpoint(&self) -> &str {
            "mock://hook"
        }
    }

    fn record(n: u64) -> Record {
        let mut fields = FieldMap::new();
        fields.insert("value".into(), FieldValue::Uint(n as u128));
        Record {
            alias: "usdt".into(),
            address: "0xdac17f958d2ee523a2206206994597c13d831ec7".into(),
            block_hash: format!("0x{n:064x}"),
            block_number: 100 + n,
            tx_hash: format!("0x{:064x}", n),
            log_index: 0,
            topic0: None,
            event_name: Some("Transfer".into()),
            fields,
            raw: None,
        }
    }

    async fn store_with(n: u64) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for i in 1..=n {
            store.insert_record("usdt", &record(i)).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn init_creates_cursor_once() {
        let store = store_with(0).await;
        let d = NotifyDispatcher::new("usdt", store.clone(), Arc::new(MockWebhook::default()));
        d.init().await.unwrap();
        assert_eq!(store.notify_cursor("usdt").await.unwrap(), Some(0));

        store.set_notify_cursor("usdt", 4).await.unwrap();
        d.init().await.unwrap();
        assert_eq!(store.notify_cursor("usdt").await.unwrap(), Some(4));
    }

    #[tokio::test]
    async fn delivers_in_order_and_advances() {
        let store = store_with(3).await;
        let hook = Arc::new(MockWebhook::default());
        let d = NotifyDispatcher::new("usdt", store.clone(), hook.clone());
        d.init().await.unwrap();

        let report = d.dispatch_once().await.unwrap();
        assert_eq!(
            report,
            DispatchReport { delivered: 3, cursor: 3, full_batch: false }
        );
        assert_eq!(hook.received(), vec![1, 2, 3]);
        assert_eq!(store.notify_cursor("usdt").await.unwrap(), Some(3));

        let again = d.dispatch_once().await.unwrap();
        assert_eq!(again.delivered, 0);
        assert_eq!(hook.received().len(), 3);
    }

    #[tokio::test]
    async fn failure_stops_batch_at_failed_record() {
        let store = store_with(3).await;
        let hook = Arc::new(MockWebhook::default());
        hook.reject.lock().unwrap().insert(2);
        let d = NotifyDispatcher::new("usdt", store.clone(), hook.clone());
        d.init().await.unwrap();

        match d.dispatch_once().await {
            Err(DispatchError::Delivery { local_id, delivered, .. }) => {
                assert_eq!(local_id, 2);
                assert_eq!(delivered, 1);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(hook.received(), vec![1, 2]);
        assert_eq!(store.notify_cursor("usdt").await.unwrap(), Some(1));

        hook.reject.lock().unwrap().clear();
        let report = d.dispatch_once().await.unwrap();
        assert_eq!(report.cursor, 3);
        assert_eq!(hook.received(), vec![1, 2, 2, 3]);
    }

    #[tokio::test]
    async fn batch_is_bounded() {
        let store = store_with(12).await;
        let hook = Arc::new(MockWebhook::default());
        let d = NotifyDispatcher::new("usdt", store.clone(), hook.clone());

        let first = d.dispatch_once().await.unwrap();
        assert_eq!(first.delivered, 10);
        assert!(first.full_batch);

        let second = d.dispatch_once().await.unwrap();
        assert_eq!(second.delivered, 2);
        assert_eq!(second.cursor, 12);
        assert!(!second.full_batch);
    }

    #[tokio::test]
    async fn payload_carries_local_id_and_fields() {
        #[derive(Default)]
        struct Capture(Mutex<Vec<Value>>);

        #[async_trait]
        impl Webhook for Capture {
            async fn deliver(&self, payload: &Value) -> Result<(), NotifyError> {
                self.0.lock().unwrap().push(payload.clone());
                Ok(())
            }
            fn endpoint(&self) -> &str {
                "mock://capture"
            }
        }

        let store = store_with(1).await;
        let hook = Arc::new(Capture::default());
        NotifyDispatcher::new("usdt", store, hook.clone())
            .dispatch_once()
            .await
            .unwrap();

        let payloads = hook.0.lock().unwrap();
        assert_eq!(payloads[0]["local_id"], 1);
        assert_eq!(payloads[0]["value"], 1);
        assert_eq!(payloads[0]["block_number"], 101);
        assert_eq!(payloads[0]["event_name"], "Transfer");
    }

    #[tokio::test]
    async fn run_delivers_until_cancelled() {
        let store = store_with(3).await;
        let hook = Arc::new(MockWebhook::default());
        let d = NotifyDispatcher::new("usdt", store.clone(), hook.clone()).with_config(NotifyConfig {
            initial_delay: Duration::from_millis(1),
            interval: Duration::from_millis(5),
            ..NotifyConfig::default()
        });

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(d.run(shutdown.clone()));
        for _ in 0..200 {
            if store.notify_cursor("usdt").await.unwrap() == Some(3) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("notifier did not stop")
            .unwrap();

        assert_eq!(hook.received(), vec![1, 2, 3]);
    }
}
