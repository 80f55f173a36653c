//! Confirmation-aware chain head cache.
//!
//! Every poller asks the tracker how far it may read. The tracker refreshes
//! the head at most once per freshness window and subtracts the confirmation
//! delay, so reads never touch blocks that could still be reorganised.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::transport::ChainTransport;

/// Default time a cached head stays fresh.
pub const DEFAULT_FRESHNESS: Duration = Duration::from_secs(2);

#[derive(Debug, Default)]
struct HeadState {
    head: u64,
    last_sync: Option<Instant>,
}

/// Shared by every poller.
pub struct ChainTracker {
    transport: Arc<dyn ChainTransport>,
    confirmation_delay: u64,
    freshness: Duration,
    state: Mutex<HeadState>,
}

impl ChainTracker {
    pub fn new(transport: Arc<dyn ChainTransport>, confirmation_delay: u64) -> Self {
        Self {
            transport,
            confirmation_delay,
            freshness: DEFAULT_FRESHNESS,
            state: Mutex::new(HeadState::default()),
        }
    }

    pub fn with_freshness(mut self, freshness: Duration) -> Self {
        self.freshness = freshness;
        self
    }

    pub fn confirmation_delay(&self) -> u64 {
        self.confirmation_delay
    }

    /// Highest block considered final: `head - confirmation_delay`, floored at 0.
    ///
    /// Refreshes the head when the cache is stale. A failed refresh keeps the
    /// previous head and is retried after the next freshness window; this
    /// method itself never fails.
    pub async fn safe_height(&self) -> u64 {
        let mut state = self.state.lock().await;

        let stale = state
            .last_sync
            .map_or(true, |at| at.elapsed() > self.freshness);

        if stale {
            match self.transport.block_number().await {
                Ok(head) => {
                    if head < state.head {
                        tracing::debug!(previous = state.head, head, "chain head moved backwards");
                    }
                    state.head = head;
                }
                Err(e) => {
                    tracing::warn!(error = %e, head = state.head, "head refresh failed, keeping last known head");
                }
            }
            state.last_sync = Some(Instant::now());
        }

        state.head.saturating_sub(self.confirmation_delay)
    }

    /// Last observed head, without refreshing.
    pub async fn head(&self) -> u64 {
        self.state.lock().await.head
    }
}
