//! Worker supervision.
//!
//! The [`Manager`] owns every per-subscription worker: one
//! [`SubscriptionPoller`] per subscription and one [`NotifyDispatcher`] per
//! subscription with a webhook. All of them share a single [`ChainTracker`]
//! and a single store.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use chainevent_core::error::{ConfigError, StoreError, TransportError};
use chainevent_core::store::EventStore;
use chainevent_core::tracker::{ChainTracker, DEFAULT_FRESHNESS};
use chainevent_core::transport::ChainTransport;
use chainevent_core::types::Subscription;
use chainevent_evm::{
    HttpClientConfig, HttpRpcClient, LogFilterDecoder, PollerConfig, RetryConfig,
    SubscriptionPoller,
};
use chainevent_storage::{MemoryStore, SqliteStore};

use crate::api::{self, ApiState};
use crate::config::{validate_alias, Config, DbEngine};
use crate::notify::{HttpWebhook, NotifyConfig, NotifyDispatcher};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Query API binding.
#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub addr: SocketAddr,
    pub prefix: String,
}

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub confirmation_delay: u64,
    pub head_freshness: Duration,
    pub poller: PollerConfig,
    pub notify: NotifyConfig,
    pub webhook_timeout: Duration,
    /// `None` disables the query API.
    pub api: Option<ApiSettings>,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            confirmation_delay: 0,
            head_freshness: DEFAULT_FRESHNESS,
            poller: PollerConfig::default(),
            notify: NotifyConfig::default(),
            webhook_timeout: Duration::from_secs(10),
            api: None,
        }
    }
}

pub struct Manager {
    pollers: Vec<SubscriptionPoller>,
    dispatchers: Vec<NotifyDispatcher>,
    store: Arc<dyn EventStore>,
    aliases: Vec<String>,
    api: Option<ApiSettings>,
    shutdown: CancellationToken,
}

impl Manager {
    /// Builds every worker. Fails on the first invalid subscription.
    pub fn new(
        subscriptions: Vec<Subscription>,
        transport: Arc<dyn ChainTransport>,
        store: Arc<dyn EventStore>,
        settings: ManagerSettings,
    ) -> Result<Self, ConfigError> {
        let tracker = Arc::new(
            ChainTracker::new(transport.clone(), settings.confirmation_delay)
                .with_freshness(settings.head_freshness),
        );

        let mut seen = HashSet::new();
        let mut aliases = Vec::with_capacity(subscriptions.len());
        let mut pollers = Vec::with_capacity(subscriptions.len());
        let mut dispatchers = Vec::new();

        for sub in &subscriptions {
            validate_alias(&sub.alias)?;
            if !seen.insert(sub.alias.clone()) {
                return Err(ConfigError::DuplicateAlias {
                    alias: sub.alias.clone(),
                });
            }

            let decoder = LogFilterDecoder::new(sub)?;
            let poller = SubscriptionPoller::new(
                decoder,
                sub.start_block,
                tracker.clone(),
                transport.clone(),
                store.clone(),
            )
            .with_config(settings.poller.clone());
            pollers.push(poller);

            if let Some(url) = &sub.webhook {
                let webhook = HttpWebhook::new(url.clone(), settings.webhook_timeout).map_err(
                    |e| ConfigError::InvalidUrl {
                        url: url.clone(),
                        reason: e.to_string(),
                    },
                )?;
                let dispatcher =
                    NotifyDispatcher::new(sub.alias.clone(), store.clone(), Arc::new(webhook))
                        .with_config(settings.notify.clone());
                dispatchers.push(dispatcher);
            }

            aliases.push(sub.alias.clone());
        }

        Ok(Self {
            pollers,
            dispatchers,
            store,
            aliases,
            api: settings.api,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }

    /// Token that stops every worker when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Runs every worker until the shutdown token fires, then waits for all
    /// of them to finish.
    pub async fn run(self) -> Result<(), ServiceError> {
        // Bind first so a bad address fails before any worker starts.
        let listener = match &self.api {
            Some(api) => Some(tokio::net::TcpListener::bind(api.addr).await?),
            None => None,
        };

        let mut tasks = JoinSet::new();

        info!(
            pollers = self.pollers.len(),
            notifiers = self.dispatchers.len(),
            "starting workers"
        );

        for poller in self.pollers {
            tasks.spawn(poller.run(self.shutdown.clone()));
        }
        for dispatcher in self.dispatchers {
            tasks.spawn(dispatcher.run(self.shutdown.clone()));
        }

        if let (Some(listener), Some(api)) = (listener, &self.api) {
            let state = ApiState::new(self.store.clone(), self.aliases.iter().cloned());
            let app = api::router(state, &api.prefix);
            let shutdown = self.shutdown.clone();
            tasks.spawn(async move {
                if let Err(e) = api::serve(listener, app, shutdown).await {
                    error!(error = %e, "query API failed");
                }
            });
        }

        self.shutdown.cancelled().await;
        info!("shutdown requested, waiting for workers");

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "worker panicked");
            }
        }

        info!("all workers stopped");
        Ok(())
    }
}

// ─── Wiring from config ──────────────────────────────────────────────────────

/// Opens the configured store.
pub async fn open_store(config: &Config) -> Result<Arc<dyn EventStore>, ServiceError> {
    let store: Arc<dyn EventStore> = match config.db.engine {
        DbEngine::Sqlite => Arc::new(SqliteStore::open(&config.db.dsn).await?),
        DbEngine::Memory => Arc::new(MemoryStore::new()),
    };
    Ok(store)
}

/// Builds a [`Manager`] with an HTTP JSON-RPC transport and the configured store.
pub async fn build_from_config(config: &Config) -> Result<Manager, ServiceError> {
    let subscriptions = config.subscriptions()?;

    let transport = HttpRpcClient::new(
        config.chain.rpc_node.clone(),
        HttpClientConfig {
            retry: RetryConfig {
                max_retries: config.chain.max_retries,
                ..RetryConfig::default()
            },
            request_timeout: Duration::from_millis(config.chain.request_timeout_ms),
        },
    )?;

    let store = open_store(config).await?;

    let api = if config.http.port > 0 {
        let addr = format!("{}:{}", config.http.host, config.http.port)
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidUrl {
                url: format!("{}:{}", config.http.host, config.http.port),
                reason: e.to_string(),
            })?;
        Some(ApiSettings {
            addr,
            prefix: config.http.prefix_path.clone(),
        })
    } else {
        None
    };

    let settings = ManagerSettings {
        confirmation_delay: config.chain.delay_block,
        head_freshness: Duration::from_millis(config.chain.head_freshness_ms),
        poller: config.poller.to_poller_config(),
        notify: config.notify.to_notify_config(),
        webhook_timeout: config.notify.webhook_timeout(),
        api,
    };

    Ok(Manager::new(
        subscriptions,
        Arc::new(transport),
        store,
        settings,
    )?)
}
