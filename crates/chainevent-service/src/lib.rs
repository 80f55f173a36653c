//! chainevent-service — the runtime around the ingestion engine.
//!
//! - [`config`] — YAML configuration and subscription resolution
//! - [`logging`] — `tracing-subscriber` initialisation
//! - [`notify`] — [`NotifyDispatcher`] and the HTTP [`notify::Webhook`]
//! - [`api`] — read-only query API (axum)
//! - [`manager`] — [`Manager`], which owns and supervises every worker
//!
//! ```no_run
//! # async fn demo() -> Result<(), chainevent_service::ServiceError> {
//! let config = chainevent_service::Config::load("chainevent.yaml")?;
//! let manager = chainevent_service::build_from_config(&config).await?;
//! let stop = manager.shutdown_token();
//! tokio::spawn(async move {
//!     let _ = tokio::signal::ctrl_c().await;
//!     stop.cancel();
//! });
//! manager.run().await
//! # }
//! ```

pub mod api;
pub mod config;
pub mod logging;
pub mod manager;
pub mod notify;

pub use config::Config;
pub use logging::{init_tracing, LogConfig};
pub use manager::{build_from_config, ApiSettings, Manager, ManagerSettings, ServiceError};
pub use notify::{HttpWebhook, NotifyConfig, NotifyDispatcher, Webhook};
