//! Read-only HTTP query API over the record store.
//!
//! | route | returns |
//! |-------|---------|
//! | `GET /logs?alias=&offset=&limit=` | records with id > `offset`, plus `total` |
//! | `GET /unnotified_logs?alias=&limit=` | records past the notify cursor; advances it |
//! | `GET /cursors?alias=` | read and notify cursors |

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use chainevent_core::error::StoreError;
use chainevent_core::store::EventStore;
use chainevent_core::types::StoredRecord;

pub const DEFAULT_LIMIT: usize = 20;
pub const MAX_LIMIT: usize = 1000;

#[derive(Clone)]
pub struct ApiState {
    store: Arc<dyn EventStore>,
    aliases: Arc<HashSet<String>>,
}

impl ApiState {
    pub fn new(store: Arc<dyn EventStore>, aliases: impl IntoIterator<Item = String>) -> Self {
        Self {
            store,
            aliases: Arc::new(aliases.into_iter().collect()),
        }
    }

    fn known_alias(&self, alias: Option<String>) -> Result<String, ApiError> {
        let alias = alias
            .filter(|a| !a.is_empty())
            .ok_or(ApiError::MissingAlias)?;
        if self.aliases.contains(&alias) {
            Ok(alias)
        } else {
            Err(ApiError::UnknownAlias(alias))
        }
    }
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    MissingAlias,
    UnknownAlias(String),
    Store(StoreError),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Store(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::MissingAlias => (StatusCode::BAD_REQUEST, "missing alias".to_string()),
            ApiError::UnknownAlias(alias) => {
                (StatusCode::NOT_FOUND, format!("unknown alias: {alias}"))
            }
            ApiError::Store(e) => {
                error!(error = %e, "query failed");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

// ─── Handlers ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct LogsParams {
    alias: Option<String>,
    #[serde(default)]
    offset: u64,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct AliasParams {
    alias: Option<String>,
    limit: Option<usize>,
}

fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

fn payloads(records: &[StoredRecord]) -> Vec<Value> {
    records.iter().map(StoredRecord::payload).collect()
}

async fn logs(
    State(state): State<ApiState>,
    Query(params): Query<LogsParams>,
) -> Result<Json<Value>, ApiError> {
    let alias = state.known_alias(params.alias)?;
    let limit = clamp_limit(params.limit);

    let records = state
        .store
        .list_records(&alias, params.offset, limit)
        .await?;
    let total = state.store.record_count(&alias).await?;

    Ok(Json(json!({
        "alias": alias,
        "total": total,
        "logs": payloads(&records),
    })))
}

async fn unnotified_logs(
    State(state): State<ApiState>,
    Query(params): Query<AliasParams>,
) -> Result<Json<Value>, ApiError> {
    let alias = state.known_alias(params.alias)?;
    let limit = clamp_limit(params.limit);

    let cursor = state.store.notify_cursor(&alias).await?.unwrap_or(0);
    let records = state.store.list_records(&alias, cursor, limit).await?;
    if let Some(last) = records.last() {
        state.store.set_notify_cursor(&alias, last.id).await?;
        debug!(alias = %alias, cursor = last.id, "notify cursor advanced by query");
    }

    Ok(Json(json!({
        "alias": alias,
        "logs": payloads(&records),
    })))
}

async fn cursors(
    State(state): State<ApiState>,
    Query(params): Query<AliasParams>,
) -> Result<Json<Value>, ApiError> {
    let alias = state.known_alias(params.alias)?;
    let read = state.store.read_cursor(&alias).await?;
    let notify = state.store.notify_cursor(&alias).await?;
    Ok(Json(json!({
        "alias": alias,
        "read": read,
        "notify": notify,
    })))
}

// ─── Router / server ─────────────────────────────────────────────────────────

/// `"api/"` → `"/api"`, `""` and `"/"` → `""`.
fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

pub fn router(state: ApiState, prefix: &str) -> Router {
    let routes = Router::new()
        .route("/logs", get(logs))
        .route("/unnotified_logs", get(unnotified_logs))
        .route("/cursors", get(cursors))
        .with_state(state);

    let prefix = normalize_prefix(prefix);
    let app = if prefix.is_empty() {
        routes
    } else {
        Router::new().nest(&prefix, routes)
    };

    app.layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Serves `app` on `listener` until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "query API listening");
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
