//! Error types for the chainevent pipeline.
//!
//! Each component owns one enum. Only [`ConfigError`] is fatal; everything
//! else is logged and retried by the worker that hit it.

use thiserror::Error;

/// Startup-time configuration problems. The process refuses to start.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("duplicate subscription alias '{alias}'")]
    DuplicateAlias { alias: String },

    #[error("invalid subscription alias '{alias}': {reason}")]
    InvalidAlias { alias: String, reason: String },

    #[error("invalid ABI for '{alias}': {reason}")]
    InvalidAbi { alias: String, reason: String },

    #[error("event '{event}' not found in ABI for '{alias}'")]
    SchemaMismatch { alias: String, event: String },

    #[error("invalid filter value for '{field}' = '{value}': {reason}")]
    InvalidFilter {
        field: String,
        value: String,
        reason: String,
    },

    #[error("invalid contract address '{address}'")]
    InvalidAddress { address: String },

    #[error("invalid url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("missing required field: {field}")]
    MissingField { field: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(String),
}

/// Chain RPC failures. Retried with backoff, never fatal.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("JSON-RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("request timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl TransportError {
    /// Whether the failure is worth retrying against the same endpoint.
    ///
    /// Execution errors reported by the node (`Rpc`) and malformed payloads
    /// will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Http(_) | Self::Timeout { .. })
    }
}

/// A log payload that does not match the subscription's ABI.
///
/// Never fatal: the record is kept with its raw bytes.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("no event in ABI matches topic0 {topic0}")]
    UnknownEvent { topic0: String },

    #[error("log has no topics")]
    MissingTopics,

    #[error("expected {expected} indexed topics, got {got}")]
    TopicCount { expected: usize, got: usize },

    #[error("ABI decode failed: {reason}")]
    AbiDecodeFailed { reason: String },

    #[error("invalid hex in log: {0}")]
    InvalidHex(String),
}

/// Storage backend failures. The affected worker backs off and retries.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Webhook delivery failures.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook transport error: {0}")]
    Transport(String),

    #[error("webhook returned status {status}")]
    Status { status: u16 },
}
