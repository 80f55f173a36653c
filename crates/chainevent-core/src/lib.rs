//! chainevent-core — shared types and traits for the chainevent ingestion engine.
//!
//! # Overview
//!
//! chainevent watches EVM contracts for event logs, decodes them against an
//! ABI, stores each log exactly once and forwards new records to a webhook.
//!
//! This crate holds everything the other crates agree on:
//!
//! - [`types`] — subscriptions, decoded records and field values
//! - [`error`] — the error taxonomy shared by every component
//! - [`store`] — the record/cursor storage contract
//! - [`transport`] — the chain RPC contract and `eth_getLogs` wire types
//! - [`tracker`] — [`tracker::ChainTracker`], the confirmation-aware head cache

pub mod error;
pub mod store;
pub mod tracker;
pub mod transport;
pub mod types;

pub use error::{ConfigError, DecodeError, NotifyError, StoreError, TransportError};
pub use store::{CursorKind, CursorStore, EventStore, RecordStore};
pub use tracker::ChainTracker;
pub use transport::{ChainTransport, LogQuery, RawLog};
pub use types::{FieldMap, FieldValue, Record, StoredRecord, Subscription};
