//! chainevent-evm — EVM side of chainevent.
//!
//! - [`abi`] — built-in and file-based ABI sources
//! - [`filter`] — [`LogFilterDecoder`]: query construction, decoding, post-filtering
//! - [`normalizer`] — alloy values → [`chainevent_core::FieldValue`]
//! - [`rpc`] — [`HttpRpcClient`], a JSON-RPC [`chainevent_core::ChainTransport`]
//! - [`poller`] — [`SubscriptionPoller`], the per-subscription ingestion loop

pub mod abi;
pub mod filter;
pub mod normalizer;
pub mod poller;
pub mod retry;
pub mod rpc;

pub use filter::LogFilterDecoder;
pub use poller::{PollError, PollOutcome, PollerConfig, SubscriptionPoller};
pub use retry::{RetryConfig, RetryPolicy};
pub use rpc::{HttpClientConfig, HttpRpcClient};
