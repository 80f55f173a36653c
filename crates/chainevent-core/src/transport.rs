//! Chain transport contract and `eth_getLogs` wire types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::TransportError;

/// A raw EVM log as returned by `eth_getLogs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    #[serde(default)]
    pub data: String,
    #[serde(rename = "blockNumber")]
    pub block_number: String,
    #[serde(rename = "blockHash", default)]
    pub block_hash: String,
    #[serde(rename = "transactionHash")]
    pub tx_hash: String,
    #[serde(rename = "logIndex")]
    pub log_index: String,
    #[serde(default)]
    pub removed: Option<bool>,
}

impl RawLog {
    pub fn block_number_u64(&self) -> u64 {
        parse_hex_u64(&self.block_number)
    }

    pub fn log_index_u64(&self) -> u64 {
        parse_hex_u64(&self.log_index)
    }

    /// Returns `true` if this log was removed by a reorg.
    pub fn is_removed(&self) -> bool {
        self.removed.unwrap_or(false)
    }
}

/// A log filter over an inclusive block range.
///
/// `topics[i] == None` leaves slot `i` unconstrained; `Some(vec)` matches any
/// of the listed 32-byte values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogQuery {
    pub addresses: Vec<String>,
    pub topics: Vec<Option<Vec<String>>>,
    pub from_block: u64,
    pub to_block: u64,
}

impl LogQuery {
    /// The `eth_getLogs` filter object.
    pub fn to_json(&self) -> Value {
        let topics: Vec<Value> = self
            .topics
            .iter()
            .map(|slot| match slot {
                None => Value::Null,
                Some(values) if values.len() == 1 => Value::String(values[0].clone()),
                Some(values) => json!(values),
            })
            .collect();

        let mut filter = json!({
            "fromBlock": format!("0x{:x}", self.from_block),
            "toBlock": format!("0x{:x}", self.to_block),
            "address": self.addresses,
        });
        if !topics.is_empty() {
            filter["topics"] = Value::Array(topics);
        }
        filter
    }
}

/// Minimal view of an EVM node: current height and historical logs.
#[async_trait]
pub trait ChainTransport: Send + Sync {
    /// Latest block number known to the node.
    async fn block_number(&self) -> Result<u64, TransportError>;

    /// Logs matching `query`, in chain order.
    async fn filter_logs(&self, query: &LogQuery) -> Result<Vec<RawLog>, TransportError>;
}

/// Parse a hex-encoded string (with or without `0x`) to u64.
pub fn parse_hex_u64(s: &str) -> u64 {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16).unwrap_or(0)
}
