//! Core data model: subscriptions, decoded records and their field values.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

// ─── Subscription ─────────────────────────────────────────────────────────────

/// What to watch and where to deliver it. Built once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Unique name; partitions storage and cursors.
    pub alias: String,
    /// Contract addresses (`0x`-prefixed hex). At least one.
    pub addresses: Vec<String>,
    /// ABI JSON describing the contract's events.
    pub abi: String,
    /// Restrict to a single event; `None` matches every event of the contracts.
    pub event_name: Option<String>,
    /// Field name → expected value, in configuration order.
    pub filters: IndexMap<String, String>,
    /// First block of interest. Scanning starts at `start_block + 1`.
    pub start_block: u64,
    /// Delivery endpoint. `None` stores records without forwarding them.
    pub webhook: Option<String>,
}

impl Subscription {
    pub fn new(alias: impl Into<String>, abi: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            addresses: Vec::new(),
            abi: abi.into(),
            event_name: None,
            filters: IndexMap::new(),
            start_block: 0,
            webhook: None,
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.addresses.push(address.into());
        self
    }

    pub fn with_event(mut self, name: impl Into<String>) -> Self {
        self.event_name = Some(name.into());
        self
    }

    pub fn with_filter(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.insert(field.into(), value.into());
        self
    }

    pub fn with_start_block(mut self, block: u64) -> Self {
        self.start_block = block;
        self
    }

    pub fn with_webhook(mut self, url: impl Into<String>) -> Self {
        self.webhook = Some(url.into());
        self
    }
}

// ─── Field values ─────────────────────────────────────────────────────────────

/// A decoded ABI value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum FieldValue {
    Uint(u128),
    /// Unsigned values wider than u128, as a decimal string
    BigUint(String),
    Int(i128),
    /// Signed values wider than i128, as a decimal string
    BigInt(String),
    Bool(bool),
    Bytes(Vec<u8>),
    Str(String),
    /// Lowercase `0x`-prefixed hex
    Address(String),
    Array(Vec<FieldValue>),
    Tuple(Vec<(String, FieldValue)>),
}

impl FieldValue {
    /// JSON rendering used for webhook payloads and the query API.
    ///
    /// Integers that fit in 64 bits become JSON numbers; wider ones become
    /// decimal strings. Bytes are `0x` hex.
    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Uint(v) => match u64::try_from(*v) {
                Ok(n) => Value::from(n),
                Err(_) => Value::String(v.to_string()),
            },
            FieldValue::Int(v) => match i64::try_from(*v) {
                Ok(n) => Value::from(n),
                Err(_) => Value::String(v.to_string()),
            },
            FieldValue::BigUint(s) | FieldValue::BigInt(s) => Value::String(s.clone()),
            FieldValue::Bool(b) => Value::Bool(*b),
            FieldValue::Bytes(b) => Value::String(format!("0x{}", hex::encode(b))),
            FieldValue::Str(s) | FieldValue::Address(s) => Value::String(s.clone()),
            FieldValue::Array(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            FieldValue::Tuple(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// String form compared against filter predicates: the JSON rendering
    /// with one layer of surrounding quotes removed.
    pub fn canonical_string(&self) -> String {
        canonical_json_string(&self.to_json())
    }
}

/// Serialises `value` and strips a single pair of surrounding quotes.
pub fn canonical_json_string(value: &Value) -> String {
    let rendered = value.to_string();
    match rendered
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
    {
        Some(inner) => inner.to_string(),
        None => rendered,
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_string())
    }
}

/// Decoded parameters, in ABI declaration order.
pub type FieldMap = IndexMap<String, FieldValue>;

// ─── Records ──────────────────────────────────────────────────────────────────

/// One matched log, decoded (or kept raw when decoding failed).
///
/// Identity is `(alias, tx_hash, log_index)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub alias: String,
    /// Emitting contract, lowercase hex.
    pub address: String,
    pub block_hash: String,
    pub block_number: u64,
    pub tx_hash: String,
    pub log_index: u64,
    /// Event selector, absent for anonymous logs.
    pub topic0: Option<String>,
    pub event_name: Option<String>,
    #[serde(default)]
    pub fields: FieldMap,
    /// `topics[1..] ++ data` when the payload could not be decoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Vec<u8>>,
}

impl Record {
    /// Standard (non-decoded) fields under their wire names.
    pub fn standard_field(&self, key: &str) -> Option<Value> {
        match key {
            "alias" => Some(Value::String(self.alias.clone())),
            "address" => Some(Value::String(self.address.clone())),
            "block" => Some(Value::String(self.block_hash.clone())),
            "block_number" => Some(Value::from(self.block_number)),
            "tx" => Some(Value::String(self.tx_hash.clone())),
            "log_index" => Some(Value::from(self.log_index)),
            "topic" => self.topic0.clone().map(Value::String),
            "event_name" => self.event_name.clone().map(Value::String),
            "data" => self
                .raw
                .as_ref()
                .map(|raw| Value::String(format!("0x{}", hex::encode(raw)))),
            _ => None,
        }
    }

    /// Looks a key up in the decoded fields first, then the standard fields.
    pub fn lookup(&self, key: &str) -> Option<Value> {
        self.fields
            .get(key)
            .map(FieldValue::to_json)
            .or_else(|| self.standard_field(key))
    }

    /// Flat JSON object: standard fields followed by decoded fields.
    ///
    /// Decoded fields win over standard ones on a name clash. Undecoded
    /// records carry their payload under `data`.
    pub fn to_json_map(&self) -> Map<String, Value> {
        let mut out = Map::new();
        for key in [
            "alias",
            "address",
            "block",
            "block_number",
            "tx",
            "log_index",
            "topic",
            "event_name",
            "data",
        ] {
            if let Some(v) = self.standard_field(key) {
                out.insert(key.to_string(), v);
            }
        }
        for (name, value) in &self.fields {
            out.insert(name.clone(), value.to_json());
        }
        out
    }
}

/// A record together with the id the store assigned it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: u64,
    pub record: Record,
}

impl StoredRecord {
    /// Webhook / API payload: the record's JSON plus `local_id`.
    pub fn payload(&self) -> Value {
        let mut map = self.record.to_json_map();
        map.insert("local_id".into(), Value::from(self.id));
        Value::Object(map)
    }
}
