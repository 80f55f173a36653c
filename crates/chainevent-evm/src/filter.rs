//! Turns a subscription into an `eth_getLogs` query and decodes the results.
//!
//! # Topic construction
//!
//! With a target event, topic slot 0 is pinned to the event selector. The
//! event's parameters are then walked in declaration order; each indexed
//! parameter gets a slot, constrained when the subscription carries a filter
//! for it. The walk stops at the first non-indexed parameter, and every filter
//! that did not become a topic is re-checked after decoding.
//!
//! # Decoding
//!
//! Indexed values come from `topics[1..]`, one 32-byte word each; reference
//! types (`string`, `bytes`, arrays, tuples) are only available as their
//! keccak hash there. Non-indexed values are ABI-decoded from `data`.
//! A log that does not fit the ABI is kept with its raw payload.

use std::collections::HashSet;

use alloy_dyn_abi::{DynSolType, DynSolValue, Specifier};
use alloy_json_abi::Event;
use alloy_primitives::{keccak256, Address, B256, I256, U256};
use indexmap::IndexMap;
use tracing::debug;

use chainevent_core::error::{ConfigError, DecodeError, TransportError};
use chainevent_core::transport::{ChainTransport, LogQuery, RawLog};
use chainevent_core::types::{canonical_json_string, FieldMap, FieldValue, Record, Subscription};

use crate::abi;
use crate::normalizer::{self, FieldNames};

// ─── Event layout ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct ParamLayout {
    name: String,
    ty: DynSolType,
    indexed: bool,
    names: FieldNames,
}

impl ParamLayout {
    /// Values of these types appear in topics only as their keccak hash.
    fn is_hashed_in_topic(&self) -> bool {
        matches!(
            self.ty,
            DynSolType::String
                | DynSolType::Bytes
                | DynSolType::Array(_)
                | DynSolType::FixedArray(..)
                | DynSolType::Tuple(_)
        )
    }
}

/// An ABI event with its parameter types resolved.
#[derive(Debug, Clone)]
struct EventLayout {
    name: String,
    selector: B256,
    anonymous: bool,
    params: Vec<ParamLayout>,
    indexed_count: usize,
}

impl EventLayout {
    fn new(alias: &str, event: &Event) -> Result<Self, ConfigError> {
        let mut params = Vec::with_capacity(event.inputs.len());
        for (i, input) in event.inputs.iter().enumerate() {
            let ty: DynSolType = input.resolve().map_err(|e| ConfigError::InvalidAbi {
                alias: alias.to_string(),
                reason: format!("event {}: parameter {i}: {e}", event.name),
            })?;
            let name = if input.name.is_empty() {
                format!("arg{i}")
            } else {
                input.name.clone()
            };
            params.push(ParamLayout {
                name,
                ty,
                indexed: input.indexed,
                names: FieldNames::from_abi(&input.ty, &input.components),
            });
        }
        let indexed_count = params.iter().filter(|p| p.indexed).count();

        Ok(Self {
            name: event.name.clone(),
            selector: event.selector(),
            anonymous: event.anonymous,
            params,
            indexed_count,
        })
    }

    /// Indexed parameter whose topic holds a hash of the value.
    fn hashed_param(&self, name: &str) -> Option<&ParamLayout> {
        self.params
            .iter()
            .find(|p| p.name == name && p.indexed && p.is_hashed_in_topic())
    }

    fn decode(&self, topics: &[B256], data: &[u8]) -> Result<FieldMap, DecodeError> {
        let indexed = if self.anonymous {
            topics
        } else {
            topics.get(1..).ok_or(DecodeError::MissingTopics)?
        };
        if indexed.len() != self.indexed_count {
            return Err(DecodeError::TopicCount {
                expected: self.indexed_count,
                got: indexed.len(),
            });
        }

        let body_types: Vec<DynSolType> = self
            .params
            .iter()
            .filter(|p| !p.indexed)
            .map(|p| p.ty.clone())
            .collect();
        let body = if body_types.is_empty() {
            Vec::new()
        } else {
            match DynSolType::Tuple(body_types).abi_decode_sequence(data) {
                Ok(DynSolValue::Tuple(values)) => values,
                Ok(other) => vec![other],
                Err(e) => {
                    return Err(DecodeError::AbiDecodeFailed {
                        reason: e.to_string(),
                    })
                }
            }
        };

        let mut topic_iter = indexed.iter();
        let mut body_iter = body.into_iter();
        let mut fields = FieldMap::new();
        for param in &self.params {
            let value = if param.indexed {
                let word = topic_iter.next().ok_or(DecodeError::MissingTopics)?;
                decode_topic(param, word)?
            } else {
                let value = body_iter.next().ok_or_else(|| DecodeError::AbiDecodeFailed {
                    reason: format!("missing value for {}", param.name),
                })?;
                normalizer::normalize_named(value, &param.names)
            };
            fields.insert(param.name.clone(), value);
        }
        Ok(fields)
    }
}

fn decode_topic(
    param: &ParamLayout,
    word: &B256,
) -> Result<FieldValue, DecodeError> {
    if param.is_hashed_in_topic() {
        return Ok(FieldValue::Bytes(word.to_vec()));
    }
    param
        .ty
        .abi_decode(word.as_slice())
        .map(normalizer::normalize)
        .map_err(|e| DecodeError::AbiDecodeFailed {
            reason: format!("topic {}: {e}", param.name),
        })
}

// ─── Topic literals ───────────────────────────────────────────────────────────

fn word_hex(word: [u8; 32]) -> String {
    format!("0x{}", hex::encode(word))
}

fn is_hash_shaped(value: &str) -> bool {
    value.len() == 66
        && (value.starts_with("0x") || value.starts_with("0X"))
        && value[2..].bytes().all(|b| b.is_ascii_hexdigit())
}

/// Integer literal (decimal, negative decimal or `0x` hex) as a 32-byte word.
fn parse_word(value: &str) -> Option<[u8; 32]> {
    if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        if hex.is_empty() {
            return None;
        }
        return U256::from_str_radix(hex, 16)
            .ok()
            .map(|u| u.to_be_bytes::<32>());
    }
    if value.starts_with('-') {
        return I256::from_dec_str(value)
            .ok()
            .map(|i| i.into_raw().to_be_bytes::<32>());
    }
    if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
        return U256::from_str_radix(value, 10)
            .ok()
            .map(|u| u.to_be_bytes::<32>());
    }
    None
}

/// Topic word for a filter value on an indexed parameter; `None` = any.
fn topic_literal(param: &ParamLayout, value: &str) -> Result<Option<String>, ConfigError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    if is_hash_shaped(value) {
        return Ok(Some(value.to_ascii_lowercase()));
    }

    match param.ty {
        DynSolType::String => return Ok(Some(word_hex(keccak256(value.as_bytes()).0))),
        DynSolType::Bytes => {
            let preimage = value
                .strip_prefix("0x")
                .and_then(|h| hex::decode(h).ok())
                .unwrap_or_else(|| value.as_bytes().to_vec());
            return Ok(Some(word_hex(keccak256(preimage).0)));
        }
        DynSolType::Bool => match value {
            "true" => return Ok(Some(word_hex(U256::from(1u8).to_be_bytes::<32>()))),
            "false" => return Ok(Some(word_hex([0u8; 32]))),
            _ => {}
        },
        _ => {}
    }

    parse_word(value)
        .map(|w| Some(word_hex(w)))
        .ok_or_else(|| ConfigError::InvalidFilter {
            field: param.name.clone(),
            value: value.to_string(),
            reason: format!("not a hash or integer literal for {}", param.ty.sol_type_name()),
        })
}

/// Topic slots for `event` plus the filter keys they consumed.
fn build_topics(
    event: &EventLayout,
    filters: &IndexMap<String, String>,
) -> Result<(Vec<Option<Vec<String>>>, HashSet<String>), ConfigError> {
    let mut topics = Vec::new();
    let mut consumed = HashSet::new();

    if !event.anonymous {
        topics.push(Some(vec![word_hex(event.selector.0)]));
    }

    for param in &event.params {
        if !param.indexed {
            break;
        }
        match filters.get(&param.name) {
            Some(value) => {
                topics.push(topic_literal(param, value)?.map(|t| vec![t]));
                consumed.insert(param.name.clone());
            }
            None => topics.push(None),
        }
    }

    while matches!(topics.last(), Some(None)) {
        topics.pop();
    }
    Ok((topics, consumed))
}

fn normalize_address(address: &str) -> Result<String, ConfigError> {
    address
        .trim()
        .parse::<Address>()
        .map(|a| format!("0x{}", hex::encode(a.as_slice())))
        .map_err(|_| ConfigError::InvalidAddress {
            address: address.to_string(),
        })
}

fn parse_topic(topic: &str) -> Result<B256, DecodeError> {
    let bytes = hex::decode(topic.strip_prefix("0x").unwrap_or(topic))
        .map_err(|e| DecodeError::InvalidHex(format!("topic {topic}: {e}")))?;
    if bytes.len() != 32 {
        return Err(DecodeError::InvalidHex(format!(
            "topic {topic}: expected 32 bytes, got {}",
            bytes.len()
        )));
    }
    Ok(B256::from_slice(&bytes))
}

fn parse_data(data: &str) -> Result<Vec<u8>, DecodeError> {
    hex::decode(data.strip_prefix("0x").unwrap_or(data))
        .map_err(|e| DecodeError::InvalidHex(format!("data: {e}")))
}

/// `topics[1..] ++ data`, skipping anything that is not valid hex.
fn raw_payload(log: &RawLog) -> Vec<u8> {
    let mut raw = Vec::new();
    for topic in log.topics.iter().skip(1) {
        if let Ok(bytes) = hex::decode(topic.strip_prefix("0x").unwrap_or(topic)) {
            raw.extend(bytes);
        }
    }
    if let Ok(bytes) = parse_data(&log.data) {
        raw.extend(bytes);
    }
    raw
}

// ─── LogFilterDecoder ─────────────────────────────────────────────────────────

/// Per-subscription query builder, decoder and post-filter.
///
/// Built once at startup; construction fails on an unparsable ABI, an
/// unknown target event, an invalid address or a filter value that cannot be
/// turned into a topic.
#[derive(Debug, Clone)]
pub struct LogFilterDecoder {
    alias: String,
    addresses: Vec<String>,
    events: Vec<EventLayout>,
    target: Option<usize>,
    topics: Vec<Option<Vec<String>>>,
    post_filters: Vec<(String, String)>,
}

impl LogFilterDecoder {
    pub fn new(sub: &Subscription) -> Result<Self, ConfigError> {
        if sub.addresses.is_empty() {
            return Err(ConfigError::MissingField {
                field: format!("{}.contract", sub.alias),
            });
        }
        let addresses = sub
            .addresses
            .iter()
            .map(|a| normalize_address(a))
            .collect::<Result<Vec<_>, _>>()?;

        let json_abi = abi::parse(&sub.alias, &sub.abi)?;
        let events = json_abi
            .events()
            .map(|e| EventLayout::new(&sub.alias, e))
            .collect::<Result<Vec<_>, _>>()?;

        let target = match &sub.event_name {
            Some(name) => Some(events.iter().position(|e| &e.name == name).ok_or_else(
                || ConfigError::SchemaMismatch {
                    alias: sub.alias.clone(),
                    event: name.clone(),
                },
            )?),
            None => None,
        };

        let (topics, consumed) = match target {
            Some(i) => build_topics(&events[i], &sub.filters)?,
            None => (Vec::new(), HashSet::new()),
        };

        let post_filters: Vec<(String, String)> = sub
            .filters
            .iter()
            .filter(|(k, _)| !consumed.contains(*k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        if let Some(i) = target {
            for (key, value) in &post_filters {
                if let Some(param) = events[i].hashed_param(key) {
                    topic_literal(param, value)?;
                }
            }
        }

        Ok(Self {
            alias: sub.alias.clone(),
            addresses,
            events,
            target,
            topics,
            post_filters,
        })
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Topic constraints sent with every query.
    pub fn topics(&self) -> &[Option<Vec<String>>] {
        &self.topics
    }

    /// The `eth_getLogs` filter for blocks `[from, to]`.
    pub fn query(&self, from: u64, to: u64) -> LogQuery {
        LogQuery {
            addresses: self.addresses.clone(),
            topics: self.topics.clone(),
            from_block: from,
            to_block: to,
        }
    }

    /// Raw logs for `[from, to]`.
    pub async fn fetch(
        &self,
        transport: &dyn ChainTransport,
        from: u64,
        to: u64,
    ) -> Result<Vec<RawLog>, TransportError> {
        transport.filter_logs(&self.query(from, to)).await
    }

    /// Fetch, decode and post-filter `[from, to]`.
    pub async fn fetch_records(
        &self,
        transport: &dyn ChainTransport,
        from: u64,
        to: u64,
    ) -> Result<Vec<Record>, TransportError> {
        let logs = self.fetch(transport, from, to).await?;
        let mut records = Vec::with_capacity(logs.len());
        for log in &logs {
            if log.is_removed() {
                continue;
            }
            let record = self.decode(log);
            if self.matches(&record) {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn identify(&self, topic0: Option<&B256>, topic_count: usize) -> Option<&EventLayout> {
        if let Some(i) = self.target {
            return Some(&self.events[i]);
        }
        let topic0 = topic0?;
        let mut candidates = self
            .events
            .iter()
            .filter(|e| !e.anonymous && &e.selector == topic0);
        let first = candidates.next()?;
        if first.indexed_count + 1 == topic_count {
            return Some(first);
        }
        candidates
            .find(|e| e.indexed_count + 1 == topic_count)
            .or(Some(first))
    }

    /// Decodes `log` into a record. Never fails: a log that doesn't fit the
    /// ABI comes back with an empty field map and `raw` set.
    pub fn decode(&self, log: &RawLog) -> Record {
        let mut record = Record {
            alias: self.alias.clone(),
            address: log.address.to_ascii_lowercase(),
            block_hash: log.block_hash.clone(),
            block_number: log.block_number_u64(),
            tx_hash: log.tx_hash.clone(),
            log_index: log.log_index_u64(),
            topic0: log.topics.first().cloned(),
            event_name: None,
            fields: FieldMap::new(),
            raw: None,
        };

        let result = log
            .topics
            .iter()
            .map(|t| parse_topic(t))
            .collect::<Result<Vec<_>, _>>()
            .and_then(|topics| {
                let event = self.identify(topics.first(), topics.len()).ok_or_else(|| {
                    DecodeError::UnknownEvent {
                        topic0: log.topics.first().cloned().unwrap_or_default(),
                    }
                })?;
                record.event_name = Some(event.name.clone());
                if !event.anonymous && topics.first() != Some(&event.selector) {
                    return Err(DecodeError::UnknownEvent {
                        topic0: log.topics.first().cloned().unwrap_or_default(),
                    });
                }
                event.decode(&topics, &parse_data(&log.data)?)
            });

        match result {
            Ok(fields) => record.fields = fields,
            Err(e) => {
                debug!(
                    alias = %self.alias,
                    tx = %log.tx_hash,
                    log_index = record.log_index,
                    error = %e,
                    "log kept undecoded"
                );
                record.raw = Some(raw_payload(log));
            }
        }
        record
    }

    /// The filter literal as the record carries it: indexed `string`/`bytes`
    /// values only exist as their topic hash, so the literal is hashed too.
    fn expected_value(&self, record: &Record, key: &str, literal: &str) -> String {
        record
            .event_name
            .as_deref()
            .and_then(|name| self.events.iter().find(|e| e.name == name))
            .and_then(|event| event.hashed_param(key))
            .and_then(|param| topic_literal(param, literal).ok().flatten())
            .unwrap_or_else(|| literal.to_string())
    }

    /// Checks every filter not already enforced by a topic.
    ///
    /// The value's canonical string must equal the filter literally; a
    /// record without the field does not match.
    pub fn matches(&self, record: &Record) -> bool {
        for (key, literal) in &self.post_filters {
            let expected = self.expected_value(record, key, literal);
            match record.lookup(key) {
                None => {
                    debug!(alias = %self.alias, tx = %record.tx_hash, field = %key, "filter field missing, record dropped");
                    return false;
                }
                Some(value) => {
                    let actual = canonical_json_string(&value);
                    if actual != expected {
                        debug!(alias = %self.alias, tx = %record.tx_hash, field = %key, %actual, %expected, "filter mismatch, record dropped");
                        return false;
                    }
                }
            }
        }
        true
    }
}
