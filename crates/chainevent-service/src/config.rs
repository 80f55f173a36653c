//! YAML configuration.
//!
//! ```yaml
//! chain:
//!   rpc_node: https://eth.llamarpc.com
//!   delay_block: 3
//! db:
//!   engine: sqlite
//!   dsn: ./chainevent.db
//! http:
//!   port: 8080
//!   prefix_path: /api
//! subscriptions:
//!   - alias: usdt
//!     contract: 0xdAC17F958D2ee523a2206206994597C13D831ec7
//!     abi_file: erc20
//!     event_name: Transfer
//!     filter:
//!       to: "0x28C6c06298d514Db089934071355E5743bf21d60"
//!     start_block: 19000000
//!     web_hook: http://localhost:9000/hook
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};

use chainevent_core::error::ConfigError;
use chainevent_core::types::Subscription;
use chainevent_evm::{abi, PollerConfig};

use crate::logging::LogConfig;
use crate::notify::NotifyConfig;

// ─── Sections ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// JSON-RPC endpoint URL.
    pub rpc_node: String,
    /// Confirmation depth: blocks kept back from the head.
    #[serde(default)]
    pub delay_block: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// How long a fetched head stays fresh.
    #[serde(default = "default_head_freshness_ms")]
    pub head_freshness_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    2
}

fn default_head_freshness_ms() -> u64 {
    2_000
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbEngine {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    #[serde(default)]
    pub engine: DbEngine,
    /// SQLite file path or `sqlite:` URL.
    #[serde(default = "default_dsn")]
    pub dsn: String,
}

fn default_dsn() -> String {
    "./chainevent.db".into()
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            engine: DbEngine::default(),
            dsn: default_dsn(),
        }
    }
}

/// Query API. Disabled when `port` is 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub prefix_path: String,
}

fn default_host() -> String {
    "0.0.0.0".into()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 0,
            prefix_path: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerSettings {
    #[serde(default = "default_max_window")]
    pub max_window: u64,
    #[serde(default = "default_active_delay_ms")]
    pub active_delay_ms: u64,
    #[serde(default = "default_idle_delay_ms")]
    pub idle_delay_ms: u64,
    #[serde(default = "default_transport_backoff_ms")]
    pub transport_backoff_ms: u64,
    #[serde(default = "default_storage_backoff_ms")]
    pub storage_backoff_ms: u64,
}

fn default_max_window() -> u64 {
    5
}
fn default_active_delay_ms() -> u64 {
    100
}
fn default_idle_delay_ms() -> u64 {
    2_000
}
fn default_transport_backoff_ms() -> u64 {
    5_000
}
fn default_storage_backoff_ms() -> u64 {
    10_000
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            max_window: default_max_window(),
            active_delay_ms: default_active_delay_ms(),
            idle_delay_ms: default_idle_delay_ms(),
            transport_backoff_ms: default_transport_backoff_ms(),
            storage_backoff_ms: default_storage_backoff_ms(),
        }
    }
}

impl PollerSettings {
    pub fn to_poller_config(&self) -> PollerConfig {
        PollerConfig {
            max_window: self.max_window,
            active_delay: Duration::from_millis(self.active_delay_ms),
            idle_delay: Duration::from_millis(self.idle_delay_ms),
            transport_backoff: Duration::from_millis(self.transport_backoff_ms),
            storage_backoff: Duration::from_millis(self.storage_backoff_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifySettings {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_webhook_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_notify_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_notify_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_batch_size() -> usize {
    10
}
fn default_webhook_timeout_ms() -> u64 {
    10_000
}
fn default_notify_interval_ms() -> u64 {
    1_000
}
fn default_notify_backoff_ms() -> u64 {
    3_000
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            timeout_ms: default_webhook_timeout_ms(),
            interval_ms: default_notify_interval_ms(),
            backoff_ms: default_notify_backoff_ms(),
        }
    }
}

impl NotifySettings {
    pub fn to_notify_config(&self) -> NotifyConfig {
        NotifyConfig {
            batch_size: self.batch_size.max(1),
            interval: Duration::from_millis(self.interval_ms),
            backoff: Duration::from_millis(self.backoff_ms),
            ..NotifyConfig::default()
        }
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// ─── Subscriptions ───────────────────────────────────────────────────────────

/// One entry of the `subscriptions` list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionConf {
    pub alias: String,
    /// A single address or a list of addresses.
    #[serde(deserialize_with = "one_or_many")]
    pub contract: Vec<String>,
    /// Built-in ABI name (`erc20`, `erc721`, `erc1155`) or path to an ABI JSON file.
    pub abi_file: String,
    #[serde(default)]
    pub event_name: Option<String>,
    #[serde(default)]
    pub filter: IndexMap<String, serde_yaml::Value>,
    #[serde(default)]
    pub start_block: u64,
    #[serde(default)]
    pub web_hook: Option<String>,
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

fn filter_value_string(field: &str, value: &serde_yaml::Value) -> Result<String, ConfigError> {
    match value {
        serde_yaml::Value::String(s) => Ok(s.clone()),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        serde_yaml::Value::Bool(b) => Ok(b.to_string()),
        serde_yaml::Value::Null => Ok(String::new()),
        other => Err(ConfigError::InvalidFilter {
            field: field.to_string(),
            value: format!("{other:?}"),
            reason: "expected a scalar".into(),
        }),
    }
}

pub fn validate_alias(alias: &str) -> Result<(), ConfigError> {
    if alias.is_empty() {
        return Err(ConfigError::InvalidAlias {
            alias: alias.to_string(),
            reason: "must not be empty".into(),
        });
    }
    if !alias
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ConfigError::InvalidAlias {
            alias: alias.to_string(),
            reason: "only letters, digits, '_' and '-' are allowed".into(),
        });
    }
    Ok(())
}

fn validate_url(raw: &str) -> Result<(), ConfigError> {
    let parsed = url::Url::parse(raw).map_err(|e| ConfigError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ConfigError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme '{other}'"),
        }),
    }
}

impl SubscriptionConf {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_alias(&self.alias)?;
        if self.contract.is_empty() {
            return Err(ConfigError::MissingField {
                field: format!("{}.contract", self.alias),
            });
        }
        if self.abi_file.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: format!("{}.abi_file", self.alias),
            });
        }
        if let Some(hook) = &self.web_hook {
            validate_url(hook)?;
        }
        Ok(())
    }

    /// Resolves the ABI and builds the runtime subscription.
    ///
    /// Relative ABI paths are looked up next to the configuration file.
    pub fn to_subscription(&self, base_dir: Option<&Path>) -> Result<Subscription, ConfigError> {
        let abi_json = match abi::builtin(&self.abi_file) {
            Some(json) => json.to_string(),
            None => {
                let path = PathBuf::from(&self.abi_file);
                let path = match base_dir {
                    Some(dir) if path.is_relative() => dir.join(path),
                    _ => path,
                };
                abi::resolve(&path.to_string_lossy())?
            }
        };

        let mut filters = IndexMap::new();
        for (field, value) in &self.filter {
            filters.insert(field.clone(), filter_value_string(field, value)?);
        }

        Ok(Subscription {
            alias: self.alias.clone(),
            addresses: self.contract.clone(),
            abi: abi_json,
            event_name: self.event_name.clone().filter(|n| !n.is_empty()),
            filters,
            start_block: self.start_block,
            webhook: self.web_hook.clone().filter(|h| !h.is_empty()),
        })
    }
}

// ─── Root ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub chain: ChainConfig,
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub poller: PollerSettings,
    #[serde(default)]
    pub notify: NotifySettings,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionConf>,
    /// Directory of the file this config was loaded from.
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

impl Config {
    /// Read, parse and validate a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml_str(&text)?;
        config.base_dir = path.parent().map(Path::to_path_buf);
        Ok(config)
    }

    /// Parse and validate YAML text.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_yaml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_url(&self.chain.rpc_node)?;
        let mut aliases = HashSet::new();
        for sub in &self.subscriptions {
            sub.validate()?;
            if !aliases.insert(sub.alias.as_str()) {
                return Err(ConfigError::DuplicateAlias {
                    alias: sub.alias.clone(),
                });
            }
        }
        Ok(())
    }

    /// Runtime subscriptions with their ABIs resolved.
    pub fn subscriptions(&self) -> Result<Vec<Subscription>, ConfigError> {
        self.subscriptions
            .iter()
            .map(|s| s.to_subscription(self.base_dir.as_deref()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
chain:
  rpc_node: http://localhost:8545
  delay_block: 3
db:
  engine: memory
http:
  port: 8080
  prefix_path: /api
log:
  level: debug
subscriptions:
  - alias: usdt
    contract: "0xdAC17F958D2ee523a2206206994597C13D831ec7"
    abi_file: erc20
    event_name: Transfer
    filter:
      to: 5
      value: "100"
    start_block: 100
    web_hook: http://localhost:9000/hook
  - alias: nft-all
    contract:
      - "0xBC4CA0EdA7647A8aB7C2061c2E118A18a936f13D"
      - "0x60E4d786628Fea6478F785A6d7e704777c86a7c6"
    abi_file: erc721
"#;

    #[test]
    fn parses_sample() {
        let cfg = Config::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(cfg.chain.delay_block, 3);
        assert_eq!(cfg.chain.request_timeout_ms, 10_000);
        assert_eq!(cfg.db.engine, DbEngine::Memory);
        assert_eq!(cfg.http.port, 8080);
        assert_eq!(cfg.log.level, "debug");
        assert_eq!(cfg.poller.max_window, 5);
        assert_eq!(cfg.notify.batch_size, 10);
        assert_eq!(cfg.subscriptions.len(), 2);
        assert_eq!(cfg.subscriptions[1].contract.len(), 2);
    }

    #[test]
    fn subscriptions_resolve_builtin_abis_and_stringify_filters() {
        let cfg = Config::from_yaml_str(SAMPLE).unwrap();
        let subs = cfg.subscriptions().unwrap();

        let usdt = &subs[0];
        assert_eq!(usdt.alias, "usdt");
        assert_eq!(usdt.event_name.as_deref(), Some("Transfer"));
        assert_eq!(usdt.filters["to"], "5");
        assert_eq!(usdt.filters["value"], "100");
        assert_eq!(usdt.filters.keys().collect::<Vec<_>>(), vec!["to", "value"]);
        assert!(usdt.abi.contains("Approval"));
        assert_eq!(usdt.webhook.as_deref(), Some("http://localhost:9000/hook"));

        assert!(subs[1].event_name.is_none());
        assert!(subs[1].webhook.is_none());
    }

    #[test]
    fn defaults_when_sections_missing() {
        let cfg = Config::from_yaml_str("chain:\n  rpc_node: https://rpc.example.org\n").unwrap();
        assert_eq!(cfg.db.engine, DbEngine::Sqlite);
        assert_eq!(cfg.db.dsn, "./chainevent.db");
        assert_eq!(cfg.http.port, 0);
        assert!(cfg.subscriptions.is_empty());
    }

    #[test]
    fn rejects_bad_alias() {
        let yaml = SAMPLE.replace("alias: usdt", "alias: \"usdt; drop\"");
        assert!(matches!(
            Config::from_yaml_str(&yaml).unwrap_err(),
            ConfigError::InvalidAlias { .. }
        ));
    }

    #[test]
    fn rejects_duplicate_alias() {
        let yaml = SAMPLE.replace("alias: nft-all", "alias: usdt");
        assert!(matches!(
            Config::from_yaml_str(&yaml).unwrap_err(),
            ConfigError::DuplicateAlias { alias } if alias == "usdt"
        ));
    }

    #[test]
    fn rejects_bad_webhook_url() {
        let yaml = SAMPLE.replace("http://localhost:9000/hook", "ftp://example.org");
        assert!(matches!(
            Config::from_yaml_str(&yaml).unwrap_err(),
            ConfigError::InvalidUrl { .. }
        ));
    }

    #[test]
    fn rejects_malformed_yaml() {
        assert!(matches!(
            Config::from_yaml_str("chain: [").unwrap_err(),
            ConfigError::Parse(_)
        ));
    }

    #[test]
    fn abi_file_relative_to_config_dir() {
        let dir = std::env::temp_dir().join(format!("chainevent-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("token.json"), abi::ERC20).unwrap();
        let yaml = "chain:\n  rpc_node: http://localhost:8545\nsubscriptions:\n  - alias: t\n    contract: \"0xdAC17F958D2ee523a2206206994597C13D831ec7\"\n    abi_file: token.json\n";
        std::fs::write(dir.join("config.yaml"), yaml).unwrap();

        let cfg = Config::load(dir.join("config.yaml")).unwrap();
        let subs = cfg.subscriptions().unwrap();
        assert!(subs[0].abi.contains("Transfer"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn example_config_is_valid() {
        let cfg = Config::from_yaml_str(include_str!("../../../chainevent.example.yaml")).unwrap();
        let subs = cfg.subscriptions().unwrap();
        assert_eq!(subs.len(), 2);
        assert_eq!(cfg.log.directives(), "info,chainevent_evm=debug");
    }

    #[test]
    fn missing_file_is_io_error() {
        assert!(matches!(
            Config::load("/no/such/chainevent.yaml").unwrap_err(),
            ConfigError::Io(_)
        ));
    }
}
