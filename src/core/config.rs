//! Configuration - loaded once at startup, immutable afterwards

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::core::{Error, Result};
use crate::queue::OverflowPolicy;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub queue: QueueConfig,
    pub routing: RoutingConfig,
    pub provider: ProviderConfig,
    pub historical: HistoricalConfig,
    pub live: LiveConfig,
    pub strategy: StrategyConfig,
    pub execution: ExecutionConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of strategy engine threads
    pub num_engine_threads: usize,

    /// Number of ingestion listeners. Each engine queue has one producer,
    /// so a server runs exactly one.
    pub num_listeners: usize,

    /// Pin engine threads to cores
    pub pin_cores: bool,

    /// Spins before an idle engine starts yielding
    pub idle_spins: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { num_engine_threads: 4, num_listeners: 1, pin_cores: false, idle_spins: 64 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Jobs buffered per engine
    pub capacity: usize,

    /// What the scheduler does when an engine queue is full
    pub overflow: OverflowPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { capacity: 65_536, overflow: OverflowPolicy::Reject }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Instruments expected in the session; all must resolve to an engine
    pub instruments: Vec<u32>,

    /// Explicit instrument -> engine assignments
    #[serde(deserialize_with = "instrument_keys")]
    pub overrides: HashMap<u32, usize>,
}

/// TOML table keys are always strings.
fn instrument_keys<'de, D>(deserializer: D) -> std::result::Result<HashMap<u32, usize>, D::Error>
where
    D: Deserializer<'de>,
{
    HashMap::<String, usize>::deserialize(deserializer)?
        .into_iter()
        .map(|(k, v)| {
            k.trim()
                .parse::<u32>()
                .map(|id| (id, v))
                .map_err(|_| serde::de::Error::custom(format!("invalid instrument id '{}'", k)))
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Historical,
    Live,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub kind: ProviderKind,

    /// Reconnect attempts after a provider failure
    pub max_retries: u32,

    /// First reconnect delay; doubles each attempt
    pub retry_backoff_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self { kind: ProviderKind::Historical, max_retries: 3, retry_backoff_ms: 250 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoricalConfig {
    /// JSON-lines record files, replayed in this order
    pub files: Vec<PathBuf>,

    /// Files loaded ahead of the replay cursor
    pub download_concurrency: usize,
}

impl Default for HistoricalConfig {
    fn default() -> Self {
        Self { files: vec![], download_concurrency: 2 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// host:port of the JSON-lines feed
    pub address: String,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self { address: "127.0.0.1:9400".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// Size quoted on each side
    pub quote_qty: u32,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self { quote_qty: 1 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Finished orders each engine keeps for reporting; older ones are
    /// only counted
    pub order_history: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self { order_history: 4096 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// EnvFilter directive, overridden by RUST_LOG
    pub level: String,

    /// Append to this file instead of stdout
    pub file: Option<PathBuf>,

    /// Lines buffered for the writer thread
    pub buffer: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info,aleph_engine=debug".to_string(), file: None, buffer: 16_384 }
    }
}

impl Config {
    /// Load from TOML file and validate
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config {}: {}", path.display(), e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Fail fast on anything that would break routing or the queues.
    pub fn validate(&self) -> Result<()> {
        if self.engine.num_engine_threads == 0 {
            return Err(Error::Routing("num_engine_threads must be at least 1".into()));
        }
        if self.engine.num_listeners != 1 {
            return Err(Error::Config(format!(
                "num_listeners = {} not supported: engine queues are single-producer",
                self.engine.num_listeners
            )));
        }
        if self.queue.capacity == 0 {
            return Err(Error::Config("queue.capacity must be at least 1".into()));
        }
        if self.historical.download_concurrency == 0 {
            return Err(Error::Config("historical.download_concurrency must be at least 1".into()));
        }
        if self.strategy.quote_qty == 0 {
            return Err(Error::Config("strategy.quote_qty must be at least 1".into()));
        }
        if self.logging.buffer == 0 {
            return Err(Error::Config("logging.buffer must be at least 1".into()));
        }
        match self.provider.kind {
            ProviderKind::Historical if self.historical.files.is_empty() => {
                Err(Error::Config("historical provider selected but no files configured".into()))
            }
            ProviderKind::Live if self.live.address.is_empty() => {
                Err(Error::Config("live provider selected but no address configured".into()))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let raw = r#"
            [engine]
            num_engine_threads = 2
            pin_cores = true

            [queue]
            capacity = 8
            overflow = "block"

            [routing]
            instruments = [1001, 1002]
            overrides = { 1001 = 1 }

            [execution]
            order_history = 16

            [provider]
            kind = "live"

            [live]
            address = "10.0.0.5:9000"
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.engine.num_engine_threads, 2);
        assert_eq!(config.engine.num_listeners, 1);
        assert_eq!(config.queue.overflow, OverflowPolicy::Block);
        assert_eq!(config.routing.overrides.get(&1001), Some(&1));
        assert_eq!(config.provider.kind, ProviderKind::Live);
        assert_eq!(config.execution.order_history, 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_engines_is_routing_error() {
        let mut config = Config::default();
        config.historical.files = vec!["a.jsonl".into()];
        config.engine.num_engine_threads = 0;
        assert!(matches!(config.validate(), Err(Error::Routing(_))));
    }

    #[test]
    fn test_multiple_listeners_rejected() {
        let mut config = Config::default();
        config.historical.files = vec!["a.jsonl".into()];
        config.engine.num_listeners = 2;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_historical_requires_files() {
        let config = Config::default();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_missing_file() {
        let err = Config::load(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
