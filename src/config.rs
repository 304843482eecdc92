//! Agent configuration from environment variables
//!
//! `.env` is loaded by the binary before `MetricStoreConfig::from_env` runs.

use crate::codec::DecimalCodec;
use crate::pipeline::cache::CacheConfig;
use crate::query::UnknownTopicPolicy;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_DB_PATH: &str = "/var/lib/fty/fty-metric-store/metric-store.db";
pub const DEFAULT_SHM_DIR: &str = "/var/run/fty_shm";
pub const DEFAULT_ENDPOINT: &str = "ipc://@/malamute";
pub const DEFAULT_AGENT_NAME: &str = "fty-metric-store";

#[derive(Debug)]
pub enum ConfigError {
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone)]
pub struct MetricStoreConfig {
    /// SQLite database file
    pub db_path: PathBuf,

    /// Shared-memory metric directory
    pub shm_dir: PathBuf,

    /// Shared-memory scrape period
    pub polling_interval: Duration,

    /// Flush timer period
    pub flush_interval: Duration,

    /// Write-back cache thresholds
    pub cache: CacheConfig,

    pub decimal_codec: DecimalCodec,

    pub unknown_topic: UnknownTopicPolicy,

    /// Bus endpoint and agent name for the startup CONNECT
    pub endpoint: String,
    pub agent_name: String,

    /// Bound of the control and bus delivery channels
    pub channel_buffer: usize,
}

impl Default for MetricStoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            shm_dir: PathBuf::from(DEFAULT_SHM_DIR),
            polling_interval: Duration::from_secs(30),
            flush_interval: Duration::from_millis(1000),
            cache: CacheConfig::default(),
            decimal_codec: DecimalCodec::Exact,
            unknown_topic: UnknownTopicPolicy::Reject,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            agent_name: DEFAULT_AGENT_NAME.to_string(),
            channel_buffer: 10_000,
        }
    }
}

impl MetricStoreConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `METRIC_STORE_DB_PATH` (default: /var/lib/fty/fty-metric-store/metric-store.db)
    /// - `METRIC_STORE_SHM_DIR` (default: /var/run/fty_shm)
    /// - `FTY_POLLING_INTERVAL` seconds (default: 30)
    /// - `METRIC_STORE_FLUSH_INTERVAL_MS` (default: 1000)
    /// - `BIOS_DBSTORE_MAX_ROW` / `BIOS_DBSTORE_MAX_DELAY` (see `CacheConfig`)
    /// - `METRIC_STORE_DECIMAL_CODEC` exact|legacy (default: exact)
    /// - `METRIC_STORE_UNKNOWN_TOPIC` reject|empty (default: reject)
    /// - `METRIC_STORE_ENDPOINT` (default: ipc://@/malamute)
    /// - `METRIC_STORE_AGENT_NAME` (default: fty-metric-store)
    /// - `METRIC_STORE_CHANNEL_BUFFER` (default: 10000)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let polling_secs: u64 = parse_or(&lookup, "FTY_POLLING_INTERVAL", 30);
        if polling_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "FTY_POLLING_INTERVAL must be at least 1 second".to_string(),
            ));
        }

        let flush_ms: u64 = parse_or(&lookup, "METRIC_STORE_FLUSH_INTERVAL_MS", 1000);
        if flush_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "METRIC_STORE_FLUSH_INTERVAL_MS must be positive".to_string(),
            ));
        }

        let channel_buffer: usize = parse_or(&lookup, "METRIC_STORE_CHANNEL_BUFFER", 10_000);
        if channel_buffer == 0 {
            return Err(ConfigError::InvalidValue(
                "METRIC_STORE_CHANNEL_BUFFER must be positive".to_string(),
            ));
        }

        let decimal_codec = match lookup("METRIC_STORE_DECIMAL_CODEC") {
            Some(raw) => raw.parse().unwrap_or_else(|e| {
                log::warn!("⚠️  {}, defaulting to exact", e);
                DecimalCodec::Exact
            }),
            None => defaults.decimal_codec,
        };

        let unknown_topic = match lookup("METRIC_STORE_UNKNOWN_TOPIC") {
            Some(raw) => raw.parse().unwrap_or_else(|e| {
                log::warn!("⚠️  {}, defaulting to reject", e);
                UnknownTopicPolicy::Reject
            }),
            None => defaults.unknown_topic,
        };

        Ok(Self {
            db_path: lookup("METRIC_STORE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            shm_dir: lookup("METRIC_STORE_SHM_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.shm_dir),
            polling_interval: Duration::from_secs(polling_secs),
            flush_interval: Duration::from_millis(flush_ms),
            cache: CacheConfig::from_lookup(&lookup),
            decimal_codec,
            unknown_topic,
            endpoint: lookup("METRIC_STORE_ENDPOINT").unwrap_or(defaults.endpoint),
            agent_name: lookup("METRIC_STORE_AGENT_NAME").unwrap_or(defaults.agent_name),
            channel_buffer,
        })
    }

    pub fn log_summary(&self) {
        log::info!("🔧 Configuration:");
        log::info!("   ├─ Database: {}", self.db_path.display());
        log::info!("   ├─ Shared memory: {}", self.shm_dir.display());
        log::info!("   ├─ Polling interval: {}s", self.polling_interval.as_secs());
        log::info!("   ├─ Flush interval: {}ms", self.flush_interval.as_millis());
        log::info!(
            "   ├─ Cache: {} rows / {}s",
            self.cache.max_rows,
            self.cache.max_delay.as_secs()
        );
        log::info!("   ├─ Decimal codec: {}", self.decimal_codec.as_str());
        log::info!("   ├─ Unknown topics: {}", self.unknown_topic.as_str());
        log::info!("   └─ Endpoint: {} as {}", self.endpoint, self.agent_name);
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup(key)
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}
