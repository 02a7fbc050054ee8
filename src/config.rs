use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the trafficwatch agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Capture device configuration.
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Batching and flush queue configuration.
    #[serde(default)]
    pub batch: BatchConfig,

    /// Persistent store configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Capture device configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Substring of the device description to capture on (case-sensitive).
    #[serde(default)]
    pub device: String,

    /// Maximum bytes captured per frame. Default: 65535.
    #[serde(default = "default_snaplen")]
    pub snaplen: i32,

    /// Put the interface in promiscuous mode. Default: false.
    #[serde(default)]
    pub promiscuous: bool,

    /// How long a read may block before re-checking for shutdown. Default: 1s.
    #[serde(default = "default_read_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,

    /// Interval between per-protocol capture summaries. Default: 60s.
    #[serde(default = "default_stats_interval", with = "humantime_serde")]
    pub stats_interval: Duration,
}

/// Batching and flush queue configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    /// Records per bulk insert. Default: 100.
    #[serde(default = "default_batch_size")]
    pub size: usize,

    /// Full batches that may wait for the flush worker. Default: 16.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// Extra attempts for retained records at shutdown. Default: 3.
    #[serde(default = "default_shutdown_retries")]
    pub shutdown_retries: u32,

    /// First backoff between shutdown retries, doubled each attempt. Default: 500ms.
    #[serde(default = "default_retry_backoff", with = "humantime_serde")]
    pub retry_backoff: Duration,
}

/// Persistent store configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct StoreConfig {
    /// ClickHouse connection configuration.
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,
}

/// ClickHouse connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    /// Native protocol endpoint (host:port).
    #[serde(default)]
    pub endpoint: String,

    /// Target database. Default: "network_traffic".
    #[serde(default = "default_database")]
    pub database: String,

    /// Traffic table. Default: "traffic_data".
    #[serde(default = "default_table")]
    pub table: String,

    /// Authentication username.
    #[serde(default)]
    pub username: String,

    /// Authentication password.
    #[serde(default)]
    pub password: String,

    /// Schema migration configuration.
    #[serde(default)]
    pub migrations: MigrationsConfig,
}

/// Schema migration behavior configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct MigrationsConfig {
    /// Create the database and apply migrations on startup. Default: false.
    #[serde(default)]
    pub enabled: bool,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_snaplen() -> i32 {
    65_535
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_stats_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_batch_size() -> usize {
    crate::pipeline::batch::DEFAULT_BATCH_SIZE
}

fn default_queue_depth() -> usize {
    16
}

fn default_shutdown_retries() -> u32 {
    3
}

fn default_retry_backoff() -> Duration {
    Duration::from_millis(500)
}

fn default_database() -> String {
    "network_traffic".to_string()
}

fn default_table() -> String {
    "traffic_data".to_string()
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            capture: CaptureConfig::default(),
            batch: BatchConfig::default(),
            store: StoreConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: String::new(),
            snaplen: default_snaplen(),
            promiscuous: false,
            read_timeout: default_read_timeout(),
            stats_interval: default_stats_interval(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size: default_batch_size(),
            queue_depth: default_queue_depth(),
            shutdown_retries: default_shutdown_retries(),
            retry_backoff: default_retry_backoff(),
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            database: default_database(),
            table: default_table(),
            username: String::new(),
            password: String::new(),
            migrations: MigrationsConfig::default(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        Self::from_yaml_str(&data).with_context(|| format!("loading config file {}", path.display()))
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml_str(data: &str) -> Result<Self> {
        let cfg: Config = serde_yaml::from_str(data).context("parsing config")?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.capture.device.is_empty() {
            bail!("capture.device is required");
        }

        if self.capture.snaplen <= 0 {
            bail!("capture.snaplen must be positive");
        }

        if self.capture.read_timeout.is_zero() {
            bail!("capture.read_timeout must be positive");
        }

        if self.capture.stats_interval.is_zero() {
            bail!("capture.stats_interval must be positive");
        }

        if self.batch.size == 0 {
            bail!("batch.size must be positive");
        }

        if self.batch.queue_depth == 0 {
            bail!("batch.queue_depth must be positive");
        }

        let ch = &self.store.clickhouse;
        if ch.endpoint.is_empty() {
            bail!("store.clickhouse.endpoint is required");
        }

        if ch.database.is_empty() {
            bail!("store.clickhouse.database is required");
        }

        if ch.table.is_empty() {
            bail!("store.clickhouse.table is required");
        }

        if !is_identifier(&ch.database) || !is_identifier(&ch.table) {
            bail!("store.clickhouse.database and table must be plain identifiers ([A-Za-z0-9_])");
        }

        Ok(())
    }
}

fn is_identifier(s: &str) -> bool {
    s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Supplies the agent configuration.
pub trait ConfigProvider {
    fn load(&self) -> Result<Config>;
}

/// Reads configuration from a YAML file on disk.
pub struct YamlFileProvider {
    path: PathBuf,
}

impl YamlFileProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfigProvider for YamlFileProvider {
    fn load(&self) -> Result<Config> {
        Config::load(&self.path)
    }
}
