use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::retry::RetryPolicy;
use crate::server::TrustedSubnet;

/// Top-level configuration shared by the agent and server roles.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Metrics agent configuration.
    #[serde(default)]
    pub agent: AgentConfig,

    /// Collector HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Collector storage backend configuration.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Metrics agent configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Collector base URL. Default: "http://localhost:8080".
    #[serde(default = "default_agent_address")]
    pub address: String,

    /// How often to sample metrics. Default: 2s.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// How often to queue a batch for delivery. Default: 10s.
    #[serde(default = "default_report_interval", with = "humantime_serde")]
    pub report_interval: Duration,

    /// Number of concurrent delivery workers. Default: 1.
    #[serde(default = "default_rate_limit")]
    pub rate_limit: usize,

    /// Batches buffered between the reporter and the workers. Default: 16.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// Request body compression (none, gzip). Default: gzip.
    #[serde(default)]
    pub compression: Compression,

    /// Timeout for a single delivery request. Default: 10s.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Delivery retry policy.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Shared HMAC key. Empty disables signing.
    #[serde(default)]
    pub key: String,

    /// Collector public key (PEM). Unset disables encryption.
    #[serde(default)]
    pub crypto_key: Option<PathBuf>,
}

/// Request body compression.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    #[default]
    Gzip,
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Gzip => f.write_str("gzip"),
        }
    }
}

/// Collector HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address. Default: "0.0.0.0:8080".
    #[serde(default = "default_server_address")]
    pub address: String,

    /// Shared HMAC key. Empty disables verification and response signing.
    #[serde(default)]
    pub key: String,

    /// Collector private key (PEM). Unset disables decryption.
    #[serde(default)]
    pub crypto_key: Option<PathBuf>,

    /// CIDR that `X-Real-IP` must fall in. Empty accepts every agent.
    #[serde(default)]
    pub trusted_subnet: String,
}

/// Collector storage backend configuration.
///
/// A non-empty `database_dsn` selects the transactional backend. Otherwise a
/// non-empty `file_path` selects the file-backed store. Otherwise metrics
/// live only in memory.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// SQLite DSN, e.g. "sqlite:///var/lib/telemetron/metrics.db".
    #[serde(default)]
    pub database_dsn: String,

    /// Metrics log file. Default: "/tmp/metrics-db.json".
    #[serde(default = "default_file_path")]
    pub file_path: PathBuf,

    /// Snapshot period; 0 writes every update synchronously. Default: 300s.
    #[serde(default = "default_store_interval", with = "humantime_serde")]
    pub store_interval: Duration,

    /// Replay the file on startup. Default: true.
    #[serde(default = "default_true")]
    pub restore: bool,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Serve /metrics and /healthz. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_agent_address() -> String {
    "http://localhost:8080".to_string()
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_report_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_rate_limit() -> usize {
    1
}

fn default_queue_size() -> usize {
    16
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_server_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_file_path() -> PathBuf {
    PathBuf::from("/tmp/metrics-db.json")
}

fn default_store_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_true() -> bool {
    true
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            agent: AgentConfig::default(),
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            address: default_agent_address(),
            poll_interval: default_poll_interval(),
            report_interval: default_report_interval(),
            rate_limit: default_rate_limit(),
            queue_size: default_queue_size(),
            compression: Compression::default(),
            request_timeout: default_request_timeout(),
            retry: RetryPolicy::default(),
            key: String::new(),
            crypto_key: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_server_address(),
            key: String::new(),
            crypto_key: None,
            trusted_subnet: String::new(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_dsn: String::new(),
            file_path: default_file_path(),
            store_interval: default_store_interval(),
            restore: true,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
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

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        self.agent.validate()?;
        self.server.validate()?;

        if self.health.enabled && self.health.addr.is_empty() {
            bail!("health.addr is required when health is enabled");
        }

        Ok(())
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.address.starts_with("http://") || self.address.starts_with("https://")) {
            bail!("agent.address must be an http:// or https:// URL");
        }

        if self.poll_interval.is_zero() {
            bail!("agent.poll_interval must be positive");
        }

        if self.report_interval.is_zero() {
            bail!("agent.report_interval must be positive");
        }

        if self.rate_limit == 0 {
            bail!("agent.rate_limit must be positive");
        }

        if self.queue_size == 0 {
            bail!("agent.queue_size must be positive");
        }

        if self.request_timeout.is_zero() {
            bail!("agent.request_timeout must be positive");
        }

        Ok(())
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        self.address
            .parse::<SocketAddr>()
            .with_context(|| format!("server.address {:?} is not host:port", self.address))?;

        self.trusted_subnet()?;

        Ok(())
    }

    /// Parses `trusted_subnet`, returning `None` when unset.
    pub fn trusted_subnet(&self) -> Result<Option<TrustedSubnet>> {
        if self.trusted_subnet.is_empty() {
            return Ok(None);
        }

        self.trusted_subnet
            .parse()
            .map(Some)
            .with_context(|| format!("server.trusted_subnet {:?}", self.trusted_subnet))
    }
}
