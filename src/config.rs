//! Configuration management for Tollgate.
//!
//! Values are layered: built-in defaults, then an optional YAML file, then
//! `TOLLGATE_<SECTION>__<FIELD>` environment variables
//! (e.g. `TOLLGATE_STORE__ADDR=cache:6379`).

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Result, TollgateError};
use crate::ratelimit::DEFAULT_KEY_PREFIX;
use crate::store::RedisStoreConfig;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "TOLLGATE";

/// Config file looked up in the working directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "tollgate.yaml";

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Shared state store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Bucket parameters
    #[serde(default)]
    pub limits: LimitsConfig,

    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Log output configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which store implementation backs the limiter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Redis,
    /// Process-local; limits are not shared between instances
    Memory,
}

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Store address (`host:port` or URL)
    #[serde(default = "default_store_addr")]
    pub addr: String,

    /// Logical database index
    #[serde(default)]
    pub db: i64,

    #[serde(default = "default_connect_timeout", with = "humantime_duration")]
    pub connect_timeout: Duration,

    #[serde(default = "default_response_timeout", with = "humantime_duration")]
    pub response_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            addr: default_store_addr(),
            db: 0,
            connect_timeout: default_connect_timeout(),
            response_timeout: default_response_timeout(),
        }
    }
}

impl StoreConfig {
    /// Connection settings for the Redis store.
    pub fn redis(&self) -> RedisStoreConfig {
        RedisStoreConfig {
            addr: self.addr.clone(),
            db: self.db,
            connect_timeout: self.connect_timeout,
            response_timeout: self.response_timeout,
        }
    }
}

fn default_store_addr() -> String {
    "localhost:6379".to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_response_timeout() -> Duration {
    Duration::from_secs(3)
}

/// Bucket parameters applied to every key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Burst size in tokens
    #[serde(default = "default_capacity")]
    pub capacity: u32,

    /// Time to refill an empty bucket
    #[serde(default = "default_window", with = "humantime_duration")]
    pub window: Duration,

    /// Bound on each store round trip; `0s` disables it
    #[serde(default = "default_call_timeout", with = "humantime_duration")]
    pub call_timeout: Duration,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            window: default_window(),
            call_timeout: default_call_timeout(),
        }
    }
}

impl LimitsConfig {
    /// The call timeout, or `None` when disabled.
    pub fn call_timeout(&self) -> Option<Duration> {
        Some(self.call_timeout).filter(|t| !t.is_zero())
    }
}

fn default_capacity() -> u32 {
    100
}

fn default_window() -> Duration {
    Duration::from_secs(60)
}

fn default_call_timeout() -> Duration {
    Duration::from_secs(3)
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Prefix prepended to the client identity to form the bucket key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TollgateConfig {
    /// Load configuration from defaults, an optional file and the environment.
    ///
    /// A missing file is not an error when `path` is `None`.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let file = match path {
            Some(path) => config::File::with_name(path).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let config: TollgateConfig = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from YAML text.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollgateConfig =
            serde_yaml::from_str(yaml).map_err(|e| TollgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the limiter cannot be built from.
    pub fn validate(&self) -> Result<()> {
        if self.limits.capacity == 0 {
            return Err(TollgateError::Config(
                "limits.capacity must be > 0".to_string(),
            ));
        }
        if self.limits.window.is_zero() {
            return Err(TollgateError::Config("limits.window must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Serde adapter for human-readable durations such as `1m` or `500ms`.
mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
    }
}
