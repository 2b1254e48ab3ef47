//! Server configuration.
//!
//! Loaded from an optional TOML file; command-line flags and `DOCWIRE_*`
//! environment variables override it in `main`.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::backend::PoolConfig;
use crate::storage::StorageConfig;
use crate::wire::FrameLimits;
use crate::wire::frame::{DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_MIN_MESSAGE_SIZE};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen: ListenConfig,
    pub backend: BackendConfig,
    pub pool: PoolSection,
    pub cursor: CursorConfig,
    pub log: LogConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub addr: String,
    pub min_message_size: usize,
    pub max_message_size: usize,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:27017".to_string(),
            min_message_size: DEFAULT_MIN_MESSAGE_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// `postgres://…` or `sqlite://<path>`.
    pub url: String,
    /// Credentials of a read-only role (PostgreSQL only).
    pub read_only_url: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://docwire.db".to_string(),
            read_only_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    pub min_connections: usize,
    pub max_connections: usize,
    pub acquire_timeout_ms: u64,
    pub health_check_interval_secs: u64,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 16,
            acquire_timeout_ms: 10_000,
            health_check_interval_secs: 30,
            retry_attempts: 3,
            retry_backoff_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CursorConfig {
    /// Idle time after which a cursor is discarded.
    pub timeout_secs: u64,
    pub default_batch_size: usize,
    pub read_ahead: usize,
    pub page_size: usize,
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 600,
            default_batch_size: 101,
            read_ahead: 256,
            page_size: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "docwire=info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Address of the debug HTTP endpoint; disabled when unset.
    pub addr: Option<String>,
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Reads `path`, or returns defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
                Self::from_toml(&text)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.max_message_size < self.listen.min_message_size {
            return Err(ConfigError::Invalid(
                "listen.max_message_size is smaller than listen.min_message_size".into(),
            ));
        }
        if self.pool.max_connections == 0 {
            return Err(ConfigError::Invalid("pool.max_connections must be positive".into()));
        }
        if self.pool.min_connections > self.pool.max_connections {
            return Err(ConfigError::Invalid(
                "pool.min_connections exceeds pool.max_connections".into(),
            ));
        }
        if self.cursor.default_batch_size == 0 {
            return Err(ConfigError::Invalid("cursor.default_batch_size must be positive".into()));
        }
        self.listen_addr()?;
        self.metrics_addr()?;
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen
            .addr
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("listen.addr '{}': {}", self.listen.addr, e)))
    }

    pub fn metrics_addr(&self) -> Result<Option<SocketAddr>, ConfigError> {
        self.metrics
            .addr
            .as_deref()
            .map(|addr| {
                addr.parse()
                    .map_err(|e| ConfigError::Invalid(format!("metrics.addr '{}': {}", addr, e)))
            })
            .transpose()
    }

    pub fn frame_limits(&self) -> FrameLimits {
        FrameLimits {
            min: self.listen.min_message_size,
            max: self.listen.max_message_size,
        }
    }

    pub fn storage_config(&self) -> StorageConfig {
        StorageConfig {
            pool: PoolConfig::default()
                .with_min_connections(self.pool.min_connections)
                .with_max_connections(self.pool.max_connections)
                .with_acquire_timeout(Duration::from_millis(self.pool.acquire_timeout_ms))
                .with_health_check_interval(Duration::from_secs(
                    self.pool.health_check_interval_secs.max(1),
                )),
            retry_attempts: self.pool.retry_attempts,
            retry_backoff: Duration::from_millis(self.pool.retry_backoff_ms),
            page_size: self.cursor.page_size,
            read_ahead: self.cursor.read_ahead,
        }
    }

    pub fn cursor_timeout(&self) -> Duration {
        Duration::from_secs(self.cursor.timeout_secs)
    }
}
