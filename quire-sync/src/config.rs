//! Server configuration, loadable from TOML.
//!
//! Every field has a default, so a config file only lists what it
//! changes:
//!
//! ```toml
//! bind_addr = "0.0.0.0:9090"
//! storage_path = "/var/lib/quire"
//! token_secret = "change-me"
//!
//! [[access]]
//! document = "6f1c1ab4-7c27-4a3a-9a55-8d0e9b0f3c11"
//! owner = "alice"
//! collaborators = { bob = "editor", carol = "viewer" }
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::auth::{AccessRule, UserId};
use crate::causal::CausalConfig;
use crate::storage::{RetryPolicy, StoreConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    pub max_sessions_per_document: usize,
    /// Broadcast channel capacity per document
    pub broadcast_capacity: usize,
    pub heartbeat_timeout_secs: u64,
    pub prune_interval_secs: u64,
    /// Bound on authentication plus authorization
    pub auth_timeout_ms: u64,
    pub flush_interval_secs: u64,
    /// Documents with no sessions are evicted after this long
    pub idle_eviction_secs: u64,
    /// Consecutive malformed frames tolerated before closing with 1002
    pub max_malformed_messages: u32,
    pub causal_capacity: usize,
    pub causal_retention_window: u64,
    pub save_attempts: u32,
    pub save_backoff_ms: u64,
    pub save_backoff_max_ms: u64,
    /// RocksDB directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    pub token_secret: String,
    /// Owner of documents that have no access rule. Meant for local use.
    pub default_owner: Option<UserId>,
    pub access: Vec<AccessRule>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_sessions_per_document: 100,
            broadcast_capacity: 256,
            heartbeat_timeout_secs: 15,
            prune_interval_secs: 5,
            auth_timeout_ms: 5_000,
            flush_interval_secs: 10,
            idle_eviction_secs: 60,
            max_malformed_messages: 5,
            causal_capacity: 1024,
            causal_retention_window: 4096,
            save_attempts: 4,
            save_backoff_ms: 100,
            save_backoff_max_ms: 5_000,
            storage_path: None,
            token_secret: String::new(),
            default_owner: None,
            access: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_sessions_per_document == 0 {
            return Err(ConfigError::Invalid(
                "max_sessions_per_document must be at least 1".into(),
            ));
        }
        if self.broadcast_capacity == 0 {
            return Err(ConfigError::Invalid("broadcast_capacity must be at least 1".into()));
        }
        if self.save_attempts == 0 {
            return Err(ConfigError::Invalid("save_attempts must be at least 1".into()));
        }
        if self.heartbeat_timeout_secs == 0 || self.prune_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat_timeout_secs and prune_interval_secs must be positive".into(),
            ));
        }
        if self.flush_interval_secs == 0 {
            return Err(ConfigError::Invalid("flush_interval_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn idle_eviction(&self) -> Duration {
        Duration::from_secs(self.idle_eviction_secs)
    }

    pub fn causal(&self) -> CausalConfig {
        CausalConfig {
            capacity: self.causal_capacity,
            retention_window: self.causal_retention_window,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.save_attempts,
            base_delay: Duration::from_millis(self.save_backoff_ms),
            max_delay: Duration::from_millis(self.save_backoff_max_ms),
        }
    }

    pub fn store_config(&self) -> Option<StoreConfig> {
        self.storage_path.clone().map(StoreConfig::at)
    }
}
