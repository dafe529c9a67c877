//! Server configuration
//!
//! Loaded from YAML. String values may reference the environment as `${VAR}`
//! or `${VAR:-default}`; every section has defaults so partial files load.
//!
//! ```yaml
//! host: ${HOSTNAME:-rill-0}
//! storage:
//!   data_dir: /var/lib/rill
//!   max_segment_size: 268435456
//! pool:
//!   max_executors: 256
//! executor:
//!   poll_interval_ms: 50
//!   checkpoint_interval: 100
//! registry:
//!   max_attempts: 5
//! ```

use rill_core::StorageConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use crate::{ServerError, ServerResult};

/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// System hostname via the `hostname` command, falling back to "unknown".
fn hostname() -> String {
    std::process::Command::new("hostname")
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_owned())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_owned())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Name this process announces to the registry
    pub host: String,

    pub storage: StorageConfig,

    /// Directory for per-task binlog position records; defaults to
    /// `<storage.data_dir>/positions`
    pub positions_dir: Option<PathBuf>,

    pub pool: PoolConfig,

    pub executor: ExecutorConfig,

    pub registry: RegistryRetryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: hostname(),
            storage: StorageConfig::default(),
            positions_dir: None,
            pool: PoolConfig::default(),
            executor: ExecutorConfig::default(),
            registry: RegistryRetryConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> ServerResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> ServerResult<Self> {
        let expanded = expand_env_vars(content);
        let config: Self = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_max_executors(mut self, max_executors: usize) -> Self {
        self.pool.max_executors = max_executors;
        self
    }

    pub fn positions_dir(&self) -> PathBuf {
        self.positions_dir
            .clone()
            .unwrap_or_else(|| self.storage.data_dir.join("positions"))
    }

    pub fn validate(&self) -> ServerResult<()> {
        if self.host.trim().is_empty() {
            return Err(ServerError::config("host must not be empty"));
        }
        if self.pool.max_executors == 0 {
            return Err(ServerError::config("pool.max_executors must be greater than zero"));
        }
        if self.executor.checkpoint_interval == 0 {
            return Err(ServerError::config(
                "executor.checkpoint_interval must be greater than zero",
            ));
        }
        if self.registry.max_attempts == 0 {
            return Err(ServerError::config("registry.max_attempts must be at least 1"));
        }
        self.storage.validate()?;
        Ok(())
    }
}

/// Expand environment variables in the format ${VAR} or ${VAR:-default}
fn expand_env_vars(content: &str) -> String {
    ENV_VAR_REGEX
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str());

            std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
        })
        .to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Upper bound on concurrently running executors
    pub max_executors: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { max_executors: 256 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Sleep between source polls when no event is available
    pub poll_interval_ms: u64,

    /// Persist the consumed position every N events
    pub checkpoint_interval: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            checkpoint_interval: 100,
        }
    }
}

impl ExecutorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Retry policy for registry announcements.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryRetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RegistryRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
        }
    }
}

impl RegistryRetryConfig {
    /// Single attempt, no waiting.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    /// Wait after the `failures`-th failed call: doubles from
    /// `initial_backoff_ms`, capped at `max_backoff_ms`.
    pub fn delay_after(&self, failures: u32) -> Duration {
        let doubling = 1u64 << failures.saturating_sub(1).min(32);
        Duration::from_millis(
            self.initial_backoff_ms
                .saturating_mul(doubling)
                .min(self.max_backoff_ms),
        )
    }
}
