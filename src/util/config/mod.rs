//! Backend configuration
//!
//! Pool sizing, idle behavior, and the source-location ident handed to the
//! tasking runtime.
//!
//! # Configuration hierarchy
//!
//! ```text
//! Priority (high → low):
//! 1. Environment variables (RTS_NUM_WORKERS, RTS_IDLE_TIMEOUT_US, RTS_LOG)
//! 2. File passed to `load` (rts.toml)
//! 3. Default values
//! ```
//!
//! The process-wide configuration is installed once and read thereafter:
//!
//! ```rust
//! use forkjoin_rts::util::config;
//!
//! let cfg = config::global();
//! assert!(cfg.pool.resolved_workers() >= 1);
//! ```

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

/// Environment variable overriding `pool.workers`.
pub const ENV_NUM_WORKERS: &str = "RTS_NUM_WORKERS";
/// Environment variable overriding `pool.idle_timeout_us`.
pub const ENV_IDLE_TIMEOUT_US: &str = "RTS_IDLE_TIMEOUT_US";
/// Environment variable overriding `log.level`.
pub const ENV_LOG: &str = "RTS_LOG";

static GLOBAL: OnceCell<RtsConfig> = OnceCell::new();

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RtsConfig {
    /// Worker pool settings
    #[serde(default)]
    pub pool: PoolConfig,
    /// Source-location ident passed to the tasking runtime
    #[serde(default)]
    pub ident: IdentConfig,
    /// Logging settings
    #[serde(default)]
    pub log: LogConfig,
}

/// Worker pool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of workers, 0 means available parallelism
    #[serde(default)]
    pub workers: usize,
    /// How long an idle worker parks before rechecking the queues
    #[serde(default = "default_idle_timeout_us")]
    pub idle_timeout_us: u64,
    /// Upper bound on tasks moved per steal
    #[serde(default = "default_steal_batch")]
    pub steal_batch: usize,
}

fn default_idle_timeout_us() -> u64 {
    1000
}

fn default_steal_batch() -> usize {
    4
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            idle_timeout_us: 1000,
            steal_batch: 4,
        }
    }
}

impl PoolConfig {
    /// Worker count with 0 resolved to the machine's available parallelism.
    pub fn resolved_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }

    /// Idle park timeout.
    #[inline]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_micros(self.idle_timeout_us)
    }
}

/// Source-location ident configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentConfig {
    /// Ident flags word
    #[serde(default = "default_ident_flags")]
    pub flags: i32,
    /// Source string recorded in the ident
    #[serde(default = "default_ident_source")]
    pub source: String,
}

fn default_ident_flags() -> i32 {
    2
}

fn default_ident_source() -> String {
    "omp-task-rt-abi".to_string()
}

impl Default for IdentConfig {
    fn default() -> Self {
        Self {
            flags: 2,
            source: "omp-task-rt-abi".to_string(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Level name: debug, info, warn or error
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl RtsConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::ParseError)
    }

    /// Load a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(ConfigError::IoError)?;
        Self::from_toml_str(&content)
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (normally the process environment).
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(raw) = lookup(ENV_NUM_WORKERS) {
            self.pool.workers = parse_number(ENV_NUM_WORKERS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_IDLE_TIMEOUT_US) {
            self.pool.idle_timeout_us = parse_number(ENV_IDLE_TIMEOUT_US, &raw)?;
        }
        if let Some(raw) = lookup(ENV_LOG) {
            self.log.level = raw.trim().to_ascii_lowercase();
        }
        Ok(())
    }

    /// Serialize back to TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::SerializeError)
    }
}

fn parse_number<T: std::str::FromStr>(
    key: &'static str,
    raw: &str,
) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: raw.to_string(),
    })
}

/// Install the process-wide configuration.
///
/// Must run before the first call to [`global`]; later installs are rejected.
pub fn install(config: RtsConfig) -> Result<(), ConfigError> {
    GLOBAL
        .set(config)
        .map_err(|_| ConfigError::AlreadyInstalled)
}

/// The process-wide configuration, initialized from the environment on first use.
pub fn global() -> &'static RtsConfig {
    GLOBAL.get_or_init(|| match RtsConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("ignoring environment overrides: {}", err);
            RtsConfig::default()
        }
    })
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Config parse error: {0}")]
    ParseError(toml::de::Error),
    #[error("Config serialize error: {0}")]
    SerializeError(toml::ser::Error),
    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: &'static str, value: String },
    #[error("configuration already installed")]
    AlreadyInstalled,
}
