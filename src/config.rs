//! Haswitch Configuration
//!
//! Configuration for the auto-switching HA replication core. The knobs here
//! describe the replica node itself; cluster-wide decisions (who leads, which
//! epoch) always arrive from the external supervisor.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::store::Role;

/// Main haswitch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaConfig {
    /// HA core configuration
    #[serde(default)]
    pub ha: HaCoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HA core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaCoreConfig {
    /// Filesystem path of the durable epoch file
    #[serde(default = "default_epoch_file")]
    pub epoch_file: PathBuf,

    /// A follower is evicted from the in-sync set once it has not caught up
    /// with the leader's max offset for this long
    #[serde(default = "default_max_follower_lag_ms")]
    pub max_follower_lag_ms: u64,

    /// Boot-time role hint. The core reads the live role from the log store
    /// and never mutates this field.
    #[serde(default = "default_role")]
    pub role: Role,

    /// Whether role transitions switch the store's transient write-buffer
    /// pool between direct-commit (leader) and buffered (follower) modes
    #[serde(default)]
    pub transient_store_pool: bool,

    /// Poll interval for the dispatch/commit drain loops during promotion
    #[serde(default = "default_drain_poll_ms")]
    pub drain_poll_ms: u64,

    /// Ceiling for the dispatch drain during promotion.
    /// 0 waits indefinitely (drain is bounded only by dispatcher progress).
    #[serde(default)]
    pub drain_timeout_ms: u64,

    /// Container identifier prefixed to the service name, for telemetry only
    #[serde(default)]
    pub container_identifier: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log to file path (optional)
    pub file: Option<PathBuf>,
}

fn default_epoch_file() -> PathBuf {
    PathBuf::from("/var/lib/haswitch/epoch")
}

fn default_max_follower_lag_ms() -> u64 {
    15_000
}

fn default_role() -> Role {
    Role::Follower
}

fn default_drain_poll_ms() -> u64 {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for HaCoreConfig {
    fn default() -> Self {
        Self {
            epoch_file: default_epoch_file(),
            max_follower_lag_ms: default_max_follower_lag_ms(),
            role: default_role(),
            transient_store_pool: false,
            drain_poll_ms: default_drain_poll_ms(),
            drain_timeout_ms: 0,
            container_identifier: None,
        }
    }
}

impl Default for HaConfig {
    fn default() -> Self {
        Self {
            ha: HaCoreConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl HaConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: HaConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.ha.epoch_file.as_os_str().is_empty() {
            return Err(crate::Error::Config("ha.epoch_file cannot be empty".into()));
        }

        if self.ha.max_follower_lag_ms == 0 {
            return Err(crate::Error::Config(
                "ha.max_follower_lag_ms must be positive".into(),
            ));
        }

        if self.ha.drain_poll_ms == 0 {
            return Err(crate::Error::Config(
                "ha.drain_poll_ms must be positive".into(),
            ));
        }

        Ok(())
    }

    /// Get drain poll interval as Duration
    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ha.drain_poll_ms)
    }

    /// Get follower lag eviction threshold as Duration
    pub fn max_follower_lag(&self) -> Duration {
        Duration::from_millis(self.ha.max_follower_lag_ms)
    }
}
