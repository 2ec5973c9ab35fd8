//! Configuration management for Fancast

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub tokens: TokenConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub platforms: PlatformsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Shared secret expected in the cron trigger header.
    pub cron_secret: Option<String>,
    /// Operator token expected on the job admin routes.
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            cron_secret: None,
            admin_token: None,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8787".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Attempts before a job goes terminal failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First retry delay in seconds; doubles per attempt.
    #[serde(default = "default_base_delay")]
    pub base_delay_secs: u64,
    /// Retry delay ceiling in seconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
    /// How long a claimed job stays invisible before redelivery.
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay(),
            max_delay_secs: default_max_delay(),
            visibility_timeout_secs: default_visibility_timeout(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay() -> u64 {
    30
}

fn default_max_delay() -> u64 {
    300
}

fn default_visibility_timeout() -> u64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Tokens expiring within this many seconds are refreshed proactively.
    #[serde(default = "default_refresh_threshold")]
    pub refresh_threshold_secs: i64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            refresh_threshold_secs: default_refresh_threshold(),
        }
    }
}

fn default_refresh_threshold() -> i64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Due posts claimed per cron tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
        }
    }
}

fn default_batch_size() -> u32 {
    25
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Consecutive health-check failures before an alert job is enqueued.
    #[serde(default = "default_failure_threshold")]
    pub health_failure_threshold: u32,
    /// Lookback window for engagement pulls, in hours.
    #[serde(default = "default_lookback_hours")]
    pub engagement_lookback_hours: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            health_failure_threshold: default_failure_threshold(),
            engagement_lookback_hours: default_lookback_hours(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_lookback_hours() -> u32 {
    24
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformsConfig {
    pub x: Option<XConfig>,
}

/// OAuth application credentials for the X adapter. The per-tenant
/// user tokens live in connected accounts, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XConfig {
    pub client_id: String,
    pub client_secret: String,
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config = toml::from_str(&content).map_err(ConfigError::ParseError)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.path.is_empty() {
            return Err(ConfigError::MissingField("database.path".to_string()).into());
        }
        if self.queue.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "queue.max_attempts".to_string(),
                reason: "must be at least 1".to_string(),
            }
            .into());
        }
        if self.queue.base_delay_secs > self.queue.max_delay_secs {
            return Err(ConfigError::InvalidValue {
                field: "queue.base_delay_secs".to_string(),
                reason: "must not exceed queue.max_delay_secs".to_string(),
            }
            .into());
        }
        if self.dispatcher.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "dispatcher.batch_size".to_string(),
                reason: "must be at least 1".to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            database: DatabaseConfig {
                path: "~/.local/share/fancast/fancast.db".to_string(),
            },
            server: ServerConfig::default(),
            queue: QueueConfig::default(),
            tokens: TokenConfig::default(),
            dispatcher: DispatcherConfig::default(),
            poller: PollerConfig::default(),
            platforms: PlatformsConfig::default(),
        }
    }
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("FANCAST_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("fancast").join("config.toml"))
}
