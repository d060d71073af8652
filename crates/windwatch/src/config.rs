//! Configuration management for windwatch.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults.
//! Per-device thresholds are not configuration; they live in storage and are
//! written by the admin surface.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::notify::TokenAction;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default data directory name.
const DATA_DIR_NAME: &str = "windwatch";

/// Default database file name.
const DATABASE_FILE_NAME: &str = "windwatch.db";

/// Minutes in a day; buckets may not be wider.
const MINUTES_PER_DAY: u32 = 24 * 60;

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `WINDWATCH_`, nested keys split on `__`)
/// 2. TOML config file at `~/.config/windwatch/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Interval aggregation configuration.
    pub aggregation: AggregationConfig,
    /// Raw buffer retention configuration.
    pub retention: RetentionConfig,
    /// Notification and token configuration.
    pub notifications: NotificationConfig,
    /// Packet ingest configuration.
    pub ingest: IngestConfig,
}

/// Storage-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the database file.
    /// Defaults to `~/.local/share/windwatch/windwatch.db`
    pub database_path: Option<PathBuf>,
    /// How long a connection waits on a locked database, in milliseconds.
    pub busy_timeout_ms: u64,
}

/// Aggregation-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Bucket width in minutes.
    pub bucket_minutes: u32,
    /// Seconds between scheduler ticks.
    pub tick_seconds: u64,
    /// Consecutive failures of one bucket before an operational alert.
    pub escalate_after: u32,
    /// Minutes without observations after which an open downtime window is closed.
    pub stale_window_minutes: u32,
}

/// Raw buffer retention configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Hard age ceiling for unaggregated readings, in hours.
    pub raw_retention_hours: u32,
    /// Minutes between maintenance passes (pruning, stale windows).
    pub maintenance_interval_minutes: u32,
}

/// Notification-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Base URL that acknowledgement links are built on.
    pub ack_base_url: String,
    /// Lifetime of minted action tokens, in hours.
    pub token_expiry_hours: u32,
    /// Actions a token is minted for on every notification.
    pub token_actions: Vec<TokenAction>,
    /// Delivery attempts per event before it is abandoned.
    pub delivery_max_attempts: u32,
    /// Seconds between delivery retry passes.
    pub delivery_retry_seconds: u64,
}

/// Ingest-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// TCP address to accept JSON-lines packets on.
    /// When unset the daemon reads packets from stdin.
    pub listen_addr: Option<String>,
    /// Capacity of the channel between packet readers and the buffer writer.
    pub channel_capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: None, // Will be resolved to default at runtime
            busy_timeout_ms: 5_000,
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            bucket_minutes: 10,
            tick_seconds: 60,
            escalate_after: 5,
            stale_window_minutes: 30,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            raw_retention_hours: 48,
            maintenance_interval_minutes: 15,
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            ack_base_url: "http://localhost:8080".to_string(),
            token_expiry_hours: 24,
            token_actions: vec![TokenAction::Snooze1h, TokenAction::SnoozeToday],
            delivery_max_attempts: 5,
            delivery_retry_seconds: 60,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            listen_addr: None,
            channel_capacity: 1024,
        }
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);

        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_file))
            .merge(Env::prefixed("WINDWATCH_").split("__"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(DATA_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Get the default data directory path.
    #[must_use]
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(DATA_DIR_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        let agg = &self.aggregation;
        if agg.bucket_minutes == 0 || agg.bucket_minutes > MINUTES_PER_DAY {
            return Err(invalid(format!(
                "bucket_minutes must be between 1 and {MINUTES_PER_DAY}, got {}",
                agg.bucket_minutes
            )));
        }
        if agg.tick_seconds == 0 {
            return Err(invalid("tick_seconds must be greater than 0"));
        }
        if agg.escalate_after == 0 {
            return Err(invalid("escalate_after must be greater than 0"));
        }
        if agg.stale_window_minutes == 0 {
            return Err(invalid("stale_window_minutes must be greater than 0"));
        }

        // The hard ceiling has to sit beyond the aggregation horizon, otherwise
        // readings would be force-pruned before their bucket could close.
        let retention_minutes = u64::from(self.retention.raw_retention_hours) * 60;
        if retention_minutes <= u64::from(agg.bucket_minutes) * 2 {
            return Err(invalid(format!(
                "raw_retention_hours ({}) must exceed two bucket widths",
                self.retention.raw_retention_hours
            )));
        }
        // a carried downtime window is next extended one bucket and one tick
        // after its bucket end; the sweep must not close it before that
        let carry_seconds = u64::from(agg.bucket_minutes) * 60 + agg.tick_seconds;
        if u64::from(agg.stale_window_minutes) * 60 <= carry_seconds {
            return Err(invalid(format!(
                "stale_window_minutes ({}) must exceed bucket_minutes plus tick_seconds",
                agg.stale_window_minutes
            )));
        }
        if self.retention.maintenance_interval_minutes == 0 {
            return Err(invalid(
                "maintenance_interval_minutes must be greater than 0",
            ));
        }

        let notify = &self.notifications;
        if !(notify.ack_base_url.starts_with("http://")
            || notify.ack_base_url.starts_with("https://"))
        {
            return Err(invalid(format!(
                "ack_base_url must be an http(s) URL: {}",
                notify.ack_base_url
            )));
        }
        if notify.token_expiry_hours == 0 {
            return Err(invalid("token_expiry_hours must be greater than 0"));
        }
        if notify.token_actions.is_empty() {
            return Err(invalid("token_actions must list at least one action"));
        }
        for (i, action) in notify.token_actions.iter().enumerate() {
            if notify.token_actions[..i].contains(action) {
                return Err(invalid(format!("duplicate token action: {action}")));
            }
        }
        if notify.delivery_max_attempts == 0 {
            return Err(invalid("delivery_max_attempts must be greater than 0"));
        }
        if notify.delivery_retry_seconds == 0 {
            return Err(invalid("delivery_retry_seconds must be greater than 0"));
        }

        if self.ingest.channel_capacity == 0 {
            return Err(invalid("channel_capacity must be greater than 0"));
        }

        Ok(())
    }

    /// Get the database path, resolving defaults if not set.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(DATABASE_FILE_NAME))
    }

    /// Get the busy timeout as a Duration.
    #[must_use]
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.storage.busy_timeout_ms)
    }

    /// Get the bucket width.
    #[must_use]
    pub fn bucket_width(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.aggregation.bucket_minutes))
    }

    /// Get the stale downtime window threshold.
    #[must_use]
    pub fn stale_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.aggregation.stale_window_minutes))
    }

    /// Get the hard retention ceiling for unaggregated readings.
    #[must_use]
    pub fn raw_retention(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.retention.raw_retention_hours))
    }

    /// Get the action token lifetime.
    #[must_use]
    pub fn token_expiry(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.notifications.token_expiry_hours))
    }

    /// Get the scheduler tick interval.
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.aggregation.tick_seconds)
    }

    /// Get the maintenance interval.
    #[must_use]
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.retention.maintenance_interval_minutes) * 60)
    }

    /// Get the delivery retry interval.
    #[must_use]
    pub fn delivery_retry_interval(&self) -> Duration {
        Duration::from_secs(self.notifications.delivery_retry_seconds)
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::ConfigValidation {
        message: message.into(),
    }
}
