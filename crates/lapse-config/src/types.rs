//! Configuration types.

use std::time::Duration;

use lapse_redis::RedisConfig;
use lapse_session::RepositoryConfig;
use serde::{Deserialize, Serialize};

use crate::{ConfigError, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Root
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration.
///
/// Maps to the full TOML file. Every section and field is optional; missing
/// values take the library defaults.
///
/// ```toml
/// [session]
/// namespace = "shop:session"
/// max_inactive_interval_secs = 1800
///
/// [expiration]
/// sweep_interval_ms = 5000
///
/// [redis]
/// url = "redis://cache.internal:6379"
///
/// [logging]
/// filter = "lapse=debug"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LapseConfig {
    /// Session defaults and key namespace.
    pub session: SessionSection,
    /// Sweep and index tuning.
    pub expiration: ExpirationSection,
    /// Redis connection.
    pub redis: RedisSection,
    /// Log output.
    pub logging: LoggingSection,
}

impl LapseConfig {
    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Build and validate the repository configuration.
    pub fn repository_config(&self) -> Result<RepositoryConfig> {
        let config = RepositoryConfig {
            namespace: self.session.namespace.clone(),
            max_inactive_interval: self.session.max_inactive_interval()?,
            operation_timeout: Duration::from_millis(self.redis.operation_timeout_ms),
            sweep_interval: Duration::from_millis(self.expiration.sweep_interval_ms),
            bucket_granularity: Duration::from_secs(self.expiration.bucket_granularity_secs),
            index_retention: Duration::from_secs(self.expiration.index_retention_secs),
            resubscribe_delay: Duration::from_millis(self.expiration.resubscribe_delay_ms),
        };
        config.validate()?;
        Ok(config)
    }

    /// Redis connection settings.
    pub fn redis_config(&self) -> RedisConfig {
        RedisConfig {
            url: self.redis.url.clone(),
            database: self.redis.database,
            configure_keyspace_notifications: self.redis.configure_keyspace_notifications,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sections
// ─────────────────────────────────────────────────────────────────────────────

/// `[session]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// Prefix for every key.
    pub namespace: String,
    /// Default inactivity timeout in seconds. `-1` means never expire.
    pub max_inactive_interval_secs: i64,
}

impl Default for SessionSection {
    fn default() -> Self {
        let secs = lapse_session::DEFAULT_MAX_INACTIVE_INTERVAL
            .map(|d| d.as_secs() as i64)
            .unwrap_or(-1);
        Self {
            namespace: lapse_session::DEFAULT_NAMESPACE.to_string(),
            max_inactive_interval_secs: secs,
        }
    }
}

impl SessionSection {
    /// The interval as the repository understands it.
    pub fn max_inactive_interval(&self) -> Result<Option<Duration>> {
        match self.max_inactive_interval_secs {
            -1 => Ok(None),
            secs if secs >= 0 => Ok(Some(Duration::from_secs(secs as u64))),
            secs => Err(ConfigError::Invalid {
                field: "session.max_inactive_interval_secs".to_string(),
                reason: format!("{secs} is negative; use -1 for sessions that never expire"),
            }),
        }
    }
}

/// `[expiration]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpirationSection {
    /// Interval between index sweeps.
    pub sweep_interval_ms: u64,
    /// Width of an index bucket.
    pub bucket_granularity_secs: u64,
    /// How long a bucket outlives its window.
    pub index_retention_secs: u64,
    /// Pause before re-subscribing to notifications.
    pub resubscribe_delay_ms: u64,
}

impl Default for ExpirationSection {
    fn default() -> Self {
        Self {
            sweep_interval_ms: lapse_session::DEFAULT_SWEEP_INTERVAL.as_millis() as u64,
            bucket_granularity_secs: lapse_session::DEFAULT_BUCKET_GRANULARITY.as_secs(),
            index_retention_secs: lapse_session::DEFAULT_INDEX_RETENTION.as_secs(),
            resubscribe_delay_ms: lapse_session::DEFAULT_RESUBSCRIBE_DELAY.as_millis() as u64,
        }
    }
}

/// `[redis]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSection {
    /// Connection URL.
    pub url: String,
    /// Logical database, overriding the one in the URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<i64>,
    /// Enable keyspace notifications with `CONFIG SET` on connect.
    pub configure_keyspace_notifications: bool,
    /// Upper bound on one round trip.
    pub operation_timeout_ms: u64,
}

impl Default for RedisSection {
    fn default() -> Self {
        Self {
            url: lapse_redis::DEFAULT_URL.to_string(),
            database: None,
            configure_keyspace_notifications: true,
            operation_timeout_ms: lapse_session::DEFAULT_OPERATION_TIMEOUT.as_millis() as u64,
        }
    }
}

/// `[logging]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// `tracing` filter directive, e.g. `lapse_session=debug`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}
