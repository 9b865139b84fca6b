//! Redis connection settings.

use lapse_session::{Error, Result};
use redis::{ConnectionInfo, IntoConnectionInfo};

/// Default Redis URL.
pub const DEFAULT_URL: &str = "redis://127.0.0.1:6379";

/// Keyspace notification classes required by the expiration listener:
/// keyevent channels, generic commands (`del`) and expirations.
pub const KEYSPACE_NOTIFICATION_FLAGS: &str = "Egx";

/// How to reach Redis.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// `redis://` or `rediss://` URL.
    pub url: String,

    /// Logical database. Overrides the database in the URL when set.
    pub database: Option<i64>,

    /// Run `CONFIG SET notify-keyspace-events` on connect.
    ///
    /// Managed Redis offerings often reject `CONFIG`; turn this off there
    /// and enable the notifications through the provider instead.
    pub configure_keyspace_notifications: bool,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            database: None,
            configure_keyspace_notifications: true,
        }
    }
}

impl RedisConfig {
    /// Settings for `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Select a logical database.
    pub fn with_database(mut self, database: i64) -> Self {
        self.database = Some(database);
        self
    }

    /// Enable or disable `CONFIG SET` on connect.
    pub fn with_keyspace_notifications(mut self, configure: bool) -> Self {
        self.configure_keyspace_notifications = configure;
        self
    }

    /// Parsed connection info with the database override applied.
    pub fn connection_info(&self) -> Result<ConnectionInfo> {
        let mut info = self
            .url
            .as_str()
            .into_connection_info()
            .map_err(|e| Error::Config(format!("invalid Redis URL: {e}")))?;
        if let Some(database) = self.database {
            info.redis.db = database;
        }
        Ok(info)
    }
}
