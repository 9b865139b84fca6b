//! Configuration for the session repository and expiration listener.

use std::time::Duration;

use crate::error::{Error, Result};

/// Default key namespace.
pub const DEFAULT_NAMESPACE: &str = "lapse:session";

/// Default max-inactive-interval for new sessions (30 minutes).
pub const DEFAULT_MAX_INACTIVE_INTERVAL: Option<Duration> = Some(Duration::from_secs(1800));

/// Default timeout applied to every store round trip.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(2);

/// Default interval between index sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Default width of an expiring-set index bucket.
pub const DEFAULT_BUCKET_GRANULARITY: Duration = Duration::from_secs(60);

/// How long an index bucket outlives its own window.
pub const DEFAULT_INDEX_RETENTION: Duration = Duration::from_secs(300);

/// Default pause before re-subscribing after a lost subscription.
pub const DEFAULT_RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Configuration for the session repository.
#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    /// Prefix for every key written by the repository.
    pub namespace: String,

    /// Max-inactive-interval applied to newly created sessions.
    ///
    /// `None` means sessions never expire. `Some(Duration::ZERO)` means a
    /// session is expired as soon as it is saved.
    pub max_inactive_interval: Option<Duration>,

    /// Upper bound on a single store round trip.
    pub operation_timeout: Duration,

    /// Interval between sweeps of the expiring-set index.
    pub sweep_interval: Duration,

    /// Width of an expiring-set index bucket.
    pub bucket_granularity: Duration,

    /// Extra lifetime of an index bucket after its window closes.
    pub index_retention: Duration,

    /// Pause between subscription attempts.
    pub resubscribe_delay: Duration,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            max_inactive_interval: DEFAULT_MAX_INACTIVE_INTERVAL,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            bucket_granularity: DEFAULT_BUCKET_GRANULARITY,
            index_retention: DEFAULT_INDEX_RETENTION,
            resubscribe_delay: DEFAULT_RESUBSCRIBE_DELAY,
        }
    }
}

impl RepositoryConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the key namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the default max-inactive-interval.
    pub fn with_max_inactive_interval(mut self, interval: Duration) -> Self {
        self.max_inactive_interval = Some(interval);
        self
    }

    /// Sessions created by the repository never expire.
    pub fn without_expiration(mut self) -> Self {
        self.max_inactive_interval = None;
        self
    }

    /// Set the per-operation timeout.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Set the sweep interval.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the index bucket granularity.
    pub fn with_bucket_granularity(mut self, granularity: Duration) -> Self {
        self.bucket_granularity = granularity;
        self
    }

    /// Set the index retention.
    pub fn with_index_retention(mut self, retention: Duration) -> Self {
        self.index_retention = retention;
        self
    }

    /// Set the resubscribe delay.
    pub fn with_resubscribe_delay(mut self, delay: Duration) -> Self {
        self.resubscribe_delay = delay;
        self
    }

    /// Check the configuration for values the repository cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(Error::Config("namespace must not be empty".to_string()));
        }
        if self.operation_timeout.is_zero() {
            return Err(Error::Config(
                "operation_timeout must be greater than zero".to_string(),
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(Error::Config(
                "sweep_interval must be greater than zero".to_string(),
            ));
        }
        if self.bucket_granularity.as_millis() == 0 {
            return Err(Error::Config(
                "bucket_granularity must be at least one millisecond".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RepositoryConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.namespace, DEFAULT_NAMESPACE);
        assert_eq!(config.max_inactive_interval, Some(Duration::from_secs(1800)));
    }

    #[test]
    fn test_builder() {
        let config = RepositoryConfig::new()
            .with_namespace("app")
            .with_max_inactive_interval(Duration::from_secs(10))
            .with_bucket_granularity(Duration::from_millis(100))
            .with_sweep_interval(Duration::from_millis(50));

        assert_eq!(config.namespace, "app");
        assert_eq!(config.max_inactive_interval, Some(Duration::from_secs(10)));
        assert_eq!(config.bucket_granularity, Duration::from_millis(100));
        assert_eq!(config.sweep_interval, Duration::from_millis(50));
    }

    #[test]
    fn test_without_expiration() {
        let config = RepositoryConfig::new().without_expiration();
        assert!(config.max_inactive_interval.is_none());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let config = RepositoryConfig::new().with_bucket_granularity(Duration::ZERO);
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = RepositoryConfig::new().with_operation_timeout(Duration::ZERO);
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = RepositoryConfig::new().with_namespace("");
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
