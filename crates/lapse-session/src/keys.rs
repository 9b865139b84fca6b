//! Cache key layout for sessions.
//!
//! For a namespace `N` and session id `S`:
//!
//! | key | kind | content |
//! |-----|------|---------|
//! | `N:sessions:S` | hash | metadata fields + one `attr:<name>` field per attribute |
//! | `N:sessions:expires:S` | string | empty marker, expires with the session |
//! | `N:expirations:<ms>` | set | ids expiring in the bucket starting at `<ms>` |

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Hash field holding the creation time (epoch milliseconds).
pub const CREATION_TIME_FIELD: &str = "creationTime";

/// Hash field holding the last access time (epoch milliseconds).
pub const LAST_ACCESSED_TIME_FIELD: &str = "lastAccessedTime";

/// Hash field holding the max-inactive-interval (milliseconds, `-1` = never).
pub const MAX_INACTIVE_INTERVAL_FIELD: &str = "maxInactiveInterval";

/// Prefix of every attribute field in the attributes hash.
pub const ATTRIBUTE_PREFIX: &str = "attr:";

/// Deterministic mapping from session ids to cache keys.
#[derive(Debug, Clone)]
pub struct KeyScheme {
    sessions_prefix: String,
    marker_prefix: String,
    expirations_prefix: String,
    granularity_ms: i64,
}

impl KeyScheme {
    /// Create a key scheme for `namespace` with the given bucket width.
    ///
    /// A granularity below one millisecond is raised to one millisecond.
    pub fn new(namespace: &str, granularity: Duration) -> Self {
        let granularity_ms = i64::try_from(granularity.as_millis())
            .unwrap_or(i64::MAX)
            .max(1);
        Self {
            sessions_prefix: format!("{namespace}:sessions:"),
            marker_prefix: format!("{namespace}:sessions:expires:"),
            expirations_prefix: format!("{namespace}:expirations:"),
            granularity_ms,
        }
    }

    /// Key of the attributes hash for `id`.
    pub fn session_key(&self, id: &str) -> String {
        format!("{}{id}", self.sessions_prefix)
    }

    /// Key of the TTL-only marker for `id`.
    pub fn marker_key(&self, id: &str) -> String {
        format!("{}{id}", self.marker_prefix)
    }

    /// Resolve a marker key back to its session id.
    pub fn session_id_from_marker<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(&self.marker_prefix)
            .filter(|id| !id.is_empty())
    }

    /// Key of the index bucket starting at `bucket_ms`.
    pub fn expirations_key(&self, bucket_ms: i64) -> String {
        format!("{}{bucket_ms}", self.expirations_prefix)
    }

    /// Start of the bucket containing `at`, in epoch milliseconds.
    pub fn bucket_of(&self, at: DateTime<Utc>) -> i64 {
        at.timestamp_millis().div_euclid(self.granularity_ms) * self.granularity_ms
    }

    /// Bucket width in milliseconds.
    pub fn granularity_ms(&self) -> i64 {
        self.granularity_ms
    }

    /// Hash field name for attribute `name`.
    pub fn attribute_field(name: &str) -> String {
        format!("{ATTRIBUTE_PREFIX}{name}")
    }

    /// Attribute name of a hash field, if it is an attribute field.
    pub fn attribute_name(field: &str) -> Option<&str> {
        field.strip_prefix(ATTRIBUTE_PREFIX)
    }
}
