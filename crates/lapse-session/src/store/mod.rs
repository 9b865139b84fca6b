//! Cache capability consumed by the repository.
//!
//! The repository never speaks a wire protocol itself. It drives a
//! [`SessionStore`], a small set of hash, string and set operations with
//! per-key TTLs plus a feed of key expiry/deletion notifications. The
//! in-process [`MemoryStore`] implements it for tests and single-node
//! embedding; `lapse-redis` implements it against Redis.

mod memory;
mod timeout;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

pub use memory::MemoryStore;
pub use timeout::TimeoutStore;

/// All fields of a hash entry.
pub type Fields = HashMap<String, Vec<u8>>;

/// Why a key disappeared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyEventKind {
    /// The key's TTL elapsed and the store evicted it.
    Expired,
    /// The key was deleted explicitly.
    Deleted,
}

impl std::fmt::Display for KeyEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyEventKind::Expired => write!(f, "expired"),
            KeyEventKind::Deleted => write!(f, "deleted"),
        }
    }
}

/// Notification that a key left the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEvent {
    /// The key that disappeared.
    pub key: String,
    /// How it disappeared.
    pub kind: KeyEventKind,
}

impl KeyEvent {
    /// Create a key event.
    pub fn new(key: impl Into<String>, kind: KeyEventKind) -> Self {
        Self {
            key: key.into(),
            kind,
        }
    }
}

/// Key-value cache capability.
///
/// Every method is a single round trip. Implementations report an
/// unreachable backend as [`Error::StorageUnavailable`] and must not retry
/// internally; the repository applies its own timeout on top.
///
/// [`Error::StorageUnavailable`]: crate::Error::StorageUnavailable
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    /// Read every field of the hash at `key`. `None` when the key is absent.
    async fn get_all(&self, key: &str) -> Result<Option<Fields>>;

    /// Set fields on the hash at `key`, creating it if needed.
    async fn set_fields(&self, key: &str, fields: Vec<(String, Vec<u8>)>) -> Result<()>;

    /// Remove fields from the hash at `key`.
    async fn del_fields(&self, key: &str, fields: Vec<String>) -> Result<()>;

    /// Set the TTL of `key`. Returns `false` when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Clear the TTL of `key`.
    async fn persist(&self, key: &str) -> Result<()>;

    /// Delete `key`. Returns `false` when it did not exist.
    async fn del(&self, key: &str) -> Result<bool>;

    /// Whether `key` exists. Stores with lazy eviction evict an expired key
    /// here, which also produces its expiry notification.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Write an empty string value at `key`, with a TTL unless `ttl` is `None`.
    async fn put_marker(&self, key: &str, ttl: Option<Duration>) -> Result<()>;

    /// Rename `from` to `to`. Returns `false` when `from` does not exist.
    async fn rename(&self, from: &str, to: &str) -> Result<bool>;

    /// Add `member` to the set at `key`.
    async fn add_member(&self, key: &str, member: &str) -> Result<()>;

    /// Remove `member` from the set at `key`.
    async fn remove_member(&self, key: &str, member: &str) -> Result<()>;

    /// All members of the set at `key` (empty when absent).
    async fn members(&self, key: &str) -> Result<Vec<String>>;

    /// Subscribe to expiry and deletion notifications.
    ///
    /// The receiver yields `None` once the subscription is lost; callers
    /// resubscribe. Delivery is best effort.
    async fn subscribe(&self) -> Result<mpsc::Receiver<KeyEvent>>;
}

/// Shared store handle.
pub type SharedStore = Arc<dyn SessionStore>;
