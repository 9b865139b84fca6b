//! In-process implementation of [`SessionStore`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use super::{Fields, KeyEvent, KeyEventKind, SessionStore};
use crate::error::{Error, Result};

/// Capacity of each subscriber channel. Events beyond it are dropped.
const SUBSCRIBER_CAPACITY: usize = 1024;

#[derive(Debug)]
enum Value {
    Hash(Fields),
    Str,
    Set(HashSet<String>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }
}

#[derive(Debug)]
struct Inner {
    entries: HashMap<String, Entry>,
    subscribers: Vec<mpsc::Sender<KeyEvent>>,
    available: bool,
    notifications: bool,
    latency: Option<Duration>,
}

impl Inner {
    fn notify(&mut self, key: &str, kind: KeyEventKind) {
        if !self.notifications {
            trace!(key = %key, %kind, "Notification suppressed");
            return;
        }
        let event = KeyEvent::new(key, kind);
        self.subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Evict every entry whose TTL has elapsed.
    fn evict_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at.is_some_and(|at| at <= now))
            .map(|(k, _)| k.clone())
            .collect();

        for key in &expired {
            self.entries.remove(key);
            trace!(key = %key, "Entry expired");
            self.notify(key, KeyEventKind::Expired);
        }
        expired.len()
    }

    fn remove(&mut self, key: &str) -> bool {
        if self.entries.remove(key).is_some() {
            self.notify(key, KeyEventKind::Deleted);
            true
        } else {
            false
        }
    }
}

/// In-memory key-value store with TTLs and key notifications.
///
/// Expired entries are evicted on every operation and, when a reaper is
/// running, periodically in the background. Each eviction produces an
/// [`KeyEventKind::Expired`] notification; explicit deletes (including a
/// hash or set becoming empty) produce [`KeyEventKind::Deleted`].
///
/// Keys hold a single type. Writing a different type to an existing key
/// replaces the entry.
///
/// The store can simulate an outage ([`set_available`](Self::set_available)),
/// lost notifications ([`set_notifications`](Self::set_notifications)), a
/// dropped subscription ([`disconnect_subscribers`](Self::disconnect_subscribers))
/// and slow round trips ([`set_latency`](Self::set_latency)).
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                entries: HashMap::new(),
                subscribers: Vec::new(),
                available: true,
                notifications: true,
                latency: None,
            })),
        }
    }

    /// Spawn a task that evicts expired entries every `interval`.
    ///
    /// The task ends when the last handle to the store is dropped.
    pub fn spawn_reaper(&self, interval: Duration) -> JoinHandle<()> {
        let inner: Weak<Mutex<Inner>> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.lock().evict_expired(Instant::now());
            }
        })
    }

    /// Evict expired entries now. Returns the number evicted.
    pub fn purge_expired(&self) -> usize {
        self.inner.lock().evict_expired(Instant::now())
    }

    /// Make every operation fail with `StorageUnavailable` (or succeed again).
    pub fn set_available(&self, available: bool) {
        self.inner.lock().available = available;
    }

    /// Enable or suppress key notifications.
    pub fn set_notifications(&self, enabled: bool) {
        self.inner.lock().notifications = enabled;
    }

    /// Close every open subscription.
    pub fn disconnect_subscribers(&self) {
        self.inner.lock().subscribers.clear();
    }

    /// Delay every operation by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.inner.lock().latency = latency;
    }

    /// Whether `key` is present, without evicting anything.
    pub fn contains_key(&self, key: &str) -> bool {
        let inner = self.inner.lock();
        inner
            .entries
            .get(key)
            .is_some_and(|e| e.expires_at.is_none_or(|at| at > Instant::now()))
    }

    /// Remaining TTL of `key`, if it exists and has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let inner = self.inner.lock();
        let expires_at = inner.entries.get(key)?.expires_at?;
        Some(expires_at.saturating_duration_since(Instant::now()))
    }

    /// All live keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut inner = self.inner.lock();
        inner.evict_expired(Instant::now());
        let mut keys: Vec<String> = inner.entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of subscriptions still open.
    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|tx| !tx.is_closed());
        inner.subscribers.len()
    }

    /// Wait out the configured latency, then run `f` against live state.
    async fn with_inner<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> Result<R> {
        let latency = self.inner.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut inner = self.inner.lock();
        if !inner.available {
            return Err(Error::StorageUnavailable(
                "memory store is offline".to_string(),
            ));
        }
        inner.evict_expired(Instant::now());
        Ok(f(&mut inner))
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get_all(&self, key: &str) -> Result<Option<Fields>> {
        self.with_inner(|inner| match inner.entries.get(key) {
            Some(Entry {
                value: Value::Hash(fields),
                ..
            }) => Some(fields.clone()),
            _ => None,
        })
        .await
    }

    async fn set_fields(&self, key: &str, fields: Vec<(String, Vec<u8>)>) -> Result<()> {
        self.with_inner(|inner| {
            let entry = inner
                .entries
                .entry(key.to_string())
                .or_insert_with(|| Entry::new(Value::Hash(Fields::new())));
            if !matches!(entry.value, Value::Hash(_)) {
                *entry = Entry::new(Value::Hash(Fields::new()));
            }
            if let Value::Hash(hash) = &mut entry.value {
                hash.extend(fields);
            }
        })
        .await
    }

    async fn del_fields(&self, key: &str, fields: Vec<String>) -> Result<()> {
        self.with_inner(|inner| {
            let emptied = match inner.entries.get_mut(key) {
                Some(Entry {
                    value: Value::Hash(hash),
                    ..
                }) => {
                    for field in &fields {
                        hash.remove(field);
                    }
                    hash.is_empty()
                }
                _ => false,
            };
            if emptied {
                inner.remove(key);
            }
        })
        .await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.with_inner(|inner| {
            if ttl.is_zero() {
                return inner.remove(key);
            }
            match inner.entries.get_mut(key) {
                Some(entry) => {
                    entry.expires_at = Some(Instant::now() + ttl);
                    true
                }
                None => false,
            }
        })
        .await
    }

    async fn persist(&self, key: &str) -> Result<()> {
        self.with_inner(|inner| {
            if let Some(entry) = inner.entries.get_mut(key) {
                entry.expires_at = None;
            }
        })
        .await
    }

    async fn del(&self, key: &str) -> Result<bool> {
        self.with_inner(|inner| inner.remove(key)).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.with_inner(|inner| inner.entries.contains_key(key)).await
    }

    async fn put_marker(&self, key: &str, ttl: Option<Duration>) -> Result<()> {
        self.with_inner(|inner| {
            let mut entry = Entry::new(Value::Str);
            entry.expires_at = ttl.map(|ttl| Instant::now() + ttl);
            inner.entries.insert(key.to_string(), entry);
        })
        .await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<bool> {
        self.with_inner(|inner| match inner.entries.remove(from) {
            Some(entry) => {
                inner.entries.insert(to.to_string(), entry);
                true
            }
            None => false,
        })
        .await
    }

    async fn add_member(&self, key: &str, member: &str) -> Result<()> {
        self.with_inner(|inner| {
            let entry = inner
                .entries
                .entry(key.to_string())
                .or_insert_with(|| Entry::new(Value::Set(HashSet::new())));
            if !matches!(entry.value, Value::Set(_)) {
                *entry = Entry::new(Value::Set(HashSet::new()));
            }
            if let Value::Set(set) = &mut entry.value {
                set.insert(member.to_string());
            }
        })
        .await
    }

    async fn remove_member(&self, key: &str, member: &str) -> Result<()> {
        self.with_inner(|inner| {
            let emptied = match inner.entries.get_mut(key) {
                Some(Entry {
                    value: Value::Set(set),
                    ..
                }) => {
                    set.remove(member);
                    set.is_empty()
                }
                _ => false,
            };
            if emptied {
                inner.remove(key);
            }
        })
        .await
    }

    async fn members(&self, key: &str) -> Result<Vec<String>> {
        self.with_inner(|inner| match inner.entries.get(key) {
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => set.iter().cloned().collect(),
            _ => Vec::new(),
        })
        .await
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<KeyEvent>> {
        self.with_inner(|inner| {
            let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
            inner.subscribers.push(tx);
            rx
        })
        .await
    }
}
