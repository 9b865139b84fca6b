//! In-memory session entity with dirty tracking.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{Error, Result};

/// Current time truncated to the millisecond precision used in storage.
pub(crate) fn now() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

/// Generate a fresh opaque session id.
pub(crate) fn generate_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Changes made since the session was last saved.
#[derive(Debug, Clone, Default)]
struct Delta {
    changed: HashSet<String>,
    removed: HashSet<String>,
    metadata: bool,
}

impl Delta {
    fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty() && !self.metadata
    }
}

/// One client session.
///
/// A `Session` is a detached copy: mutating it changes nothing in the store
/// until it is passed to [`SessionRepository::save`], which writes only the
/// attributes recorded in the delta.
///
/// [`SessionRepository::save`]: crate::SessionRepository::save
#[derive(Debug, Clone)]
pub struct Session {
    id: String,
    creation_time: DateTime<Utc>,
    last_accessed_time: DateTime<Utc>,
    max_inactive_interval: Option<Duration>,
    attributes: HashMap<String, Value>,
    delta: Delta,
    is_new: bool,
    persisted_expiration: Option<DateTime<Utc>>,
    load_warnings: Vec<String>,
}

impl Session {
    /// Create a brand-new session that has never been saved.
    pub(crate) fn new(id: String, max_inactive_interval: Option<Duration>) -> Self {
        let now = now();
        Self {
            id,
            creation_time: now,
            last_accessed_time: now,
            max_inactive_interval,
            attributes: HashMap::new(),
            delta: Delta {
                metadata: true,
                ..Delta::default()
            },
            is_new: true,
            persisted_expiration: None,
            load_warnings: Vec::new(),
        }
    }

    /// Rebuild a session from its stored fields.
    pub(crate) fn restore(
        id: String,
        creation_time: DateTime<Utc>,
        last_accessed_time: DateTime<Utc>,
        max_inactive_interval: Option<Duration>,
        attributes: HashMap<String, Value>,
        load_warnings: Vec<String>,
    ) -> Self {
        let mut session = Self {
            id,
            creation_time,
            last_accessed_time,
            max_inactive_interval,
            attributes,
            delta: Delta::default(),
            is_new: false,
            persisted_expiration: None,
            load_warnings,
        };
        session.persisted_expiration = session.expires_at();
        session
    }

    /// The session id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// When the session was created.
    pub fn creation_time(&self) -> DateTime<Utc> {
        self.creation_time
    }

    /// When the session was last loaded or saved.
    pub fn last_accessed_time(&self) -> DateTime<Utc> {
        self.last_accessed_time
    }

    /// Override the last access time.
    pub fn set_last_accessed_time(&mut self, at: DateTime<Utc>) {
        self.last_accessed_time = at;
        self.delta.metadata = true;
    }

    /// The inactivity timeout (`None` = never expires).
    pub fn max_inactive_interval(&self) -> Option<Duration> {
        self.max_inactive_interval
    }

    /// Change the inactivity timeout.
    pub fn set_max_inactive_interval(&mut self, interval: Option<Duration>) {
        self.max_inactive_interval = interval;
        self.delta.metadata = true;
    }

    /// The instant the session expires if it is not accessed again.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let interval = self.max_inactive_interval?;
        let delta = TimeDelta::from_std(interval).ok()?;
        self.last_accessed_time.checked_add_signed(delta)
    }

    /// Whether the session is expired at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.max_inactive_interval {
            None => false,
            Some(interval) if interval.is_zero() => true,
            Some(_) => self.expires_at().is_some_and(|at| now >= at),
        }
    }

    /// Whether the session is expired now.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Decode attribute `name` into `T`.
    ///
    /// Returns `Ok(None)` when the attribute is not set.
    pub fn attribute<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        match self.attributes.get(name) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| Error::deserialization(name, e)),
        }
    }

    /// Raw value of attribute `name`.
    pub fn attribute_value(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// Set attribute `name` to `value`.
    ///
    /// Fails with [`Error::Serialization`] when `value` has no JSON form
    /// (for example a map with non-string keys).
    pub fn set_attribute<T: Serialize + ?Sized>(
        &mut self,
        name: impl Into<String>,
        value: &T,
    ) -> Result<()> {
        let name = name.into();
        let value = serde_json::to_value(value).map_err(|e| Error::serialization(&name, e))?;
        self.set_attribute_value(name, value);
        Ok(())
    }

    /// Set attribute `name` to an already-built value.
    pub fn set_attribute_value(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        self.delta.removed.remove(&name);
        self.delta.changed.insert(name.clone());
        self.attributes.insert(name, value);
    }

    /// Remove attribute `name`.
    ///
    /// The removal is recorded even when the attribute is not present in
    /// memory, so a stored field that failed to decode can still be dropped.
    pub fn remove_attribute(&mut self, name: &str) -> Option<Value> {
        self.delta.changed.remove(name);
        self.delta.removed.insert(name.to_string());
        self.attributes.remove(name)
    }

    /// Names of all attributes held in memory.
    pub fn attribute_names(&self) -> Vec<&str> {
        self.attributes.keys().map(String::as_str).collect()
    }

    /// Number of attributes held in memory.
    pub fn attribute_count(&self) -> usize {
        self.attributes.len()
    }

    /// Whether the session has never been saved.
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    /// Whether there are unsaved changes.
    pub fn has_changes(&self) -> bool {
        self.is_new || !self.delta.is_empty()
    }

    /// Attributes that were present in storage but failed to decode on load.
    pub fn load_warnings(&self) -> &[String] {
        &self.load_warnings
    }

    pub(crate) fn changed_attributes(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.delta
            .changed
            .iter()
            .filter_map(|name| self.attributes.get(name).map(|v| (name.as_str(), v)))
    }

    pub(crate) fn removed_attributes(&self) -> impl Iterator<Item = &str> {
        self.delta.removed.iter().map(String::as_str)
    }

    /// Expiration instant as of the last successful save or load.
    pub(crate) fn persisted_expiration(&self) -> Option<DateTime<Utc>> {
        self.persisted_expiration
    }

    /// Record a successful write.
    pub(crate) fn mark_saved(&mut self) {
        self.delta = Delta::default();
        self.is_new = false;
        self.persisted_expiration = self.expires_at();
    }

    /// Treat the session as never saved, so the next save writes every field.
    pub(crate) fn mark_new(&mut self) {
        self.is_new = true;
        self.delta.metadata = true;
        self.delta.changed = self.attributes.keys().cloned().collect();
        self.persisted_expiration = None;
    }

    /// Update the access time without marking metadata dirty.
    pub(crate) fn touch(&mut self, at: DateTime<Utc>) {
        self.last_accessed_time = at;
    }

    pub(crate) fn set_id(&mut self, id: String) {
        self.id = id;
    }
}
