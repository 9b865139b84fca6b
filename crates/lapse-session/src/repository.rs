//! Session repository backed by a [`SessionStore`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, trace, warn};

use crate::codec::{AttributeCodec, JsonCodec};
use crate::config::RepositoryConfig;
use crate::error::{Error, Result};
use crate::events::{EventRegistry, SessionEvent};
use crate::keys::{
    CREATION_TIME_FIELD, KeyScheme, LAST_ACCESSED_TIME_FIELD, MAX_INACTIVE_INTERVAL_FIELD,
};
use crate::listener::ExpirationListener;
use crate::session::{Session, generate_id, now};
use crate::store::{Fields, SharedStore, TimeoutStore};
use crate::tracker::ExpirationTracker;

/// Stored value of `maxInactiveInterval` for sessions that never expire.
const NEVER_EXPIRES: i64 = -1;

/// Creates, saves, loads and deletes sessions.
///
/// Each session is stored as one hash with a field per attribute, so a save
/// only writes the attributes changed on that `Session` instance. Two
/// servers saving different attributes of the same session therefore never
/// overwrite each other.
///
/// Every store round trip is bounded by
/// [`RepositoryConfig::operation_timeout`] and fails with
/// [`Error::StorageUnavailable`] when it elapses.
#[derive(Clone)]
pub struct SessionRepository {
    store: SharedStore,
    tracker: ExpirationTracker,
    codec: Arc<dyn AttributeCodec>,
    events: Arc<EventRegistry>,
    config: RepositoryConfig,
}

impl SessionRepository {
    /// Create a repository over `store` with the JSON attribute codec.
    pub fn new(store: SharedStore, config: RepositoryConfig) -> Result<Self> {
        config.validate()?;

        let store: SharedStore = Arc::new(TimeoutStore::new(store, config.operation_timeout));
        let keys = KeyScheme::new(&config.namespace, config.bucket_granularity);
        let tracker = ExpirationTracker::new(Arc::clone(&store), keys, config.index_retention);

        Ok(Self {
            store,
            tracker,
            codec: Arc::new(JsonCodec::new()),
            events: Arc::new(EventRegistry::new()),
            config,
        })
    }

    /// Use `codec` for attribute values.
    pub fn with_codec(mut self, codec: impl AttributeCodec) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    /// Share an existing event registry.
    pub fn with_events(mut self, events: Arc<EventRegistry>) -> Self {
        self.events = events;
        self
    }

    /// The repository configuration.
    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    /// The event registry listeners are registered on.
    pub fn events(&self) -> &Arc<EventRegistry> {
        &self.events
    }

    /// The key scheme in use.
    pub fn keys(&self) -> &KeyScheme {
        self.tracker.keys()
    }

    /// Build the expiration listener for this repository.
    ///
    /// The listener shares the store, key scheme and event registry.
    pub fn expiration_listener(&self) -> ExpirationListener {
        ExpirationListener::new(
            Arc::clone(&self.store),
            self.tracker.clone(),
            Arc::clone(&self.events),
            self.config.clone(),
        )
    }

    /// Create a new session. Nothing is written until it is saved.
    pub fn create_session(&self) -> Session {
        let session = Session::new(generate_id(), self.config.max_inactive_interval);
        trace!(session_id = %session.id(), "Session created");
        session
    }

    /// Persist the changes recorded on `session`.
    ///
    /// Only changed and removed attributes are written, always together with
    /// the metadata. Both TTLs are refreshed and the index membership follows the
    /// new expiration. The delta is cleared only after every write
    /// succeeded. A session with a zero max-inactive-interval is deleted.
    pub async fn save(&self, session: &mut Session) -> Result<()> {
        if session.max_inactive_interval().is_some_and(|d| d.is_zero()) {
            debug!(session_id = %session.id(), "Zero max-inactive-interval, deleting session");
            return self.delete(session.id()).await;
        }

        // Encode everything up front so a codec failure writes nothing.
        // Metadata is part of every write; a hash recreated by it must decode.
        let mut writes = encode_metadata(session);
        for (name, value) in session.changed_attributes() {
            writes.push((KeyScheme::attribute_field(name), self.codec.encode(name, value)?));
        }
        let removed: Vec<String> = session
            .removed_attributes()
            .map(KeyScheme::attribute_field)
            .collect();

        let key = self.keys().session_key(session.id());
        let written = writes.len();
        let deleted = removed.len();

        self.store.set_fields(&key, writes).await?;
        if !removed.is_empty() {
            self.store.del_fields(&key, removed).await?;
        }

        self.tracker
            .refresh(
                session.id(),
                session.max_inactive_interval(),
                session.persisted_expiration(),
                session.expires_at(),
            )
            .await?;

        let was_new = session.is_new();
        session.mark_saved();

        debug!(
            session_id = %session.id(),
            written,
            deleted,
            new = was_new,
            "Session saved"
        );

        if was_new {
            self.events
                .dispatch(&SessionEvent::created(session.id()))
                .await;
        }
        Ok(())
    }

    /// Load a session, extending its lifetime.
    ///
    /// Returns `Ok(None)` when the session does not exist or is already
    /// expired. On a hit the last access time is persisted and both TTLs
    /// restart from now.
    pub async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let key = self.keys().session_key(id);
        let Some(fields) = self.store.get_all(&key).await? else {
            trace!(session_id = %id, "Session not found");
            return Ok(None);
        };

        let mut session = self.decode(id, fields)?;
        let accessed_at = now();
        if session.is_expired_at(accessed_at) {
            debug!(session_id = %id, "Session found but already expired");
            return Ok(None);
        }

        let previous = session.persisted_expiration();
        session.touch(accessed_at);

        // Write before refreshing TTLs, so a hash recreated by this write
        // after a concurrent delete still gets a TTL (or is missing at
        // refresh time and reported absent).
        self.store.set_fields(&key, encode_metadata(&session)).await?;

        if !self
            .tracker
            .refresh(
                id,
                session.max_inactive_interval(),
                previous,
                session.expires_at(),
            )
            .await?
        {
            debug!(session_id = %id, "Session vanished while loading");
            return Ok(None);
        }

        session.mark_saved();
        trace!(session_id = %id, attributes = session.attribute_count(), "Session loaded");
        Ok(Some(session))
    }

    /// Delete a session. Deleting an unknown id is not an error.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let key = self.keys().session_key(id);

        if let Some(fields) = self.store.get_all(&key).await? {
            match decode_metadata(&fields) {
                Ok(metadata) => {
                    if let Some(expires_at) = metadata.expires_at() {
                        self.tracker.forget(id, expires_at).await?;
                    }
                }
                Err(e) => {
                    warn!(session_id = %id, error = %e, "Unreadable metadata, leaving index cleanup to the sweep");
                }
            }
        }

        let removed = self.store.del(&key).await?;
        self.store.del(&self.keys().marker_key(id)).await?;

        debug!(session_id = %id, existed = removed, "Session deleted");
        Ok(())
    }

    /// Give `session` a fresh id, moving its stored entries along.
    ///
    /// Returns the new id. When the stored entry is gone the session is
    /// treated as new, so the next save writes it in full.
    pub async fn change_session_id(&self, session: &mut Session) -> Result<String> {
        let old_id = session.id().to_string();
        let new_id = generate_id();

        if !session.is_new() {
            let keys = self.keys();
            let renamed = self
                .store
                .rename(&keys.session_key(&old_id), &keys.session_key(&new_id))
                .await?;

            if renamed {
                self.store
                    .rename(&keys.marker_key(&old_id), &keys.marker_key(&new_id))
                    .await?;
                if let Some(expires_at) = session.persisted_expiration() {
                    self.tracker.forget(&old_id, expires_at).await?;
                    self.tracker
                        .index(&new_id, keys.bucket_of(expires_at))
                        .await?;
                }
            } else {
                debug!(session_id = %old_id, "Stored session missing, id change starts a new entry");
                session.mark_new();
            }
        }

        session.set_id(new_id.clone());
        debug!(from = %old_id, to = %new_id, "Session id changed");
        Ok(new_id)
    }

    /// Rebuild a session from its hash fields.
    ///
    /// Attributes that fail to decode are skipped and reported through
    /// [`Session::load_warnings`]; unreadable metadata fails the load.
    fn decode(&self, id: &str, fields: Fields) -> Result<Session> {
        let metadata = decode_metadata(&fields)?;

        let mut attributes = HashMap::new();
        let mut warnings = Vec::new();
        for (field, bytes) in &fields {
            let Some(name) = KeyScheme::attribute_name(field) else {
                continue;
            };
            match self.codec.decode(name, bytes) {
                Ok(value) => {
                    attributes.insert(name.to_string(), value);
                }
                Err(e) => {
                    warn!(session_id = %id, attribute = %name, error = %e, "Skipping undecodable attribute");
                    warnings.push(name.to_string());
                }
            }
        }

        Ok(Session::restore(
            id.to_string(),
            metadata.creation_time,
            metadata.last_accessed_time,
            metadata.max_inactive_interval,
            attributes,
            warnings,
        ))
    }
}

impl std::fmt::Debug for SessionRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRepository")
            .field("config", &self.config)
            .field("events", &self.events)
            .finish()
    }
}

/// Metadata fields of a stored session.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Metadata {
    pub creation_time: DateTime<Utc>,
    pub last_accessed_time: DateTime<Utc>,
    pub max_inactive_interval: Option<Duration>,
}

impl Metadata {
    /// Expiration instant implied by the metadata.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let interval = chrono::TimeDelta::from_std(self.max_inactive_interval?).ok()?;
        self.last_accessed_time.checked_add_signed(interval)
    }
}

fn millis(at: DateTime<Utc>) -> String {
    at.timestamp_millis().to_string()
}

fn encode_metadata(session: &Session) -> Vec<(String, Vec<u8>)> {
    let interval = match session.max_inactive_interval() {
        Some(d) => i64::try_from(d.as_millis()).unwrap_or(i64::MAX),
        None => NEVER_EXPIRES,
    };
    vec![
        (
            CREATION_TIME_FIELD.to_string(),
            millis(session.creation_time()).into_bytes(),
        ),
        (
            LAST_ACCESSED_TIME_FIELD.to_string(),
            millis(session.last_accessed_time()).into_bytes(),
        ),
        (
            MAX_INACTIVE_INTERVAL_FIELD.to_string(),
            interval.to_string().into_bytes(),
        ),
    ]
}

pub(crate) fn decode_metadata(fields: &Fields) -> Result<Metadata> {
    let creation_time = timestamp_field(fields, CREATION_TIME_FIELD)?;
    let last_accessed_time = timestamp_field(fields, LAST_ACCESSED_TIME_FIELD)?;
    let interval = integer_field(fields, MAX_INACTIVE_INTERVAL_FIELD)?;
    let max_inactive_interval = if interval < 0 {
        None
    } else {
        Some(Duration::from_millis(interval as u64))
    };

    Ok(Metadata {
        creation_time,
        last_accessed_time,
        max_inactive_interval,
    })
}

fn integer_field(fields: &Fields, name: &str) -> Result<i64> {
    let bytes = fields
        .get(name)
        .ok_or_else(|| Error::deserialization(name, "field missing"))?;
    std::str::from_utf8(bytes)
        .map_err(|e| Error::deserialization(name, e))?
        .parse::<i64>()
        .map_err(|e| Error::deserialization(name, e))
}

fn timestamp_field(fields: &Fields, name: &str) -> Result<DateTime<Utc>> {
    let ms = integer_field(fields, name)?;
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| Error::deserialization(name, format!("timestamp {ms} out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JSON_FORMAT_TAG;
    use crate::store::{MemoryStore, SessionStore};
    use serde_json::json;

    fn repository(store: &MemoryStore) -> SessionRepository {
        let config = RepositoryConfig::new()
            .with_namespace("test")
            .with_max_inactive_interval(Duration::from_secs(60));
        SessionRepository::new(Arc::new(store.clone()), config).unwrap()
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let store = MemoryStore::new();
        let repo = repository(&store);

        let mut session = repo.create_session();
        session.set_attribute("a", "b").unwrap();
        repo.save(&mut session).await.unwrap();
        assert!(!session.is_new());
        assert!(!session.has_changes());

        let loaded = repo.get_session(session.id()).await.unwrap().unwrap();
        assert_eq!(loaded.id(), session.id());
        assert_eq!(loaded.attribute::<String>("a").unwrap().as_deref(), Some("b"));
        assert_eq!(loaded.creation_time(), session.creation_time());
        assert_eq!(loaded.max_inactive_interval(), Some(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_field_per_attribute_layout() {
        let store = MemoryStore::new();
        let repo = repository(&store);

        let mut session = repo.create_session();
        session.set_attribute("a", "b").unwrap();
        session.set_attribute("n", &3).unwrap();
        repo.save(&mut session).await.unwrap();

        let fields = store
            .get_all(&repo.keys().session_key(session.id()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fields.len(), 5);
        assert!(fields.contains_key("attr:a"));
        assert!(fields.contains_key("attr:n"));
        assert!(fields.contains_key(CREATION_TIME_FIELD));
        assert_eq!(fields[MAX_INACTIVE_INTERVAL_FIELD], b"60000".to_vec());
        assert!(store.contains_key(&repo.keys().marker_key(session.id())));
    }

    #[tokio::test]
    async fn test_save_writes_only_delta() {
        let store = MemoryStore::new();
        let repo = repository(&store);

        let mut session = repo.create_session();
        session.set_attribute("a", "b").unwrap();
        repo.save(&mut session).await.unwrap();

        // Another writer adds a field this instance has never seen
        let key = repo.keys().session_key(session.id());
        let foreign = JsonCodec::new().encode("other", &json!("x")).unwrap();
        store
            .set_fields(&key, vec![("attr:other".to_string(), foreign)])
            .await
            .unwrap();

        session.set_attribute("a", "c").unwrap();
        repo.save(&mut session).await.unwrap();

        let loaded = repo.get_session(session.id()).await.unwrap().unwrap();
        assert_eq!(loaded.attribute::<String>("a").unwrap().as_deref(), Some("c"));
        assert_eq!(loaded.attribute::<String>("other").unwrap().as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn test_remove_attribute() {
        let store = MemoryStore::new();
        let repo = repository(&store);

        let mut session = repo.create_session();
        session.set_attribute("a", "b").unwrap();
        session.set_attribute("c", "d").unwrap();
        repo.save(&mut session).await.unwrap();

        session.remove_attribute("c");
        repo.save(&mut session).await.unwrap();

        let loaded = repo.get_session(session.id()).await.unwrap().unwrap();
        assert_eq!(loaded.attribute_count(), 1);
        assert!(loaded.attribute_value("c").is_none());
    }

    #[tokio::test]
    async fn test_codec_failure_writes_nothing() {
        let store = MemoryStore::new();
        let repo = repository(&store).with_codec(JsonCodec::new().with_max_value_bytes(16));

        let mut session = repo.create_session();
        session.set_attribute("small", "ok").unwrap();
        session
            .set_attribute("big", "a value that will not fit in sixteen bytes")
            .unwrap();

        let err = repo.save(&mut session).await.unwrap_err();
        assert!(matches!(err, Error::Serialization { ref name, .. } if name == "big"));
        assert!(store.keys().is_empty());
        assert!(session.is_new());
        assert!(session.has_changes());
    }

    #[tokio::test]
    async fn test_corrupt_attribute_is_skipped() {
        let store = MemoryStore::new();
        let repo = repository(&store);

        let mut session = repo.create_session();
        session.set_attribute("good", "yes").unwrap();
        repo.save(&mut session).await.unwrap();

        let key = repo.keys().session_key(session.id());
        store
            .set_fields(&key, vec![("attr:broken".to_string(), vec![0xac, 0xed, 0x00])])
            .await
            .unwrap();

        let loaded = repo.get_session(session.id()).await.unwrap().unwrap();
        assert_eq!(loaded.attribute::<String>("good").unwrap().as_deref(), Some("yes"));
        assert!(loaded.attribute_value("broken").is_none());
        assert_eq!(loaded.load_warnings(), ["broken".to_string()]);

        // The corrupt field survives saves that do not touch it
        let mut loaded = loaded;
        loaded.set_attribute("good", "still").unwrap();
        repo.save(&mut loaded).await.unwrap();
        let fields = store.get_all(&key).await.unwrap().unwrap();
        assert_eq!(fields["attr:broken"], vec![0xac, 0xed, 0x00]);

        // ...and can be removed explicitly
        loaded.remove_attribute("broken");
        repo.save(&mut loaded).await.unwrap();
        let fields = store.get_all(&key).await.unwrap().unwrap();
        assert!(!fields.contains_key("attr:broken"));
    }

    #[tokio::test]
    async fn test_corrupt_metadata_fails_load() {
        let store = MemoryStore::new();
        let repo = repository(&store);

        let key = repo.keys().session_key("bad");
        let value = [JSON_FORMAT_TAG, b'1'].to_vec();
        store
            .set_fields(&key, vec![("attr:a".to_string(), value)])
            .await
            .unwrap();

        let err = repo.get_session("bad").await.unwrap_err();
        assert!(matches!(err, Error::Deserialization { ref name, .. } if name == CREATION_TIME_FIELD));

        // Delete still works on an unreadable session
        repo.delete("bad").await.unwrap();
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_load_refreshes_access_time_and_index() {
        let store = MemoryStore::new();
        let repo = repository(&store);

        let mut session = repo.create_session();
        session.set_last_accessed_time(now() - chrono::TimeDelta::seconds(30));
        repo.save(&mut session).await.unwrap();
        let old_bucket = repo.keys().bucket_of(session.expires_at().unwrap());

        let loaded = repo.get_session(session.id()).await.unwrap().unwrap();
        assert!(loaded.last_accessed_time() > session.last_accessed_time());

        let new_bucket = repo.keys().bucket_of(loaded.expires_at().unwrap());
        let members = store
            .members(&repo.keys().expirations_key(new_bucket))
            .await
            .unwrap();
        assert!(members.contains(&session.id().to_string()));
        if new_bucket != old_bucket {
            assert!(store
                .members(&repo.keys().expirations_key(old_bucket))
                .await
                .unwrap()
                .is_empty());
        }
    }

    #[tokio::test]
    async fn test_expired_by_application_clock_is_absent() {
        let store = MemoryStore::new();
        let repo = repository(&store);

        let mut session = repo.create_session();
        session.set_last_accessed_time(now() - chrono::TimeDelta::seconds(120));
        repo.save(&mut session).await.unwrap();

        // The store still holds it (TTL restarted on save) but it is logically expired
        assert!(store.contains_key(&repo.keys().session_key(session.id())));
        assert!(repo.get_session(session.id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = MemoryStore::new();
        let repo = repository(&store);

        let mut session = repo.create_session();
        session.set_attribute("a", "b").unwrap();
        repo.save(&mut session).await.unwrap();

        repo.delete(session.id()).await.unwrap();
        assert!(repo.get_session(session.id()).await.unwrap().is_none());
        repo.delete(session.id()).await.unwrap();
        repo.delete("never-existed").await.unwrap();

        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_never_expiring_session() {
        let store = MemoryStore::new();
        let repo = repository(&store);

        let mut session = repo.create_session();
        session.set_max_inactive_interval(None);
        repo.save(&mut session).await.unwrap();

        let key = repo.keys().session_key(session.id());
        assert!(store.ttl(&key).is_none());
        assert_eq!(
            store.get_all(&key).await.unwrap().unwrap()[MAX_INACTIVE_INTERVAL_FIELD],
            b"-1".to_vec()
        );

        let loaded = repo.get_session(session.id()).await.unwrap().unwrap();
        assert!(loaded.max_inactive_interval().is_none());
        assert!(!store.keys().iter().any(|k| k.starts_with("test:expirations:")));
    }

    #[tokio::test]
    async fn test_zero_interval_deletes() {
        let store = MemoryStore::new();
        let repo = repository(&store);

        let mut session = repo.create_session();
        repo.save(&mut session).await.unwrap();

        session.set_max_inactive_interval(Some(Duration::ZERO));
        repo.save(&mut session).await.unwrap();

        assert!(store.keys().is_empty());
        assert!(repo.get_session(session.id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_change_session_id() {
        let store = MemoryStore::new();
        let repo = repository(&store);

        let mut session = repo.create_session();
        session.set_attribute("a", "b").unwrap();
        repo.save(&mut session).await.unwrap();
        let old_id = session.id().to_string();

        let new_id = repo.change_session_id(&mut session).await.unwrap();
        assert_ne!(old_id, new_id);
        assert_eq!(session.id(), new_id);

        assert!(repo.get_session(&old_id).await.unwrap().is_none());
        let loaded = repo.get_session(&new_id).await.unwrap().unwrap();
        assert_eq!(loaded.attribute::<String>("a").unwrap().as_deref(), Some("b"));
        assert!(store.contains_key(&repo.keys().marker_key(&new_id)));
        assert!(!store.contains_key(&repo.keys().marker_key(&old_id)));
    }

    #[tokio::test]
    async fn test_change_id_of_vanished_session_rewrites_it() {
        let store = MemoryStore::new();
        let repo = repository(&store);

        let mut session = repo.create_session();
        session.set_attribute("a", "b").unwrap();
        repo.save(&mut session).await.unwrap();
        repo.delete(session.id()).await.unwrap();

        let new_id = repo.change_session_id(&mut session).await.unwrap();
        assert!(session.is_new());
        repo.save(&mut session).await.unwrap();

        let loaded = repo.get_session(&new_id).await.unwrap().unwrap();
        assert_eq!(loaded.attribute::<String>("a").unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_storage_unavailable() {
        let store = MemoryStore::new();
        let repo = repository(&store);
        let mut session = repo.create_session();

        store.set_available(false);
        assert!(repo.save(&mut session).await.unwrap_err().is_unavailable());
        assert!(repo.get_session("x").await.unwrap_err().is_unavailable());
        assert!(repo.delete("x").await.unwrap_err().is_unavailable());

        // The failed save left the delta intact
        assert!(session.is_new());
        store.set_available(true);
        repo.save(&mut session).await.unwrap();
        assert!(repo.get_session(session.id()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_operation_timeout() {
        let store = MemoryStore::new();
        let config = RepositoryConfig::new().with_operation_timeout(Duration::from_millis(20));
        let repo = SessionRepository::new(Arc::new(store.clone()), config).unwrap();

        store.set_latency(Some(Duration::from_millis(200)));
        let err = repo.get_session("x").await.unwrap_err();
        assert!(err.is_unavailable());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = RepositoryConfig::new().with_namespace("");
        let result = SessionRepository::new(Arc::new(MemoryStore::new()), config);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_created_event_on_first_save_only() {
        use crate::events::FnListener;
        use parking_lot::Mutex;

        let store = MemoryStore::new();
        let repo = repository(&store);
        let names = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&names);
        repo.events().register(FnListener::new(move |event: &SessionEvent| {
            sink.lock().push(event.name());
        }));

        let mut session = repo.create_session();
        repo.save(&mut session).await.unwrap();
        session.set_attribute("a", "b").unwrap();
        repo.save(&mut session).await.unwrap();

        assert_eq!(*names.lock(), vec!["session.created"]);
    }
}
