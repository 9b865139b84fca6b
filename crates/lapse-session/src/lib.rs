//! Distributed HTTP session repository on a remote key-value cache.
//!
//! This crate stores sessions so any server instance can serve any request:
//! - One hash per session, one field per attribute, so saves write only the delta
//! - Sliding expiration enforced by the cache's own TTLs
//! - Destroyed-events from key notifications, backed by a periodic index sweep
//!
//! # Example
//!
//! ```rust,ignore
//! use lapse_session::{MemoryStore, RepositoryConfig, SessionRepository, TracingListener};
//!
//! let config = RepositoryConfig::default()
//!     .with_max_inactive_interval(Duration::from_secs(1800));
//!
//! let repo = SessionRepository::new(Arc::new(MemoryStore::new()), config)?;
//! repo.events().register(TracingListener::new());
//! let listener = repo.expiration_listener().start();
//!
//! let mut session = repo.create_session();
//! session.set_attribute("user", "alice")?;
//! repo.save(&mut session).await?;
//! ```

mod codec;
mod config;
mod error;
mod events;
mod keys;
mod listener;
mod repository;
mod session;
mod store;
mod tracker;

pub use codec::{AttributeCodec, JSON_FORMAT_TAG, JsonCodec};
pub use config::{
    DEFAULT_BUCKET_GRANULARITY, DEFAULT_INDEX_RETENTION, DEFAULT_MAX_INACTIVE_INTERVAL,
    DEFAULT_NAMESPACE, DEFAULT_OPERATION_TIMEOUT, DEFAULT_RESUBSCRIBE_DELAY,
    DEFAULT_SWEEP_INTERVAL, RepositoryConfig,
};
pub use error::{Error, Result};
pub use events::{
    DestroyReason, EventRegistry, FnListener, SessionEvent, SessionListener, TracingListener,
};
pub use keys::KeyScheme;
pub use listener::{ExpirationListener, ListenerHandle, ListenerState, SweepReport};
pub use repository::SessionRepository;
pub use session::Session;
pub use store::{
    Fields, KeyEvent, KeyEventKind, MemoryStore, SessionStore, SharedStore, TimeoutStore,
};
pub use tracker::ExpirationTracker;
