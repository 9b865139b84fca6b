//! Session lifecycle events and local listener dispatch.
//!
//! Listeners are registered on an [`EventRegistry`] that is shared by the
//! repository and the expiration listener. Register listeners before
//! starting the expiration listener; [`EventRegistry::clear`] removes them
//! on teardown.
//!
//! ```rust,ignore
//! use lapse_session::{FnListener, SessionEvent};
//!
//! repository.events().register(FnListener::new(|event: &SessionEvent| {
//!     if let SessionEvent::Destroyed { session_id, .. } = event {
//!         security_cache.evict(session_id);
//!     }
//! }));
//! ```
//!
//! Destroyed events are delivered at least once: the same id may be
//! reported by both the expiry notification and the index sweep, so
//! listeners must tolerate duplicates.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::info;

/// Why a session was destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DestroyReason {
    /// The session was inactive for longer than its max-inactive-interval.
    Expired,
    /// The session was deleted explicitly.
    Deleted,
}

impl std::fmt::Display for DestroyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DestroyReason::Expired => write!(f, "expired"),
            DestroyReason::Deleted => write!(f, "deleted"),
        }
    }
}

/// Lifecycle event for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A new session was saved for the first time by this process.
    Created {
        session_id: String,
        at: DateTime<Utc>,
    },
    /// A session's backing entry expired or was deleted.
    Destroyed {
        session_id: String,
        reason: DestroyReason,
        at: DateTime<Utc>,
    },
}

impl SessionEvent {
    /// Build a destroyed event stamped now.
    pub fn destroyed(session_id: impl Into<String>, reason: DestroyReason) -> Self {
        Self::Destroyed {
            session_id: session_id.into(),
            reason,
            at: Utc::now(),
        }
    }

    /// Build a created event stamped now.
    pub fn created(session_id: impl Into<String>) -> Self {
        Self::Created {
            session_id: session_id.into(),
            at: Utc::now(),
        }
    }

    /// Dot-separated event name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Created { .. } => "session.created",
            Self::Destroyed {
                reason: DestroyReason::Expired,
                ..
            } => "session.expired",
            Self::Destroyed {
                reason: DestroyReason::Deleted,
                ..
            } => "session.deleted",
        }
    }

    /// The session the event is about.
    pub fn session_id(&self) -> &str {
        match self {
            Self::Created { session_id, .. } | Self::Destroyed { session_id, .. } => session_id,
        }
    }

    /// When the event was raised.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Created { at, .. } | Self::Destroyed { at, .. } => *at,
        }
    }

    /// Whether this is a destroyed event.
    pub fn is_destroyed(&self) -> bool {
        matches!(self, Self::Destroyed { .. })
    }
}

/// Receives session events.
#[async_trait]
pub trait SessionListener: Send + Sync + 'static {
    /// Handle one event. Called once per listener per dispatched event.
    async fn handle(&self, event: &SessionEvent);
}

/// Adapter turning a closure into a [`SessionListener`].
pub struct FnListener<F> {
    f: F,
}

impl<F> FnListener<F>
where
    F: Fn(&SessionEvent) + Send + Sync + 'static,
{
    /// Wrap `f`.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> SessionListener for FnListener<F>
where
    F: Fn(&SessionEvent) + Send + Sync + 'static,
{
    async fn handle(&self, event: &SessionEvent) {
        (self.f)(event);
    }
}

/// Logs every event through `tracing`.
#[derive(Debug, Clone, Default)]
pub struct TracingListener;

impl TracingListener {
    /// Create a tracing listener.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SessionListener for TracingListener {
    async fn handle(&self, event: &SessionEvent) {
        match event {
            SessionEvent::Created { session_id, at } => {
                info!(event = event.name(), session_id = %session_id, at = %at, "Session created");
            }
            SessionEvent::Destroyed {
                session_id,
                reason,
                at,
            } => {
                info!(
                    event = event.name(),
                    session_id = %session_id,
                    reason = %reason,
                    at = %at,
                    "Session destroyed"
                );
            }
        }
    }
}

/// Ordered list of local listeners.
#[derive(Default)]
pub struct EventRegistry {
    listeners: RwLock<Vec<Arc<dyn SessionListener>>>,
}

impl EventRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Listeners are called in registration order.
    pub fn register(&self, listener: impl SessionListener) -> &Self {
        self.listeners.write().push(Arc::new(listener));
        self
    }

    /// Register a shared listener.
    pub fn register_shared(&self, listener: Arc<dyn SessionListener>) -> &Self {
        self.listeners.write().push(listener);
        self
    }

    /// Remove every listener.
    pub fn clear(&self) {
        self.listeners.write().clear();
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Deliver `event` to every listener registered at the time of the call.
    ///
    /// Dispatch works on a snapshot, so listeners may register or clear
    /// the registry from inside `handle`.
    pub async fn dispatch(&self, event: &SessionEvent) {
        let snapshot: Vec<Arc<dyn SessionListener>> = self.listeners.read().clone();
        for listener in snapshot {
            listener.handle(event).await;
        }
    }
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRegistry")
            .field("listeners", &self.len())
            .finish()
    }
}
