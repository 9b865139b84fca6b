//! Expiration listener: key notifications plus a periodic index sweep.
//!
//! Two tasks feed the same resolution step. The subscription task reacts
//! to marker expiry and deletion notifications as they arrive. The sweep
//! task walks the expiring-set index for buckets whose window has passed,
//! touching each member so the cache evicts it, and destroys sessions whose
//! attributes entry is gone. Notifications are best effort; the sweep is
//! what guarantees every expired session is reported at least once.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::RepositoryConfig;
use crate::error::Result;
use crate::events::{DestroyReason, EventRegistry, SessionEvent};
use crate::repository::decode_metadata;
use crate::session::now;
use crate::store::{KeyEvent, KeyEventKind, SharedStore};
use crate::tracker::ExpirationTracker;

/// What the listener is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// No live subscription; only the sweep is running.
    Idle,
    /// Waiting for notifications.
    Subscribed,
    /// A key notification arrived.
    NotificationReceived,
    /// A sweep started.
    SweepTick,
    /// Resolving keys to session ids and publishing events.
    Resolving,
}

impl std::fmt::Display for ListenerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Subscribed => "subscribed",
            Self::NotificationReceived => "notification_received",
            Self::SweepTick => "sweep_tick",
            Self::Resolving => "resolving",
        };
        f.write_str(name)
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Passed buckets walked.
    pub buckets: usize,
    /// Sessions found gone and reported destroyed.
    pub expired: usize,
    /// Sessions still alive in the cache, moved to a later bucket.
    pub rebucketed: usize,
    /// Ids dropped from the index because their session no longer expires.
    pub dropped: usize,
}

impl SweepReport {
    /// Whether the sweep changed anything.
    pub fn is_empty(&self) -> bool {
        self.expired == 0 && self.rebucketed == 0 && self.dropped == 0
    }
}

impl std::fmt::Display for SweepReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} buckets, {} expired, {} rebucketed, {} dropped",
            self.buckets, self.expired, self.rebucketed, self.dropped
        )
    }
}

#[derive(Debug)]
struct StateCell {
    subscribed: bool,
    current: ListenerState,
}

impl StateCell {
    fn rest(&self) -> ListenerState {
        if self.subscribed {
            ListenerState::Subscribed
        } else {
            ListenerState::Idle
        }
    }
}

/// Turns cache expirations into [`SessionEvent::Destroyed`] events.
///
/// Built by [`SessionRepository::expiration_listener`]. Call
/// [`start`](Self::start) to run it in the background, or drive
/// [`sweep`](Self::sweep) and [`handle_key_event`](Self::handle_key_event)
/// directly.
///
/// [`SessionRepository::expiration_listener`]: crate::SessionRepository::expiration_listener
#[derive(Clone)]
pub struct ExpirationListener {
    store: SharedStore,
    tracker: ExpirationTracker,
    events: Arc<EventRegistry>,
    config: RepositoryConfig,
    state: Arc<Mutex<StateCell>>,
    cursor: Arc<tokio::sync::Mutex<Option<i64>>>,
}

impl ExpirationListener {
    pub(crate) fn new(
        store: SharedStore,
        tracker: ExpirationTracker,
        events: Arc<EventRegistry>,
        config: RepositoryConfig,
    ) -> Self {
        Self {
            store,
            tracker,
            events,
            config,
            state: Arc::new(Mutex::new(StateCell {
                subscribed: false,
                current: ListenerState::Idle,
            })),
            cursor: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    /// Current state.
    pub fn state(&self) -> ListenerState {
        self.state.lock().current
    }

    /// Whether a notification subscription is live.
    pub fn is_subscribed(&self) -> bool {
        self.state.lock().subscribed
    }

    fn enter(&self, state: ListenerState) {
        self.state.lock().current = state;
    }

    fn settle(&self) {
        let mut cell = self.state.lock();
        cell.current = cell.rest();
    }

    fn set_subscribed(&self, subscribed: bool) {
        let mut cell = self.state.lock();
        cell.subscribed = subscribed;
        cell.current = cell.rest();
    }

    /// React to one key notification.
    ///
    /// Only marker keys are acted on. Returns whether an event was
    /// published.
    pub async fn handle_key_event(&self, event: &KeyEvent) -> Result<bool> {
        let Some(id) = self.tracker.keys().session_id_from_marker(&event.key) else {
            trace!(key = %event.key, kind = %event.kind, "Ignoring non-marker key event");
            return Ok(false);
        };

        self.enter(ListenerState::NotificationReceived);
        trace!(session_id = %id, kind = %event.kind, "Marker notification received");

        self.enter(ListenerState::Resolving);
        let result = match event.kind {
            KeyEventKind::Expired => self.destroy_expired(id, now()).await,
            KeyEventKind::Deleted => {
                self.events
                    .dispatch(&SessionEvent::destroyed(id, DestroyReason::Deleted))
                    .await;
                Ok(())
            }
        };
        self.settle();

        result.map(|()| true)
    }

    /// Walk every passed index bucket once.
    ///
    /// Concurrent calls are serialized. The cursor only advances past
    /// buckets that were fully processed, so a failed sweep is resumed by
    /// the next one.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let mut cursor = self.cursor.lock().await;
        self.enter(ListenerState::SweepTick);
        let result = self.sweep_from(&mut cursor).await;
        self.settle();
        result
    }

    async fn sweep_from(&self, cursor: &mut Option<i64>) -> Result<SweepReport> {
        let keys = self.tracker.keys();
        let granularity = keys.granularity_ms();
        let now = now();
        let now_ms = now.timestamp_millis();

        let mut bucket = cursor.unwrap_or_else(|| self.initial_cursor(now));
        let mut report = SweepReport::default();

        self.enter(ListenerState::Resolving);
        while bucket.saturating_add(granularity) <= now_ms {
            let key = keys.expirations_key(bucket);
            let members = self.store.members(&key).await?;
            if !members.is_empty() {
                trace!(bucket, members = members.len(), "Sweeping bucket");
            }
            for id in &members {
                self.resolve_indexed(id, now, &mut report).await?;
            }
            if !members.is_empty() {
                self.store.del(&key).await?;
            }

            report.buckets += 1;
            bucket += granularity;
            *cursor = Some(bucket);
        }

        if !report.is_empty() {
            debug!(%report, "Sweep complete");
        }
        Ok(report)
    }

    /// First bucket a fresh listener looks at: far enough back to cover
    /// every bucket that can still exist in the store.
    fn initial_cursor(&self, now: DateTime<Utc>) -> i64 {
        let keys = self.tracker.keys();
        let granularity = keys.granularity_ms();
        let buckets = self
            .config
            .index_retention
            .as_millis()
            .div_ceil(granularity as u128)
            + 1;
        let lookback = i64::try_from(buckets)
            .unwrap_or(i64::MAX)
            .saturating_mul(granularity);
        keys.bucket_of(now).saturating_sub(lookback)
    }

    async fn resolve_indexed(
        &self,
        id: &str,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<()> {
        let keys = self.tracker.keys();

        // Touching the marker lets the cache evict it and notify
        self.store.exists(&keys.marker_key(id)).await?;

        let Some(fields) = self.store.get_all(&keys.session_key(id)).await? else {
            self.destroy_expired(id, now).await?;
            report.expired += 1;
            return Ok(());
        };

        let current = keys.bucket_of(now);
        match decode_metadata(&fields) {
            Ok(metadata) => match metadata.expires_at() {
                Some(expires_at) => {
                    let target = keys.bucket_of(expires_at).max(current);
                    self.tracker.index(id, target).await?;
                    debug!(session_id = %id, bucket = target, "Session still alive, re-bucketed");
                    report.rebucketed += 1;
                }
                None => {
                    debug!(session_id = %id, "Session no longer expires, dropped from index");
                    report.dropped += 1;
                }
            },
            Err(e) => {
                warn!(session_id = %id, error = %e, "Unreadable metadata on indexed session");
                self.tracker.index(id, current).await?;
                report.rebucketed += 1;
            }
        }
        Ok(())
    }

    /// Remove what is left of an expired session and publish the event.
    async fn destroy_expired(&self, id: &str, observed_at: DateTime<Utc>) -> Result<()> {
        let keys = self.tracker.keys();
        let session_key = keys.session_key(id);

        let expires_at = match self.store.get_all(&session_key).await? {
            Some(fields) => decode_metadata(&fields)
                .ok()
                .and_then(|metadata| metadata.expires_at()),
            None => None,
        };

        self.store.del(&session_key).await?;
        match expires_at {
            Some(at) => self.tracker.forget(id, at).await?,
            None => self.tracker.forget_near(id, observed_at).await?,
        }

        self.events
            .dispatch(&SessionEvent::destroyed(id, DestroyReason::Expired))
            .await;
        Ok(())
    }

    /// Run the subscription and sweep tasks in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self) -> ListenerHandle {
        let cancel = CancellationToken::new();
        info!(
            namespace = %self.config.namespace,
            sweep_interval = ?self.config.sweep_interval,
            "Expiration listener starting"
        );

        let subscription = tokio::spawn(self.clone().run_subscription(cancel.clone()));
        let sweeper = tokio::spawn(self.clone().run_sweeper(cancel.clone()));

        ListenerHandle {
            listener: self,
            cancel,
            tasks: vec![subscription, sweeper],
        }
    }

    async fn run_subscription(self, cancel: CancellationToken) {
        while !cancel.is_cancelled() {
            match self.store.subscribe().await {
                Ok(mut rx) => {
                    self.set_subscribed(true);
                    debug!("Subscribed to key notifications");

                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                self.set_subscribed(false);
                                return;
                            }
                            event = rx.recv() => match event {
                                Some(event) => {
                                    if let Err(e) = self.handle_key_event(&event).await {
                                        warn!(key = %event.key, error = %e, "Failed to resolve key notification");
                                    }
                                }
                                None => break,
                            }
                        }
                    }

                    self.set_subscribed(false);
                    warn!(
                        retry_in = ?self.config.resubscribe_delay,
                        "Key notification subscription lost"
                    );
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        retry_in = ?self.config.resubscribe_delay,
                        "Failed to subscribe to key notifications"
                    );
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.resubscribe_delay) => {}
            }
        }
    }

    async fn run_sweeper(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!(error = %e, "Expiration sweep failed");
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for ExpirationListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpirationListener")
            .field("namespace", &self.config.namespace)
            .field("state", &self.state())
            .finish()
    }
}

/// Handle to a running [`ExpirationListener`].
///
/// Dropping the handle without calling [`shutdown`](Self::shutdown) stops
/// the background tasks as well.
pub struct ListenerHandle {
    listener: ExpirationListener,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ListenerHandle {
    /// Current listener state.
    pub fn state(&self) -> ListenerState {
        self.listener.state()
    }

    /// Whether a notification subscription is live.
    pub fn is_subscribed(&self) -> bool {
        self.listener.is_subscribed()
    }

    /// The running listener, for on-demand sweeps.
    pub fn listener(&self) -> &ExpirationListener {
        &self.listener
    }

    /// Stop both tasks and wait for them to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "Expiration listener task ended abnormally");
            }
        }
        info!("Expiration listener stopped");
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SessionRepository;
    use crate::events::FnListener;
    use crate::store::{MemoryStore, SessionStore};
    use chrono::TimeDelta;
    use std::time::Duration;

    type Seen = Arc<Mutex<Vec<(String, &'static str)>>>;

    fn setup(store: &MemoryStore) -> (SessionRepository, ExpirationListener, Seen) {
        let config = RepositoryConfig::new()
            .with_namespace("t")
            .with_max_inactive_interval(Duration::from_secs(60))
            .with_bucket_granularity(Duration::from_secs(1))
            .with_index_retention(Duration::from_secs(5))
            .with_sweep_interval(Duration::from_millis(50))
            .with_resubscribe_delay(Duration::from_millis(20));
        let repo = SessionRepository::new(Arc::new(store.clone()), config).unwrap();

        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        repo.events().register(FnListener::new(move |event: &SessionEvent| {
            if event.is_destroyed() {
                sink.lock().push((event.session_id().to_string(), event.name()));
            }
        }));

        let listener = repo.expiration_listener();
        (repo, listener, seen)
    }

    #[tokio::test]
    async fn test_non_marker_keys_are_ignored() {
        let store = MemoryStore::new();
        let (_repo, listener, seen) = setup(&store);

        let handled = listener
            .handle_key_event(&KeyEvent::new("t:sessions:abc", KeyEventKind::Expired))
            .await
            .unwrap();
        assert!(!handled);
        let handled = listener
            .handle_key_event(&KeyEvent::new("t:expirations:1000", KeyEventKind::Deleted))
            .await
            .unwrap();
        assert!(!handled);

        assert!(seen.lock().is_empty());
        assert_eq!(listener.state(), ListenerState::Idle);
    }

    #[tokio::test]
    async fn test_marker_deletion_publishes_deleted() {
        let store = MemoryStore::new();
        let (_repo, listener, seen) = setup(&store);

        listener
            .handle_key_event(&KeyEvent::new("t:sessions:expires:abc", KeyEventKind::Deleted))
            .await
            .unwrap();

        assert_eq!(*seen.lock(), vec![("abc".to_string(), "session.deleted")]);
    }

    #[tokio::test]
    async fn test_marker_expiry_cleans_up() {
        let store = MemoryStore::new();
        let (repo, listener, seen) = setup(&store);

        let mut session = repo.create_session();
        session.set_attribute("a", "b").unwrap();
        repo.save(&mut session).await.unwrap();
        let id = session.id().to_string();

        // The marker expired but the attributes entry is still around
        store.del(&repo.keys().marker_key(&id)).await.unwrap();
        listener
            .handle_key_event(&KeyEvent::new(repo.keys().marker_key(&id), KeyEventKind::Expired))
            .await
            .unwrap();

        assert_eq!(*seen.lock(), vec![(id.clone(), "session.expired")]);
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_destroys_missing_sessions() {
        let store = MemoryStore::new();
        let (repo, listener, seen) = setup(&store);

        let past = now() - TimeDelta::seconds(3);
        let bucket = repo.keys().bucket_of(past);
        store
            .add_member(&repo.keys().expirations_key(bucket), "gone")
            .await
            .unwrap();

        let report = listener.sweep().await.unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(*seen.lock(), vec![("gone".to_string(), "session.expired")]);
        assert!(store.keys().is_empty());

        // The cursor moved on; nothing is reported twice
        let report = listener.sweep().await.unwrap();
        assert!(report.is_empty());
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_finds_session_saved_behind_cursor() {
        let store = MemoryStore::new();
        let (repo, listener, seen) = setup(&store);
        listener.sweep().await.unwrap();

        // Expired a minute ago by its own clock, so its bucket was already swept
        let mut session = repo.create_session();
        session.set_last_accessed_time(now() - TimeDelta::seconds(120));
        repo.save(&mut session).await.unwrap();
        let id = session.id().to_string();
        store.del(&repo.keys().session_key(&id)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let report = listener.sweep().await.unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(*seen.lock(), vec![(id, "session.expired")]);
    }

    #[tokio::test]
    async fn test_sweep_rebuckets_live_sessions() {
        let store = MemoryStore::new();
        let (repo, listener, seen) = setup(&store);

        let mut session = repo.create_session();
        repo.save(&mut session).await.unwrap();
        let id = session.id().to_string();

        // The index claims the session expired seconds ago (clock skew)
        let past = repo.keys().bucket_of(now() - TimeDelta::seconds(3));
        store
            .add_member(&repo.keys().expirations_key(past), &id)
            .await
            .unwrap();

        let report = listener.sweep().await.unwrap();
        assert_eq!(report.rebucketed, 1);
        assert_eq!(report.expired, 0);
        assert!(seen.lock().is_empty());

        let target = repo.keys().bucket_of(session.expires_at().unwrap());
        let members = store
            .members(&repo.keys().expirations_key(target))
            .await
            .unwrap();
        assert!(members.contains(&id));
        assert!(!store.contains_key(&repo.keys().expirations_key(past)));
    }

    #[tokio::test]
    async fn test_sweep_drops_never_expiring_sessions() {
        let store = MemoryStore::new();
        let (repo, listener, _seen) = setup(&store);

        let mut session = repo.create_session();
        session.set_max_inactive_interval(None);
        repo.save(&mut session).await.unwrap();

        let past = repo.keys().bucket_of(now() - TimeDelta::seconds(2));
        store
            .add_member(&repo.keys().expirations_key(past), session.id())
            .await
            .unwrap();

        let report = listener.sweep().await.unwrap();
        assert_eq!(report.dropped, 1);
        assert!(!store.keys().iter().any(|k| k.starts_with("t:expirations:")));
    }

    #[tokio::test]
    async fn test_sweep_failure_keeps_cursor() {
        let store = MemoryStore::new();
        let (repo, listener, seen) = setup(&store);

        let bucket = repo.keys().bucket_of(now() - TimeDelta::seconds(2));
        store
            .add_member(&repo.keys().expirations_key(bucket), "gone")
            .await
            .unwrap();

        store.set_available(false);
        assert!(listener.sweep().await.unwrap_err().is_unavailable());
        assert_eq!(listener.state(), ListenerState::Idle);

        store.set_available(true);
        let report = listener.sweep().await.unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_start_subscribes_and_shuts_down() {
        let store = MemoryStore::new();
        let (_repo, listener, _seen) = setup(&store);

        let handle = listener.start();
        tokio::time::timeout(Duration::from_secs(1), async {
            while !handle.is_subscribed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(handle.state(), ListenerState::Subscribed);

        handle.shutdown().await;
        assert_eq!(store.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_resubscribes_after_disconnect() {
        let store = MemoryStore::new();
        let (_repo, listener, _seen) = setup(&store);
        let handle = listener.start();

        let wait_for = |count: usize| {
            let store = store.clone();
            async move {
                tokio::time::timeout(Duration::from_secs(1), async {
                    while store.subscriber_count() != count {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                })
                .await
                .unwrap();
            }
        };

        wait_for(1).await;
        store.disconnect_subscribers();
        wait_for(1).await;
        tokio::time::timeout(Duration::from_secs(1), async {
            while !handle.is_subscribed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        handle.shutdown().await;
    }
}
