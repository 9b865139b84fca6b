//! Common test utilities for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;

use lapse_session::{
    DestroyReason, MemoryStore, RepositoryConfig, SessionEvent, SessionListener,
    SessionRepository,
};

/// Configuration with short intervals so expiry happens within a test.
pub fn fast_config() -> RepositoryConfig {
    RepositoryConfig::new()
        .with_namespace("it")
        .with_max_inactive_interval(Duration::from_millis(300))
        .with_bucket_granularity(Duration::from_millis(100))
        .with_index_retention(Duration::from_secs(1))
        .with_sweep_interval(Duration::from_millis(50))
        .with_resubscribe_delay(Duration::from_millis(20))
}

/// Collects every event it receives.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<SessionEvent>>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().clone()
    }

    /// Destroyed events recorded for `id`.
    pub fn destroyed(&self, id: &str) -> Vec<DestroyReason> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                SessionEvent::Destroyed {
                    session_id, reason, ..
                } if session_id == id => Some(*reason),
                _ => None,
            })
            .collect()
    }

    /// Wait until a destroyed event for `id` with `reason` arrives.
    pub async fn wait_for_destroyed(
        &self,
        id: &str,
        reason: DestroyReason,
        within: Duration,
    ) -> Result<()> {
        tokio::time::timeout(within, async {
            while !self.destroyed(id).contains(&reason) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .map_err(|_| anyhow::anyhow!("no {reason} event for {id} within {within:?}"))
    }
}

#[async_trait]
impl SessionListener for Recorder {
    async fn handle(&self, event: &SessionEvent) {
        self.events.lock().push(event.clone());
    }
}

/// One application instance: a repository with a recorder attached.
pub struct Instance {
    pub repo: SessionRepository,
    pub recorder: Recorder,
}

impl Instance {
    pub fn new(store: &MemoryStore, config: RepositoryConfig) -> Result<Self> {
        let repo = SessionRepository::new(Arc::new(store.clone()), config)?;
        let recorder = Recorder::default();
        repo.events().register(recorder.clone());
        Ok(Self { repo, recorder })
    }
}

/// Poll `condition` until it holds or `within` elapses.
pub async fn eventually(within: Duration, mut condition: impl FnMut() -> bool) -> Result<()> {
    tokio::time::timeout(within, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .map_err(|_| anyhow::anyhow!("condition not met within {within:?}"))
}
