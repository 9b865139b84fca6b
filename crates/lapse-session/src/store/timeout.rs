//! Per-operation timeout around a [`SessionStore`].

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Fields, KeyEvent, SessionStore, SharedStore};
use crate::error::{Error, Result};

/// Wraps a store so every round trip fails with `StorageUnavailable` once
/// `timeout` elapses instead of hanging.
#[derive(Clone)]
pub struct TimeoutStore {
    inner: SharedStore,
    timeout: Duration,
}

impl TimeoutStore {
    /// Wrap `inner` with `timeout`.
    pub fn new(inner: SharedStore, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    /// The configured timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn run<T>(&self, op: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::StorageUnavailable(format!(
                "{op} timed out after {:?}",
                self.timeout
            ))),
        }
    }
}

#[async_trait]
impl SessionStore for TimeoutStore {
    async fn get_all(&self, key: &str) -> Result<Option<Fields>> {
        self.run("get_all", self.inner.get_all(key)).await
    }

    async fn set_fields(&self, key: &str, fields: Vec<(String, Vec<u8>)>) -> Result<()> {
        self.run("set_fields", self.inner.set_fields(key, fields))
            .await
    }

    async fn del_fields(&self, key: &str, fields: Vec<String>) -> Result<()> {
        self.run("del_fields", self.inner.del_fields(key, fields))
            .await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.run("expire", self.inner.expire(key, ttl)).await
    }

    async fn persist(&self, key: &str) -> Result<()> {
        self.run("persist", self.inner.persist(key)).await
    }

    async fn del(&self, key: &str) -> Result<bool> {
        self.run("del", self.inner.del(key)).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.run("exists", self.inner.exists(key)).await
    }

    async fn put_marker(&self, key: &str, ttl: Option<Duration>) -> Result<()> {
        self.run("put_marker", self.inner.put_marker(key, ttl))
            .await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<bool> {
        self.run("rename", self.inner.rename(from, to)).await
    }

    async fn add_member(&self, key: &str, member: &str) -> Result<()> {
        self.run("add_member", self.inner.add_member(key, member))
            .await
    }

    async fn remove_member(&self, key: &str, member: &str) -> Result<()> {
        self.run("remove_member", self.inner.remove_member(key, member))
            .await
    }

    async fn members(&self, key: &str) -> Result<Vec<String>> {
        self.run("members", self.inner.members(key)).await
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<KeyEvent>> {
        self.run("subscribe", self.inner.subscribe()).await
    }
}
