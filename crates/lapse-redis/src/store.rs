//! [`SessionStore`] over Redis.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapse_session::{Error, Fields, KeyEvent, KeyEventKind, Result, SessionStore};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, ErrorKind, RedisError};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config::{KEYSPACE_NOTIFICATION_FLAGS, RedisConfig};

/// Capacity of the channel between the pub/sub connection and the listener.
const NOTIFICATION_BUFFER: usize = 1024;

fn unavailable(op: &'static str) -> impl FnOnce(RedisError) -> Error {
    move |e| Error::StorageUnavailable(format!("redis {op} failed: {e}"))
}

fn millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

/// Map a keyevent channel name to the kind of event it carries.
fn event_kind(channel: &str) -> Option<KeyEventKind> {
    match channel.rsplit_once(':')?.1 {
        "expired" => Some(KeyEventKind::Expired),
        "del" => Some(KeyEventKind::Deleted),
        _ => None,
    }
}

/// Redis-backed session store.
///
/// Commands go through a [`ConnectionManager`], which reconnects on its
/// own. Every [`subscribe`](SessionStore::subscribe) call opens a dedicated
/// pub/sub connection; when it drops, the returned receiver closes and the
/// expiration listener subscribes again.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
    database: i64,
}

impl RedisStore {
    /// Connect and, if configured, enable keyspace notifications.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let info = config.connection_info()?;
        let database = info.redis.db;
        let client = redis::Client::open(info)
            .map_err(|e| Error::Config(format!("invalid Redis settings: {e}")))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(unavailable("connect"))?;

        let store = Self {
            client,
            conn,
            database,
        };
        if config.configure_keyspace_notifications {
            store.enable_keyspace_notifications().await?;
        }

        info!(database, "Connected to Redis");
        Ok(store)
    }

    /// Turn on the keyevent notifications the expiration listener needs.
    pub async fn enable_keyspace_notifications(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg(KEYSPACE_NOTIFICATION_FLAGS)
            .query_async(&mut conn)
            .await
            .map_err(unavailable("CONFIG SET"))?;
        debug!(flags = KEYSPACE_NOTIFICATION_FLAGS, "Keyspace notifications enabled");
        Ok(())
    }

    /// Round trip to check the connection.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(unavailable("PING"))?;
        Ok(())
    }

    /// The logical database in use.
    pub fn database(&self) -> i64 {
        self.database
    }

    /// Keyevent channel for `event` in this database.
    pub fn keyevent_channel(&self, event: &str) -> String {
        format!("__keyevent@{}__:{event}", self.database)
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("database", &self.database)
            .finish()
    }
}

#[async_trait]
impl SessionStore for RedisStore {
    async fn get_all(&self, key: &str) -> Result<Option<Fields>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, Vec<u8>> =
            conn.hgetall(key).await.map_err(unavailable("HGETALL"))?;
        trace!(key = %key, fields = fields.len(), "HGETALL");
        Ok((!fields.is_empty()).then_some(fields))
    }

    async fn set_fields(&self, key: &str, fields: Vec<(String, Vec<u8>)>) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset_multiple(key, fields.as_slice())
            .await
            .map_err(unavailable("HSET"))?;
        Ok(())
    }

    async fn del_fields(&self, key: &str, fields: Vec<String>) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: i64 = conn.hdel(key, fields).await.map_err(unavailable("HDEL"))?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        conn.pexpire(key, millis(ttl))
            .await
            .map_err(unavailable("PEXPIRE"))
    }

    async fn persist(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: bool = conn.persist(key).await.map_err(unavailable("PERSIST"))?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await.map_err(unavailable("DEL"))?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        conn.exists(key).await.map_err(unavailable("EXISTS"))
    }

    async fn put_marker(&self, key: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg("");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl).max(1));
        }
        let _: () = cmd
            .query_async(&mut conn)
            .await
            .map_err(unavailable("SET"))?;
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = conn.rename(from, to).await;
        match result {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::ResponseError && e.to_string().contains("no such key") => {
                Ok(false)
            }
            Err(e) => Err(unavailable("RENAME")(e)),
        }
    }

    async fn add_member(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.sadd(key, member).await.map_err(unavailable("SADD"))?;
        Ok(())
    }

    async fn remove_member(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.srem(key, member).await.map_err(unavailable("SREM"))?;
        Ok(())
    }

    async fn members(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.smembers(key).await.map_err(unavailable("SMEMBERS"))
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<KeyEvent>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(unavailable("pub/sub connect"))?;

        let channels = [
            self.keyevent_channel("expired"),
            self.keyevent_channel("del"),
        ];
        for channel in &channels {
            pubsub
                .psubscribe(channel)
                .await
                .map_err(unavailable("PSUBSCRIBE"))?;
        }
        debug!(?channels, "Subscribed to keyevent channels");

        let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
        tokio::spawn(async move {
            let mut messages = Box::pin(pubsub.into_on_message());
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    msg = messages.next() => {
                        let Some(msg) = msg else {
                            warn!("Redis pub/sub connection closed");
                            break;
                        };
                        let Some(kind) = event_kind(msg.get_channel_name()) else {
                            continue;
                        };
                        let key: String = match msg.get_payload() {
                            Ok(key) => key,
                            Err(e) => {
                                warn!(error = %e, "Unreadable keyevent payload");
                                continue;
                            }
                        };
                        if tx.send(KeyEvent::new(key, kind)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}
