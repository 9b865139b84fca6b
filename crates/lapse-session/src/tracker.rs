//! TTL and expiring-set index maintenance.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use crate::error::Result;
use crate::keys::KeyScheme;
use crate::session::now;
use crate::store::SharedStore;

/// Keeps a session's marker TTL, attributes TTL and index bucket in step.
///
/// The attributes entry and the marker get the same TTL on every refresh.
/// The two writes are not atomic; when one of them fails the next save or
/// sweep converges them to the same value again.
#[derive(Clone)]
pub struct ExpirationTracker {
    store: SharedStore,
    keys: KeyScheme,
    index_retention: Duration,
}

impl ExpirationTracker {
    /// Create a tracker writing through `store`.
    pub fn new(store: SharedStore, keys: KeyScheme, index_retention: Duration) -> Self {
        Self {
            store,
            keys,
            index_retention,
        }
    }

    /// The key scheme in use.
    pub fn keys(&self) -> &KeyScheme {
        &self.keys
    }

    /// Apply `interval` as the TTL of the attributes entry and the marker,
    /// then move the index membership from `previous` to `current`.
    ///
    /// Returns `false`, refreshing nothing, when the attributes entry no
    /// longer exists.
    pub async fn refresh(
        &self,
        id: &str,
        interval: Option<Duration>,
        previous: Option<DateTime<Utc>>,
        current: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let session_key = self.keys.session_key(id);
        let marker_key = self.keys.marker_key(id);

        match interval {
            Some(ttl) => {
                if !self.store.expire(&session_key, ttl).await? {
                    debug!(session_id = %id, "Attributes entry missing, skipping TTL refresh");
                    return Ok(false);
                }
                self.store.put_marker(&marker_key, Some(ttl)).await?;
            }
            None => {
                if !self.store.exists(&session_key).await? {
                    debug!(session_id = %id, "Attributes entry missing, skipping TTL refresh");
                    return Ok(false);
                }
                self.store.persist(&session_key).await?;
                self.store.put_marker(&marker_key, None).await?;
            }
        }

        trace!(session_id = %id, ttl = ?interval, "TTLs refreshed");
        self.rebucket(id, previous, current).await?;
        Ok(true)
    }

    /// Move `id` from the bucket of `previous` to the bucket of `current`.
    ///
    /// Membership in the current bucket is always (re)asserted.
    pub async fn rebucket(
        &self,
        id: &str,
        previous: Option<DateTime<Utc>>,
        current: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let now = now();
        let new_bucket = current.map(|at| self.index_bucket(at, now));

        if let Some(previous) = previous {
            for old in self.candidate_buckets(previous, now) {
                if Some(old) == new_bucket {
                    continue;
                }
                self.store
                    .remove_member(&self.keys.expirations_key(old), id)
                    .await?;
                debug!(session_id = %id, from = old, to = ?new_bucket, "Session re-bucketed");
            }
        }

        if let Some(new) = new_bucket {
            self.index(id, new).await?;
        }
        Ok(())
    }

    /// Add `id` to `bucket` and extend the bucket's own TTL.
    ///
    /// A bucket that has already passed is replaced by the current one; the
    /// sweep cursor never returns to passed buckets.
    pub async fn index(&self, id: &str, bucket: i64) -> Result<()> {
        let now = now();
        let bucket = bucket.max(self.keys.bucket_of(now));
        let key = self.keys.expirations_key(bucket);
        self.store.add_member(&key, id).await?;
        self.store.expire(&key, self.bucket_ttl(bucket, now)).await?;
        Ok(())
    }

    /// Remove `id` from the bucket holding `expires_at`.
    pub async fn forget(&self, id: &str, expires_at: DateTime<Utc>) -> Result<()> {
        for bucket in self.candidate_buckets(expires_at, now()) {
            self.store
                .remove_member(&self.keys.expirations_key(bucket), id)
                .await?;
        }
        Ok(())
    }

    /// Remove `id` from the buckets an expiry observed at `at` most likely
    /// belongs to, for when the stored expiration is no longer readable.
    pub async fn forget_near(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let bucket = self.keys.bucket_of(at);
        for b in [bucket - self.keys.granularity_ms(), bucket] {
            self.store
                .remove_member(&self.keys.expirations_key(b), id)
                .await?;
        }
        Ok(())
    }

    /// Bucket an expiry at `at` is indexed under when indexed at `now`.
    fn index_bucket(&self, at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
        self.keys.bucket_of(at).max(self.keys.bucket_of(now))
    }

    /// Buckets an expiry at `at` may sit in: its own bucket, and the current
    /// one when its own has passed.
    fn candidate_buckets(&self, at: DateTime<Utc>, now: DateTime<Utc>) -> Vec<i64> {
        let own = self.keys.bucket_of(at);
        let indexed = self.index_bucket(at, now);
        if own == indexed {
            vec![own]
        } else {
            vec![own, indexed]
        }
    }

    /// Time until `bucket` closes, plus the retention window.
    fn bucket_ttl(&self, bucket: i64, now: DateTime<Utc>) -> Duration {
        let closes_at = bucket.saturating_add(self.keys.granularity_ms());
        let remaining = closes_at.saturating_sub(now.timestamp_millis()).max(0);
        Duration::from_millis(remaining as u64) + self.index_retention
    }
}
