//! Tiered cache: a bounded local tier consulted before an optional shared
//! remote tier.
//!
//! Remote failures never reach callers. A failed remote read degrades into a
//! miss and a failed remote write is logged and ignored, leaving the local
//! tier authoritative for this process. Every remote command is bounded by
//! `remote_timeout`, so a stalled store behaves like an unreachable one.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use metrics::counter;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use super::config::CacheConfig;
use super::error::{CacheError, RemoteError};
use super::remote::{NullRemote, RemoteCache, RemoteEntry};
use super::store::LocalTier;

const METRIC_REMOTE_HIT: &str = "concierge_cache_remote_hit_total";
const METRIC_REMOTE_ERROR: &str = "concierge_cache_remote_error_total";

/// Snapshot of the cache's shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub local_entries: usize,
    pub local_capacity: usize,
    pub remote_active: bool,
}

/// Local-then-remote key/value cache.
pub struct TieredCache {
    config: CacheConfig,
    local: LocalTier,
    remote: Arc<dyn RemoteCache>,
}

impl TieredCache {
    /// Build a cache with the given remote tier.
    pub fn new(config: CacheConfig, remote: Arc<dyn RemoteCache>) -> Self {
        let local = LocalTier::new(&config);
        Self {
            config,
            local,
            remote,
        }
    }

    /// Build a local-only cache.
    pub fn local_only(config: CacheConfig) -> Self {
        Self::new(config, Arc::new(NullRemote))
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn local(&self) -> &LocalTier {
        &self.local
    }

    pub fn remote(&self) -> &Arc<dyn RemoteCache> {
        &self.remote
    }

    /// Fetch `key`, promoting remote hits into the local tier.
    #[instrument(skip(self), level = "debug")]
    pub async fn get(&self, key: &str) -> Option<Bytes> {
        if let Some(value) = self.local.get(key) {
            return Some(value);
        }

        match self.bounded("get", self.remote.get(key)).await {
            Ok(Some(RemoteEntry { value, ttl })) => {
                // Never outlive the writer's TTL in the shared store.
                let ttl = ttl.map_or(self.config.default_ttl, |remaining| {
                    remaining.min(self.config.default_ttl)
                });
                if ttl.is_zero() {
                    return None;
                }
                counter!(METRIC_REMOTE_HIT).increment(1);
                debug!(key, ttl_ms = ttl.as_millis() as u64, "remote tier hit, promoting to local tier");
                self.local.set(key, value.clone(), ttl);
                Some(value)
            }
            Ok(None) => None,
            Err(err) => {
                self.report_remote_error("get", key, &err);
                None
            }
        }
    }

    /// Store `value` under `key` in both tiers.
    ///
    /// `ttl` falls back to the configured default when absent or zero.
    #[instrument(skip(self, value), level = "debug", fields(bytes = value.len()))]
    pub async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) {
        let ttl = self.set_local(key, value.clone(), ttl);
        if let Err(err) = self.bounded("set", self.remote.set(key, value, ttl)).await {
            self.report_remote_error("set", key, &err);
        }
    }

    /// Store `value` locally and hand the remote write to a background task.
    ///
    /// Returns once the local tier holds the value.
    pub fn set_detached(self: &Arc<Self>, key: &str, value: Bytes, ttl: Option<Duration>) {
        let ttl = self.set_local(key, value.clone(), ttl);
        if !self.remote.is_active() {
            return;
        }

        let cache = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            if let Err(err) = cache.bounded("set", cache.remote.set(&key, value, ttl)).await {
                cache.report_remote_error("set", &key, &err);
            }
        });
    }

    /// Remove `key` from both tiers. Absent keys are a no-op.
    pub async fn delete(&self, key: &str) {
        self.local.remove(key);
        if let Err(err) = self.bounded("delete", self.remote.delete(key)).await {
            self.report_remote_error("delete", key, &err);
        }
    }

    /// Remove every key starting with `prefix` from both tiers.
    ///
    /// Returns the number of local entries removed.
    #[instrument(skip(self), level = "debug")]
    pub async fn clear_by_prefix(&self, prefix: &str) -> usize {
        let removed = self.local.remove_prefix(prefix);
        match self
            .bounded("delete_pattern", self.remote.delete_pattern(prefix))
            .await
        {
            Ok(remote_removed) => {
                debug!(prefix, removed, remote_removed, "cleared keys by prefix");
            }
            Err(err) => self.report_remote_error("delete_pattern", prefix, &err),
        }
        removed
    }

    /// Empty both tiers.
    pub async fn clear_all(&self) {
        self.local.clear();
        if let Err(err) = self.bounded("flush", self.remote.flush()).await {
            self.report_remote_error("flush", "*", &err);
        }
    }

    /// Reap expired local entries.
    pub fn sweep_expired(&self) -> usize {
        self.local.sweep_expired()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            local_entries: self.local.len(),
            local_capacity: self.local.capacity(),
            remote_active: self.remote.is_active(),
        }
    }

    /// Fetch and decode a JSON value. Undecodable payloads are dropped and
    /// read as a miss.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.get(key).await?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key, error = %err, "discarding undecodable cache entry");
                self.delete(key).await;
                None
            }
        }
    }

    /// Encode `value` as JSON and store it.
    pub async fn set_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(value).map_err(|err| CacheError::Encode {
            key: key.to_string(),
            reason: err.to_string(),
        })?;
        self.set(key, Bytes::from(bytes), ttl).await;
        Ok(())
    }

    /// Release the remote tier's resources.
    pub async fn close(&self) {
        self.remote.close().await;
    }

    fn set_local(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Duration {
        let ttl = self.config.ttl_or_default(ttl);
        if let Some(evicted) = self.local.set(key, value, ttl) {
            debug!(key, evicted = %evicted, "local tier evicted least recently used entry");
        }
        ttl
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        command: impl Future<Output = Result<T, RemoteError>>,
    ) -> Result<T, RemoteError> {
        let limit = self.config.remote_timeout;
        tokio::time::timeout(limit, command)
            .await
            .unwrap_or_else(|_| Err(RemoteError::Timeout { op, elapsed: limit }))
    }

    fn report_remote_error(&self, op: &'static str, key: &str, err: &RemoteError) {
        counter!(METRIC_REMOTE_ERROR, "op" => op).increment(1);
        warn!(
            op,
            key,
            error = %err,
            "remote cache tier unavailable, continuing with local tier"
        );
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Room {
        number: u32,
        beds: u8,
    }

    fn cache(max_entries: usize) -> TieredCache {
        TieredCache::local_only(CacheConfig {
            max_entries,
            ..Default::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn set_then_get_returns_value_until_ttl() {
        let cache = cache(8);
        cache
            .set("k", Bytes::from_static(b"v"), Some(Duration::from_secs(2)))
            .await;
        assert_eq!(cache.get("k").await, Some(Bytes::from_static(b"v")));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get("k").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_ttl_uses_default() {
        let cache = TieredCache::local_only(CacheConfig {
            default_ttl: Duration::from_secs(10),
            ..Default::default()
        });
        cache.set("k", Bytes::from_static(b"v"), None).await;

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(cache.get("k").await.is_some());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cache.get("k").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn lru_scenario_keeps_recently_touched_key() {
        let cache = cache(2);
        cache.set("A", Bytes::from_static(b"a"), None).await;
        cache.set("B", Bytes::from_static(b"b"), None).await;
        assert!(cache.get("A").await.is_some());
        cache.set("C", Bytes::from_static(b"c"), None).await;

        assert!(cache.get("B").await.is_none());
        assert!(cache.get("A").await.is_some());
        assert!(cache.get("C").await.is_some());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let cache = cache(8);
        cache.set("k", Bytes::from_static(b"v"), None).await;
        cache.delete("k").await;
        cache.delete("k").await;
        assert!(cache.get("k").await.is_none());
    }

    #[tokio::test]
    async fn clear_by_prefix_and_clear_all() {
        let cache = cache(8);
        cache.set("page:rooms:1", Bytes::from_static(b"1"), None).await;
        cache.set("page:rooms:2", Bytes::from_static(b"2"), None).await;
        cache.set("page:drivers:1", Bytes::from_static(b"3"), None).await;

        assert_eq!(cache.clear_by_prefix("page:rooms:").await, 2);
        assert!(cache.get("page:drivers:1").await.is_some());

        cache.clear_all().await;
        assert_eq!(cache.stats().local_entries, 0);
    }

    #[tokio::test]
    async fn json_helpers_roundtrip_and_drop_garbage() {
        let cache = cache(8);
        let room = Room { number: 12, beds: 2 };
        cache.set_json("room:12", &room, None).await.expect("encode");
        assert_eq!(cache.get_json::<Room>("room:12").await, Some(room));

        cache.set("room:13", Bytes::from_static(b"not json"), None).await;
        assert!(cache.get_json::<Room>("room:13").await.is_none());
        assert!(cache.get("room:13").await.is_none());
    }

    #[tokio::test]
    async fn stats_report_local_shape() {
        let cache = cache(3);
        cache.set("a", Bytes::from_static(b"1"), None).await;
        assert_eq!(
            cache.stats(),
            CacheStats {
                local_entries: 1,
                local_capacity: 3,
                remote_active: false,
            }
        );
    }
}
