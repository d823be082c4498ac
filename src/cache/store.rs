//! Local cache tier.
//!
//! A bounded, LRU-evicted, TTL-aware store living in process memory. Expired
//! entries are treated as absent on read and reaped either on read or by
//! [`LocalTier::sweep_expired`]; until then they still occupy capacity.

use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use lru::LruCache;
use metrics::{counter, gauge};
use tokio::time::Instant;

use super::config::CacheConfig;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::store";

const METRIC_LOCAL_HIT: &str = "concierge_cache_local_hit_total";
const METRIC_LOCAL_MISS: &str = "concierge_cache_local_miss_total";
const METRIC_LOCAL_EVICT: &str = "concierge_cache_local_evict_total";
const METRIC_LOCAL_EXPIRED: &str = "concierge_cache_local_expired_total";
const METRIC_LOCAL_ENTRIES: &str = "concierge_cache_local_entries";

/// A single cached value with its bookkeeping timestamps.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub value: Bytes,
    pub inserted_at: Instant,
    pub expires_at: Instant,
    pub last_accessed_at: Instant,
}

impl CacheEntry {
    fn new(key: String, value: Bytes, ttl: Duration, now: Instant) -> Self {
        Self {
            key,
            value,
            inserted_at: now,
            expires_at: now + ttl,
            last_accessed_at: now,
        }
    }

    /// An entry is expired once `now` reaches `expires_at`.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining_ttl(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}

/// Bounded in-process tier.
pub struct LocalTier {
    entries: Mutex<LruCache<String, CacheEntry>>,
}

impl LocalTier {
    /// Create a new local tier sized from `config`.
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(config.max_entries_non_zero())),
        }
    }

    /// Look up `key`, refreshing its recency (never its TTL).
    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.get_entry(key).map(|entry| entry.value)
    }

    /// Look up `key` returning the full entry.
    pub fn get_entry(&self, key: &str) -> Option<CacheEntry> {
        let now = Instant::now();
        let mut entries = mutex_lock(&self.entries, SOURCE, "get");

        let expired = match entries.get_mut(key) {
            Some(entry) if entry.is_expired_at(now) => true,
            Some(entry) => {
                entry.last_accessed_at = now;
                counter!(METRIC_LOCAL_HIT).increment(1);
                return Some(entry.clone());
            }
            None => false,
        };

        if expired {
            entries.pop(key);
            counter!(METRIC_LOCAL_EXPIRED).increment(1);
            gauge!(METRIC_LOCAL_ENTRIES).set(entries.len() as f64);
        }
        counter!(METRIC_LOCAL_MISS).increment(1);
        None
    }

    /// Check for a live entry without touching its recency or metrics.
    pub fn contains_live(&self, key: &str) -> bool {
        let now = Instant::now();
        mutex_lock(&self.entries, SOURCE, "contains_live")
            .peek(key)
            .is_some_and(|entry| !entry.is_expired_at(now))
    }

    /// Insert or replace `key`.
    ///
    /// Returns the key evicted to make room, if any. Replacing an existing
    /// key never evicts.
    pub fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Option<String> {
        let now = Instant::now();
        let entry = CacheEntry::new(key.to_string(), value, ttl, now);
        let mut entries = mutex_lock(&self.entries, SOURCE, "set");

        let evicted = entries
            .push(key.to_string(), entry)
            .and_then(|(evicted_key, _)| (evicted_key != key).then_some(evicted_key));
        if evicted.is_some() {
            counter!(METRIC_LOCAL_EVICT).increment(1);
        }
        gauge!(METRIC_LOCAL_ENTRIES).set(entries.len() as f64);
        evicted
    }

    /// Remove `key`; returns whether anything was removed.
    pub fn remove(&self, key: &str) -> bool {
        let mut entries = mutex_lock(&self.entries, SOURCE, "remove");
        let removed = entries.pop(key).is_some();
        gauge!(METRIC_LOCAL_ENTRIES).set(entries.len() as f64);
        removed
    }

    /// Remove every key starting with `prefix`; returns the number removed.
    pub fn remove_prefix(&self, prefix: &str) -> usize {
        let mut entries = mutex_lock(&self.entries, SOURCE, "remove_prefix");
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            entries.pop(key);
        }
        gauge!(METRIC_LOCAL_ENTRIES).set(entries.len() as f64);
        doomed.len()
    }

    /// Reap every expired entry; returns the number removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = mutex_lock(&self.entries, SOURCE, "sweep_expired");
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        if !expired.is_empty() {
            counter!(METRIC_LOCAL_EXPIRED).increment(expired.len() as u64);
        }
        gauge!(METRIC_LOCAL_ENTRIES).set(entries.len() as f64);
        expired.len()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        mutex_lock(&self.entries, SOURCE, "clear").clear();
        gauge!(METRIC_LOCAL_ENTRIES).set(0.0);
    }

    /// Number of entries held, including expired-but-unswept ones.
    pub fn len(&self) -> usize {
        mutex_lock(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        mutex_lock(&self.entries, SOURCE, "capacity").cap().get()
    }
}
