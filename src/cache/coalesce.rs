//! Request coalescing in front of the tiered cache.
//!
//! Concurrent callers asking for the same uncached key share a single loader
//! invocation. The loader runs on its own task, so a caller that stops
//! waiting never cancels a load other callers (or the cache) still want.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use metrics::counter;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::error::ResolveError;
use super::keys::batch_key;
use super::tiered::TieredCache;
use crate::monitor::{OperationMonitor, Outcome, SampleSource};

const METRIC_COALESCE_JOINED: &str = "concierge_coalesce_joined_total";
const METRIC_COALESCE_LOAD: &str = "concierge_coalesce_load_total";
const METRIC_COALESCE_LOAD_FAILED: &str = "concierge_coalesce_load_failed_total";

type SharedLoad = Shared<BoxFuture<'static, Result<Bytes, ResolveError>>>;
type PendingMap = Arc<Mutex<HashMap<String, PendingLoad>>>;

/// Per-call options for [`RequestCoalescer::resolve`].
#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    /// TTL for the cached result; the cache default applies when `None`.
    pub ttl: Option<Duration>,
    /// Name recorded with the operation monitor; defaults to the key.
    pub operation: Option<String>,
}

impl ResolveOptions {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Default::default()
        }
    }

    pub fn operation(mut self, name: impl Into<String>) -> Self {
        self.operation = Some(name.into());
        self
    }
}

/// Snapshot of coalescer activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CoalescerStats {
    pub total_requests: u64,
    pub cache_hits: u64,
    pub coalesced_requests: u64,
    pub loads_started: u64,
    pub loads_failed: u64,
    pub in_flight: usize,
}

/// One outstanding load for a key.
struct PendingLoad {
    generation: u64,
    started_at: Instant,
    result: SharedLoad,
}

#[derive(Default)]
struct Counters {
    total_requests: AtomicU64,
    cache_hits: AtomicU64,
    coalesced_requests: AtomicU64,
    loads_started: AtomicU64,
    loads_failed: Arc<AtomicU64>,
}

/// Lazy loader that deduplicates concurrent loads per key.
pub struct RequestCoalescer {
    cache: Arc<TieredCache>,
    monitor: Arc<OperationMonitor>,
    pending: PendingMap,
    next_generation: AtomicU64,
    counters: Counters,
}

enum Claim<F> {
    /// The value landed in the local tier; the unused loader is handed back.
    Hit(Bytes, F),
    Join(SharedLoad),
    Lead(SharedLoad),
}

impl RequestCoalescer {
    pub fn new(cache: Arc<TieredCache>, monitor: Arc<OperationMonitor>) -> Self {
        Self {
            cache,
            monitor,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    pub fn monitor(&self) -> &Arc<OperationMonitor> {
        &self.monitor
    }

    /// Resolve `key` from the cache, or through `loader` on a miss.
    ///
    /// At most one loader runs per key at a time; every caller attached to a
    /// load observes the same value or the same error. Failures are never
    /// cached, so the next call retries immediately.
    #[instrument(skip(self, loader, options), level = "debug")]
    pub async fn resolve<T, E, F, Fut>(
        &self,
        key: &str,
        mut loader: F,
        options: ResolveOptions,
    ) -> Result<T, ResolveError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync>> + Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let started = Instant::now();
        let ResolveOptions { ttl, operation } = options;
        let operation = operation.unwrap_or_else(|| key.to_string());
        self.counters.total_requests.fetch_add(1, Ordering::Relaxed);

        if let Some(bytes) = self.cache.get(key).await
            && let Some(value) = self.decode_cached::<T>(key, &bytes).await
        {
            self.record_hit(&operation, started);
            return Ok(value);
        }

        let (shared, source) = loop {
            match self.claim(key, loader, ttl).await {
                Claim::Hit(bytes, unused) => {
                    if let Some(value) = self.decode_cached::<T>(key, &bytes).await {
                        self.record_hit(&operation, started);
                        return Ok(value);
                    }
                    loader = unused;
                }
                Claim::Join(shared) => break (shared, "joined"),
                Claim::Lead(shared) => break (shared, "leader"),
            }
        };

        debug!(key, role = source, "awaiting shared load");
        let result = shared
            .await
            .and_then(|bytes| decode::<T>(key, &bytes));

        // Joined waiters are recorded as misses, same as the leader.
        match result {
            Ok(value) => {
                self.monitor.record(
                    operation,
                    started.elapsed(),
                    Outcome::Success,
                    SampleSource::CacheMiss,
                );
                Ok(value)
            }
            Err(err) => Err(self.record_failure(&operation, started, err)),
        }
    }

    /// Resolve a batch of keys through one coalesced load.
    ///
    /// The cache key is derived from the sorted, deduplicated key set, which is
    /// also what `loader` receives. Overlapping but different sets are
    /// independent loads.
    pub async fn resolve_batch<T, E, F, Fut, S>(
        &self,
        namespace: &str,
        keys: &[S],
        loader: F,
        options: ResolveOptions,
    ) -> Result<T, ResolveError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync>> + Send + 'static,
        F: FnOnce(Vec<String>) -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        S: AsRef<str>,
    {
        let (key, normalized) = batch_key(namespace, keys);
        let options = ResolveOptions {
            operation: options
                .operation
                .or_else(|| Some(format!("batch:{namespace}"))),
            ..options
        };
        self.resolve(&key, move || loader(normalized), options)
            .await
    }

    /// Drop the cached value for `key` so the next resolve reloads it.
    pub async fn invalidate(&self, key: &str) {
        self.cache.delete(key).await;
    }

    /// Number of keys with a load in progress.
    pub async fn in_flight(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Age of the outstanding load for `key`, if any.
    pub async fn pending_age(&self, key: &str) -> Option<Duration> {
        self.pending
            .lock()
            .await
            .get(key)
            .map(|load| load.started_at.elapsed())
    }

    pub async fn stats(&self) -> CoalescerStats {
        CoalescerStats {
            total_requests: self.counters.total_requests.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            coalesced_requests: self.counters.coalesced_requests.load(Ordering::Relaxed),
            loads_started: self.counters.loads_started.load(Ordering::Relaxed),
            loads_failed: self.counters.loads_failed.load(Ordering::Relaxed),
            in_flight: self.in_flight().await,
        }
    }

    /// Attach to an existing load for `key` or start one.
    ///
    /// The registry lock makes check-and-insert atomic. While holding it the
    /// local tier is checked again, because a load that settled after our
    /// cache miss has already written its value and removed its entry.
    async fn claim<T, E, F, Fut>(&self, key: &str, loader: F, ttl: Option<Duration>) -> Claim<F>
    where
        T: Serialize + Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync>> + Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let mut pending = self.pending.lock().await;

        if let Some(existing) = pending.get(key) {
            self.counters
                .coalesced_requests
                .fetch_add(1, Ordering::Relaxed);
            counter!(METRIC_COALESCE_JOINED).increment(1);
            return Claim::Join(existing.result.clone());
        }

        if let Some(bytes) = self.cache.local().get(key) {
            return Claim::Hit(bytes, loader);
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        self.counters.loads_started.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_COALESCE_LOAD).increment(1);

        let task = tokio::spawn(settle(
            Arc::clone(&self.cache),
            Arc::clone(&self.pending),
            Arc::clone(&self.counters.loads_failed),
            key.to_string(),
            generation,
            loader(),
            ttl,
        ));

        let registry = Arc::clone(&self.pending);
        let owned_key = key.to_string();
        let shared = async move {
            match task.await {
                Ok(result) => result,
                Err(join_err) => {
                    warn!(key = %owned_key, error = %join_err, "load task did not complete");
                    remove_if_current(&registry, &owned_key, generation).await;
                    Err(ResolveError::Abandoned { key: owned_key })
                }
            }
        }
        .boxed()
        .shared();

        pending.insert(
            key.to_string(),
            PendingLoad {
                generation,
                started_at: Instant::now(),
                result: shared.clone(),
            },
        );
        Claim::Lead(shared)
    }

    /// Decode a cached payload, discarding it when it no longer decodes.
    async fn decode_cached<T: DeserializeOwned>(&self, key: &str, bytes: &Bytes) -> Option<T> {
        match decode::<T>(key, bytes) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key, error = %err, "cached value failed to decode, reloading");
                self.cache.delete(key).await;
                None
            }
        }
    }

    fn record_hit(&self, operation: &str, started: Instant) {
        self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
        self.monitor.record(
            operation,
            started.elapsed(),
            Outcome::Success,
            SampleSource::CacheHit,
        );
    }

    fn record_failure(&self, operation: &str, started: Instant, err: ResolveError) -> ResolveError {
        self.monitor.record(
            operation,
            started.elapsed(),
            Outcome::Failure,
            SampleSource::CacheMiss,
        );
        err
    }
}

/// Run one load to completion, publish its value, then retire its PendingLoad.
async fn settle<T, E, Fut>(
    cache: Arc<TieredCache>,
    pending: PendingMap,
    failures: Arc<AtomicU64>,
    key: String,
    generation: u64,
    load: Fut,
    ttl: Option<Duration>,
) -> Result<Bytes, ResolveError>
where
    T: Serialize + Send + 'static,
    E: Into<Box<dyn StdError + Send + Sync>> + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    let result = match AssertUnwindSafe(load).catch_unwind().await {
        Ok(Ok(value)) => encode(&key, &value),
        Ok(Err(err)) => Err(ResolveError::loader(err)),
        Err(_) => Err(ResolveError::Abandoned { key: key.clone() }),
    };

    match &result {
        Ok(bytes) => cache.set_detached(&key, bytes.clone(), ttl),
        Err(err) => {
            failures.fetch_add(1, Ordering::Relaxed);
            counter!(METRIC_COALESCE_LOAD_FAILED).increment(1);
            warn!(key = %key, error = %err, "load failed, nothing cached");
        }
    }

    remove_if_current(&pending, &key, generation).await;
    result
}

async fn remove_if_current(pending: &PendingMap, key: &str, generation: u64) {
    let mut pending = pending.lock().await;
    if pending
        .get(key)
        .is_some_and(|load| load.generation == generation)
    {
        pending.remove(key);
    }
}

fn encode<T: Serialize>(key: &str, value: &T) -> Result<Bytes, ResolveError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|err| ResolveError::Encode {
            key: key.to_string(),
            reason: err.to_string(),
        })
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &Bytes) -> Result<T, ResolveError> {
    serde_json::from_slice(bytes).map_err(|err| ResolveError::Decode {
        key: key.to_string(),
        reason: err.to_string(),
    })
}
