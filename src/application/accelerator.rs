//! Explicitly constructed entry point for the acceleration layer.
//!
//! Owns the cache, monitor, coalescer and pagination engine, plus the
//! background sweeper. Built once at startup and handed to whatever serves
//! requests; `shutdown` stops the sweeper and releases the remote tier.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cache::lock::mutex_lock;
use crate::cache::{
    CacheConfig, CacheOptions, CacheStats, CoalescerStats, NullRemote, RedisRemote,
    RelationLoader, RemoteCache, RequestCoalescer, TieredCache,
};
use crate::config::Settings;
use crate::monitor::{MonitorConfig, MonitorStats, OperationMonitor, RepetitionAlert};

use super::pagination::{PaginationConfig, PaginationEngine, PaginationStats};

const SOURCE: &str = "application::accelerator";

/// Aggregate statistics across every component.
#[derive(Debug, Clone, Serialize)]
pub struct AcceleratorStats {
    pub cache: CacheStats,
    pub coalescer: CoalescerStats,
    pub pagination: PaginationStats,
    pub monitor: MonitorStats,
    pub repetition_alerts: Vec<RepetitionAlert>,
}

pub struct Accelerator {
    cache: Arc<TieredCache>,
    monitor: Arc<OperationMonitor>,
    coalescer: Arc<RequestCoalescer>,
    pagination: PaginationEngine,
    relations: RelationLoader,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Accelerator {
    /// Build every component from `settings` and start the sweeper.
    ///
    /// An unreachable remote tier is logged and replaced by a local-only
    /// cache; the layer stays usable without it.
    pub async fn init(settings: &Settings) -> Self {
        let cache_config = CacheConfig::from(&settings.cache);
        let remote = connect_remote(&cache_config, settings).await;
        let sweep_interval = cache_config.sweep_interval;

        let accelerator = Self::from_parts(
            Arc::new(TieredCache::new(cache_config, remote)),
            Arc::new(OperationMonitor::new(MonitorConfig::from(&settings.monitor))),
            PaginationConfig::from(&settings.pagination),
        );

        if let Some(interval) = sweep_interval {
            accelerator.start_sweeper(interval);
        }

        info!(
            environment = settings.environment.as_str(),
            remote_active = accelerator.cache.remote().is_active(),
            max_entries = accelerator.cache.config().max_entries,
            "Acceleration layer initialized"
        );
        accelerator
    }

    /// Assemble from prebuilt components without starting background work.
    pub fn from_parts(
        cache: Arc<TieredCache>,
        monitor: Arc<OperationMonitor>,
        pagination: PaginationConfig,
    ) -> Self {
        let coalescer = Arc::new(RequestCoalescer::new(
            Arc::clone(&cache),
            Arc::clone(&monitor),
        ));
        Self {
            pagination: PaginationEngine::new(pagination, Arc::clone(&coalescer)),
            relations: RelationLoader::new(Arc::clone(&coalescer), CacheOptions::default()),
            cache,
            monitor,
            coalescer,
            sweeper: Mutex::new(None),
        }
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    pub fn monitor(&self) -> &Arc<OperationMonitor> {
        &self.monitor
    }

    pub fn coalescer(&self) -> &Arc<RequestCoalescer> {
        &self.coalescer
    }

    pub fn pagination(&self) -> &PaginationEngine {
        &self.pagination
    }

    pub fn relations(&self) -> &RelationLoader {
        &self.relations
    }

    /// Periodically reap expired local entries. Replaces a running sweeper.
    pub fn start_sweeper(&self, every: Duration) {
        let cache = Arc::clone(&self.cache);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                let removed = cache.sweep_expired();
                if removed > 0 {
                    debug!(removed, "Swept expired cache entries");
                }
            }
        });

        if let Some(previous) = mutex_lock(&self.sweeper, SOURCE, "start_sweeper").replace(handle) {
            previous.abort();
        }
    }

    pub fn is_sweeping(&self) -> bool {
        mutex_lock(&self.sweeper, SOURCE, "is_sweeping")
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub async fn stats(&self) -> AcceleratorStats {
        AcceleratorStats {
            cache: self.cache.stats(),
            coalescer: self.coalescer.stats().await,
            pagination: self.pagination.stats(),
            monitor: self.monitor.stats(),
            repetition_alerts: self.monitor.detect_repetition(),
        }
    }

    /// Stop background work and close the remote tier.
    pub async fn shutdown(&self) {
        let sweeper = mutex_lock(&self.sweeper, SOURCE, "shutdown").take();
        if let Some(handle) = sweeper {
            handle.abort();
            let _ = handle.await;
        }
        self.cache.close().await;
        info!("Acceleration layer shut down");
    }
}

async fn connect_remote(config: &CacheConfig, settings: &Settings) -> Arc<dyn RemoteCache> {
    let Some(url) = config.active_remote_url() else {
        if config.remote_url.is_some() {
            info!(
                environment = settings.environment.as_str(),
                "Remote cache URL ignored outside production, using local tier only"
            );
        } else {
            debug!("No remote cache configured, using local tier only");
        }
        return Arc::new(NullRemote);
    };

    match RedisRemote::connect(url, config.key_prefix.clone()).await {
        Ok(remote) => Arc::new(remote),
        Err(err) => {
            warn!(error = %err, "Remote cache unreachable at startup, using local tier only");
            Arc::new(NullRemote)
        }
    }
}
