//! Cache configuration.
//!
//! Controls the local tier bounds, TTL defaults and the optional remote tier.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

const DEFAULT_TTL_SECS: u64 = 300;
const DEFAULT_MAX_ENTRIES: usize = 1000;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
const DEFAULT_KEY_PREFIX: &str = "concierge:";
const DEFAULT_REMOTE_TIMEOUT_MS: u64 = 250;

/// Tiered cache configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL applied when a caller does not supply one.
    pub default_ttl: Duration,
    /// Maximum entries held by the local tier before LRU eviction.
    pub max_entries: usize,
    /// Interval between expired-entry sweeps; `None` disables sweeping.
    pub sweep_interval: Option<Duration>,
    /// Connection string for the shared remote tier.
    ///
    /// Only honoured when `remote_enabled` is set.
    pub remote_url: Option<String>,
    /// Whether the runtime mode permits the remote tier.
    pub remote_enabled: bool,
    /// Namespace prepended to every key written to the remote tier.
    pub key_prefix: String,
    /// Upper bound on a single remote command; slower calls count as failures.
    pub remote_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            max_entries: DEFAULT_MAX_ENTRIES,
            sweep_interval: Some(Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS)),
            remote_url: None,
            remote_enabled: false,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            remote_timeout: Duration::from_millis(DEFAULT_REMOTE_TIMEOUT_MS),
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            default_ttl: settings.default_ttl,
            max_entries: settings.max_entries.get(),
            sweep_interval: settings.sweep_interval,
            remote_url: settings.remote_url.clone(),
            remote_enabled: settings.remote_enabled,
            key_prefix: settings.key_prefix.clone(),
            remote_timeout: settings.remote_timeout,
        }
    }
}

impl CacheConfig {
    /// Returns the remote URL when the remote tier should be connected.
    pub fn active_remote_url(&self) -> Option<&str> {
        if !self.remote_enabled {
            return None;
        }
        self.remote_url.as_deref()
    }

    /// Returns the local capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn max_entries_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_entries).unwrap_or(NonZeroUsize::MIN)
    }

    /// Returns the TTL to use for a write, falling back to the default.
    pub fn ttl_or_default(&self, ttl: Option<Duration>) -> Duration {
        match ttl {
            Some(ttl) if !ttl.is_zero() => ttl,
            _ => self.default_ttl,
        }
    }
}
