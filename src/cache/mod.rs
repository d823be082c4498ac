//! Concierge Cache System
//!
//! Provides the caching half of the data-access acceleration layer:
//!
//! - **Local tier**: bounded, TTL-aware LRU store living in this process
//! - **Remote tier**: optional shared store (Redis) for multi-process consistency
//! - **Coalescer**: deduplicates concurrent loads of the same uncached key
//!
//! ## Configuration
//!
//! Cache behavior is controlled via the `[cache]` section of `concierge.toml`:
//!
//! ```toml
//! [cache]
//! default_ttl_seconds = 300
//! max_entries = 1000
//! sweep_interval_seconds = 60
//! # remote_url = "redis://127.0.0.1/"   # used only in production
//! ```

mod cached;
mod coalesce;
mod config;
mod error;
pub mod keys;
pub(crate) mod lock;
mod remote;
mod store;
mod tiered;

pub use cached::{CacheOptions, CacheWrapper, Cached, RelationLoader, cached};
pub use coalesce::{CoalescerStats, RequestCoalescer, ResolveOptions};
pub use config::CacheConfig;
pub use error::{CacheError, RemoteError, ResolveError};
pub use keys::KeyBuilder;
pub use remote::{NullRemote, RedisRemote, RemoteCache, RemoteEntry};
pub use store::{CacheEntry, LocalTier};
pub use tiered::{CacheStats, TieredCache};
