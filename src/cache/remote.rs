//! Shared remote tier.
//!
//! The remote tier is consumed through [`RemoteCache`]; when no remote store
//! is configured, [`NullRemote`] is selected once at construction so the
//! tiered cache never branches on configuration.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::{debug, info};

use super::error::RemoteError;

const SCAN_BATCH: usize = 200;

/// A value read from the remote tier together with its remaining lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub value: Bytes,
    /// Time left before the store expires the key; `None` when it never expires.
    pub ttl: Option<Duration>,
}

impl RemoteEntry {
    pub fn new(value: Bytes, ttl: Option<Duration>) -> Self {
        Self { value, ttl }
    }
}

/// Operations the tiered cache needs from a shared store.
#[async_trait]
pub trait RemoteCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<RemoteEntry>, RemoteError>;

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), RemoteError>;

    async fn delete(&self, key: &str) -> Result<(), RemoteError>;

    /// Delete every key starting with `prefix`, returning the number deleted.
    async fn delete_pattern(&self, prefix: &str) -> Result<usize, RemoteError>;

    /// Delete every key owned by this cache.
    async fn flush(&self) -> Result<(), RemoteError>;

    /// Whether this implementation talks to a real store.
    fn is_active(&self) -> bool {
        true
    }

    /// Release connections; further calls may fail.
    async fn close(&self) {}
}

/// Remote tier used when none is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRemote;

#[async_trait]
impl RemoteCache for NullRemote {
    async fn get(&self, _key: &str) -> Result<Option<RemoteEntry>, RemoteError> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: Bytes, _ttl: Duration) -> Result<(), RemoteError> {
        Ok(())
    }

    async fn delete(&self, _key: &str) -> Result<(), RemoteError> {
        Ok(())
    }

    async fn delete_pattern(&self, _prefix: &str) -> Result<usize, RemoteError> {
        Ok(0)
    }

    async fn flush(&self) -> Result<(), RemoteError> {
        Ok(())
    }

    fn is_active(&self) -> bool {
        false
    }
}

/// Redis-backed remote tier.
///
/// Keys are namespaced with `key_prefix` so that `flush` only removes this
/// cache's entries from a shared database.
#[derive(Clone)]
pub struct RedisRemote {
    connection: ConnectionManager,
    key_prefix: String,
}

impl RedisRemote {
    /// Connect to `url`, failing fast if the server is unreachable.
    pub async fn connect(url: &str, key_prefix: impl Into<String>) -> Result<Self, RemoteError> {
        let client =
            redis::Client::open(url).map_err(|err| RemoteError::Connection(err.to_string()))?;
        let connection = client
            .get_connection_manager()
            .await
            .map_err(|err| RemoteError::Connection(err.to_string()))?;

        let remote = Self {
            connection,
            key_prefix: key_prefix.into(),
        };
        remote.ping().await?;
        info!(key_prefix = %remote.key_prefix, "Remote cache tier connected");
        Ok(remote)
    }

    pub async fn ping(&self) -> Result<(), RemoteError> {
        let mut conn = self.connection.clone();
        let _pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn scan_delete(&self, pattern: String) -> Result<usize, RemoteError> {
        let mut conn = self.connection.clone();
        let mut cursor: u64 = 0;
        let mut deleted = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                let removed: usize = conn.del(&keys).await?;
                deleted += removed;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(pattern = %pattern, deleted, "Remote keys deleted by pattern");
        Ok(deleted)
    }
}

/// Interpret a `PTTL` reply.
///
/// The outer `None` means the key is gone or already expired; `Some(None)`
/// means the key has no expiry.
fn remaining_ttl(pttl: i64) -> Option<Option<Duration>> {
    match pttl {
        -1 => Some(None),
        millis => u64::try_from(millis)
            .ok()
            .filter(|millis| *millis > 0)
            .map(|millis| Some(Duration::from_millis(millis))),
    }
}

/// Escape glob metacharacters so a literal prefix can be used in `MATCH`.
fn escape_glob(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

#[async_trait]
impl RemoteCache for RedisRemote {
    async fn get(&self, key: &str) -> Result<Option<RemoteEntry>, RemoteError> {
        let mut conn = self.connection.clone();
        let key = self.namespaced(key);
        let (value, pttl): (Option<Vec<u8>>, i64) = redis::pipe()
            .atomic()
            .get(&key)
            .pttl(&key)
            .query_async(&mut conn)
            .await?;

        let Some(value) = value else {
            return Ok(None);
        };
        Ok(remaining_ttl(pttl).map(|ttl| RemoteEntry::new(Bytes::from(value), ttl)))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), RemoteError> {
        let mut conn = self.connection.clone();
        // A zero expiry would be rejected; round sub-millisecond TTLs up.
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        conn.pset_ex::<_, _, ()>(self.namespaced(key), value.as_ref(), millis)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), RemoteError> {
        let mut conn = self.connection.clone();
        conn.del::<_, ()>(self.namespaced(key)).await?;
        Ok(())
    }

    async fn delete_pattern(&self, prefix: &str) -> Result<usize, RemoteError> {
        let pattern = format!("{}*", escape_glob(&self.namespaced(prefix)));
        self.scan_delete(pattern).await
    }

    async fn flush(&self) -> Result<(), RemoteError> {
        let pattern = format!("{}*", escape_glob(&self.key_prefix));
        self.scan_delete(pattern).await.map(|_| ())
    }

    async fn close(&self) {
        debug!(key_prefix = %self.key_prefix, "Remote cache tier closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_remote_is_inactive_and_always_misses() {
        let remote = NullRemote;
        remote
            .set("k", Bytes::from_static(b"v"), Duration::from_secs(1))
            .await
            .expect("null set");
        assert!(remote.get("k").await.expect("null get").is_none());
        assert_eq!(remote.delete_pattern("k").await.expect("null delete"), 0);
        assert!(!remote.is_active());
    }

    #[test]
    fn pttl_replies_map_to_remaining_lifetime() {
        assert_eq!(remaining_ttl(1500), Some(Some(Duration::from_millis(1500))));
        assert_eq!(remaining_ttl(-1), Some(None));
        assert_eq!(remaining_ttl(-2), None);
        assert_eq!(remaining_ttl(0), None);
    }

    #[test]
    fn glob_metacharacters_are_escaped() {
        assert_eq!(escape_glob("page:rooms:"), "page:rooms:");
        assert_eq!(escape_glob("a*b?[c]\\"), "a\\*b\\?\\[c\\]\\\\");
    }
}
