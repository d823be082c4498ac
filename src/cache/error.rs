use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Failure talking to the remote tier.
///
/// Never surfaced past [`TieredCache`](super::TieredCache): a remote failure
/// degrades into a local-only miss or an ignored write.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote cache connection failed: {0}")]
    Connection(String),
    #[error("remote cache command `{command}` failed: {reason}")]
    Command {
        command: &'static str,
        reason: String,
    },
    #[error("remote cache returned malformed data for `{key}`: {reason}")]
    Malformed { key: String, reason: String },
    #[error("remote cache `{op}` timed out after {elapsed:?}")]
    Timeout {
        op: &'static str,
        elapsed: std::time::Duration,
    },
}

impl RemoteError {
    pub fn command(command: &'static str, reason: impl fmt::Display) -> Self {
        Self::Command {
            command,
            reason: reason.to_string(),
        }
    }
}

impl From<redis::RedisError> for RemoteError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_connection_dropped() || err.is_io_error() {
            Self::Connection(err.to_string())
        } else {
            Self::command("redis", err)
        }
    }
}

/// Error type for typed cache helpers.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to encode value for `{key}`: {reason}")]
    Encode { key: String, reason: String },
}

/// Outcome of a failed coalesced resolution.
///
/// Clonable so that every caller waiting on one load observes the same
/// failure; loader errors share a single allocation between waiters.
#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    #[error("loader failed: {0}")]
    Loader(Arc<dyn StdError + Send + Sync>),
    #[error("failed to encode value for `{key}`: {reason}")]
    Encode { key: String, reason: String },
    #[error("failed to decode value for `{key}`: {reason}")]
    Decode { key: String, reason: String },
    #[error("load for `{key}` was abandoned before settling")]
    Abandoned { key: String },
}

impl ResolveError {
    pub fn loader<E>(error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        let boxed: Box<dyn StdError + Send + Sync> = error.into();
        Self::Loader(Arc::from(boxed))
    }

    /// The loader's error, when this failure came from the loader.
    pub fn loader_error(&self) -> Option<&Arc<dyn StdError + Send + Sync>> {
        match self {
            Self::Loader(error) => Some(error),
            _ => None,
        }
    }

    pub fn is_loader(&self) -> bool {
        matches!(self, Self::Loader(_))
    }
}
