//! Cache key derivation.
//!
//! Keys are plain strings of the form `{namespace}:{segment}:...:{digest}`.
//! Namespaced prefixes make coarse invalidation through `clear_by_prefix`
//! possible; digests are SHA-256 over a canonical JSON encoding so that
//! logically identical inputs map to the same key regardless of field or map
//! ordering.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Separator between key segments.
pub const KEY_SEPARATOR: char = ':';

/// Hex length of digests embedded in keys.
const DIGEST_LEN: usize = 32;

/// Canonical JSON encoding of `value`.
///
/// Objects are emitted with sorted keys at every depth, so any two values that
/// compare equal as JSON encode identically.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
    let value = sort_objects(serde_json::to_value(value)?);
    serde_json::to_string(&value)
}

fn sort_objects(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, sort_objects(value)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_objects).collect()),
        other => other,
    }
}

/// Truncated SHA-256 digest of the canonical encoding of `value`.
pub fn canonical_digest<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
    let encoded = canonical_json(value)?;
    Ok(digest_str(&encoded))
}

/// Truncated SHA-256 hex digest of `input`.
pub fn digest_str(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut hex = hex::encode(digest.as_slice());
    hex.truncate(DIGEST_LEN);
    hex
}

/// Key under which a batch load for `keys` is coalesced and cached.
///
/// The key set is sorted and deduplicated first, so `{b, a, a}` and `{a, b}`
/// share one key while `{a, c}` does not.
pub fn batch_key<S: AsRef<str>>(namespace: &str, keys: &[S]) -> (String, Vec<String>) {
    let normalized = normalize_key_set(keys);
    let joined = normalized.join("\u{1f}");
    let key = KeyBuilder::new("batch")
        .segment(namespace)
        .segment(digest_str(&joined))
        .build();
    (key, normalized)
}

/// Sort and deduplicate a key set.
pub fn normalize_key_set<S: AsRef<str>>(keys: &[S]) -> Vec<String> {
    let mut normalized: Vec<String> = keys.iter().map(|key| key.as_ref().to_string()).collect();
    normalized.sort_unstable();
    normalized.dedup();
    normalized
}

/// Incremental builder for namespaced keys.
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    key: String,
}

impl KeyBuilder {
    pub fn new(namespace: &str) -> Self {
        Self {
            key: sanitize_segment(namespace),
        }
    }

    /// Append a segment; separators inside the segment are escaped so a
    /// segment can never forge a deeper prefix.
    pub fn segment(mut self, segment: impl AsRef<str>) -> Self {
        self.key.push(KEY_SEPARATOR);
        self.key.push_str(&sanitize_segment(segment.as_ref()));
        self
    }

    /// The key built so far followed by a trailing separator, suitable for
    /// prefix invalidation.
    pub fn prefix(&self) -> String {
        let mut prefix = self.key.clone();
        prefix.push(KEY_SEPARATOR);
        prefix
    }

    pub fn build(self) -> String {
        self.key
    }
}

fn sanitize_segment(segment: &str) -> String {
    segment.replace('%', "%25").replace(KEY_SEPARATOR, "%3A")
}
