//! Higher-order helpers built on [`RequestCoalescer::resolve`].

use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::coalesce::{RequestCoalescer, ResolveOptions};
use super::error::ResolveError;
use super::keys::KeyBuilder;

/// Options applied to every call made through a [`Cached`] function.
pub type CacheOptions = ResolveOptions;

const RELATIONS_NAMESPACE: &str = "relations";

/// First stage of [`cached`]: the key function and options, waiting for a
/// loader.
pub struct CacheWrapper<K> {
    coalescer: Arc<RequestCoalescer>,
    key_fn: K,
    options: CacheOptions,
}

/// Build a caching wrapper: `cached(coalescer, key_fn, options).wrap(loader)`.
///
/// The wrapped function derives a key from its argument with `key_fn` and
/// resolves it through the coalescer, so concurrent calls with equal keys
/// share a single `loader` invocation.
pub fn cached<K>(coalescer: &Arc<RequestCoalescer>, key_fn: K, options: CacheOptions) -> CacheWrapper<K> {
    CacheWrapper {
        coalescer: Arc::clone(coalescer),
        key_fn,
        options,
    }
}

impl<K> CacheWrapper<K> {
    pub fn wrap<F>(self, loader: F) -> Cached<K, F> {
        Cached {
            coalescer: self.coalescer,
            key_fn: self.key_fn,
            loader,
            options: self.options,
        }
    }
}

/// A loader wrapped with caching and coalescing.
pub struct Cached<K, F> {
    coalescer: Arc<RequestCoalescer>,
    key_fn: K,
    loader: F,
    options: CacheOptions,
}

impl<K, F> Cached<K, F> {
    pub async fn call<A, T, E, Fut>(&self, args: A) -> Result<T, ResolveError>
    where
        K: Fn(&A) -> String,
        F: Fn(A) -> Fut,
        T: Serialize + DeserializeOwned + Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync>> + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let key = (self.key_fn)(&args);
        self.coalescer
            .resolve(&key, || (self.loader)(args), self.options.clone())
            .await
    }

    /// Drop the cached result for `args`.
    pub async fn invalidate<A>(&self, args: &A)
    where
        K: Fn(&A) -> String,
    {
        let key = (self.key_fn)(args);
        self.coalescer.invalidate(&key).await;
    }
}

/// Caches entity-with-relations aggregates under `relations:{entity}:{id}`.
#[derive(Clone)]
pub struct RelationLoader {
    coalescer: Arc<RequestCoalescer>,
    options: CacheOptions,
}

impl RelationLoader {
    pub fn new(coalescer: Arc<RequestCoalescer>, options: CacheOptions) -> Self {
        Self { coalescer, options }
    }

    pub fn key(entity: &str, id: impl fmt::Display) -> String {
        KeyBuilder::new(RELATIONS_NAMESPACE)
            .segment(entity)
            .segment(id.to_string())
            .build()
    }

    /// Load `entity` `id` together with its relations through `fetch`.
    ///
    /// Samples are recorded as `relations:{entity}` so repeated per-row
    /// lookups show up in repetition detection.
    pub async fn load_with_relations<T, E, F, Fut>(
        &self,
        entity: &str,
        id: impl fmt::Display,
        fetch: F,
    ) -> Result<T, ResolveError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync>> + Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let key = Self::key(entity, id);
        let mut options = self.options.clone();
        if options.operation.is_none() {
            options.operation = Some(format!("{RELATIONS_NAMESPACE}:{entity}"));
        }
        self.coalescer.resolve(&key, fetch, options).await
    }

    pub async fn invalidate(&self, entity: &str, id: impl fmt::Display) {
        self.coalescer.invalidate(&Self::key(entity, id)).await;
    }

    /// Drop every cached aggregate for `entity`.
    pub async fn invalidate_entity(&self, entity: &str) -> usize {
        let prefix = KeyBuilder::new(RELATIONS_NAMESPACE).segment(entity).prefix();
        self.coalescer.cache().clear_by_prefix(&prefix).await
    }
}
