// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Memoizing wrapper over a [`TieredCache`].
//!
//! Arguments are hashed into a key (`{prefix}:{sha256(json(args))}`) unless a
//! [`KeyBuilder`] is supplied. The wrapped function runs only on a miss.
//! `Ok(None)` results are stored only when `cache_none` is set, which keeps
//! lookups of absent devices from hammering the database.

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::{CacheError, TieredCache};

/// Builds a cache key from the JSON form of the arguments.
pub type KeyBuilder = Arc<dyn Fn(&serde_json::Value) -> String + Send + Sync>;

pub struct Memoized<F> {
    cache: Arc<TieredCache>,
    prefix: String,
    ttl: Option<Duration>,
    cache_none: bool,
    key_builder: Option<KeyBuilder>,
    func: F,
}

impl<F> Memoized<F> {
    pub fn new(cache: Arc<TieredCache>, prefix: impl Into<String>, func: F) -> Self {
        Self {
            cache,
            prefix: prefix.into(),
            ttl: None,
            cache_none: false,
            key_builder: None,
            func,
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Store `None` results too.
    #[must_use]
    pub fn cache_none(mut self, cache_none: bool) -> Self {
        self.cache_none = cache_none;
        self
    }

    #[must_use]
    pub fn with_key_builder(mut self, builder: KeyBuilder) -> Self {
        self.key_builder = Some(builder);
        self
    }

    /// The cache key `args` map to.
    pub fn key_for<A: Serialize>(&self, args: &A) -> Result<String, CacheError> {
        let json =
            serde_json::to_value(args).map_err(|e| CacheError::Serialization(e.to_string()))?;
        if let Some(builder) = &self.key_builder {
            return Ok(builder(&json));
        }
        // serde_json::Value maps are ordered, so equal arguments hash equally
        let canonical =
            serde_json::to_vec(&json).map_err(|e| CacheError::Serialization(e.to_string()))?;
        Ok(format!("{}:{}", self.prefix, hex::encode(Sha256::digest(&canonical))))
    }

    /// Return the cached result for `args`, or run the function and cache it.
    pub async fn call<A, T, E, Fut>(&self, args: A) -> Result<Option<T>, E>
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
        A: Serialize,
        T: Serialize + DeserializeOwned,
        E: From<CacheError>,
    {
        let key = self.key_for(&args)?;
        if let Some(cached) = self.cache.get::<Option<T>>(&key).await {
            return Ok(cached);
        }

        let result = (self.func)(args).await?;
        if result.is_some() || self.cache_none {
            self.cache.set(&key, &result, self.ttl).await?;
        }
        Ok(result)
    }

    /// Drop the cached result for `args`.
    pub async fn invalidate<A: Serialize>(&self, args: &A) -> Result<bool, CacheError> {
        let key = self.key_for(args)?;
        Ok(self.cache.delete(&key).await)
    }
}
