// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The two-tier cache.
//!
//! # Example
//!
//! ```
//! use telemetry_substrate::config::CacheConfig;
//! use telemetry_substrate::TieredCache;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let cache = TieredCache::new(&CacheConfig::default(), None);
//!
//! cache.set("device:42", &"living room", None).await.unwrap();
//! let name: Option<String> = cache.get("device:42").await;
//! assert_eq!(name.as_deref(), Some("living room"));
//!
//! cache.delete("device:42").await;
//! assert!(cache.get::<String>("device:42").await.is_none());
//! # }
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::codec;
use super::fast::{EntryMetadata, FastTier};
use super::query::QueryTtlRules;
use super::CacheError;
use crate::config::CacheConfig;
use crate::metrics::LatencyTimer;
use crate::redact::key_digest;
use crate::resilience::{CircuitBreaker, CircuitConfig, CircuitError, CircuitState};
use crate::storage::{PipelineOp, PipelineResult, SharedCacheClient, StorageError};

/// Keys requested per `SCAN` round trip during pattern deletes.
pub const SCAN_BATCH: usize = 100;

/// Per-call write options.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    /// Caller TTL; the fast tier uses the smaller of this and its default
    pub ttl: Option<Duration>,
    /// Skip the shared tier
    pub fast_only: bool,
}

#[derive(Debug, Default)]
struct Counters {
    fast_hits: AtomicU64,
    shared_hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    shared_skipped: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    evictions: AtomicU64,
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub fast_hits: u64,
    pub shared_hits: u64,
    pub misses: u64,
    /// Shared-tier failures and undecodable values, all degraded to misses
    pub errors: u64,
    /// Shared-tier calls skipped because the circuit breaker was open
    pub shared_skipped: u64,
    pub sets: u64,
    pub deletes: u64,
    pub evictions: u64,
    /// Current fast-tier entry count
    pub entries: usize,
}

impl CacheStats {
    /// Hit rate (0.0 - 1.0) across both tiers
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let hits = self.fast_hits + self.shared_hits;
        let total = hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }
}

pub struct TieredCache {
    prefix: String,
    fast: FastTier,
    shared: Option<Arc<dyn SharedCacheClient>>,
    breaker: CircuitBreaker,
    fast_ttl: Duration,
    shared_ttl: Duration,
    pub(crate) query_rules: QueryTtlRules,
    counters: Counters,
}

impl std::fmt::Debug for TieredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache")
            .field("prefix", &self.prefix)
            .field("shared", &self.shared.is_some())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl TieredCache {
    /// Build a cache. `shared` is the optional remote tier.
    pub fn new(config: &CacheConfig, shared: Option<Arc<dyn SharedCacheClient>>) -> Self {
        Self {
            prefix: config.prefix.clone(),
            fast: FastTier::new(config.fast.max_entries),
            shared,
            breaker: CircuitBreaker::new(
                "shared_cache",
                CircuitConfig::from_shared_tier(&config.shared),
            ),
            fast_ttl: config.fast_ttl(),
            shared_ttl: config.shared_ttl(),
            query_rules: QueryTtlRules::from_config(&config.query_ttl),
            counters: Counters::default(),
        }
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The key as stored in both tiers.
    #[must_use]
    pub fn namespaced(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    #[must_use]
    pub fn has_shared_tier(&self) -> bool {
        self.shared.is_some()
    }

    #[must_use]
    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Run a shared-tier call through the breaker. Every failure becomes `None`.
    async fn shared_call<'a, T, F, Fut>(&'a self, operation: &'static str, f: F) -> Option<T>
    where
        F: FnOnce(&'a dyn SharedCacheClient) -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let client = self.shared.as_deref()?;
        let _timer = LatencyTimer::new("shared", operation);
        match self.breaker.call(|| f(client)).await {
            Ok(value) => Some(value),
            Err(CircuitError::Rejected) => {
                self.counters.shared_skipped.fetch_add(1, Ordering::Relaxed);
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_cache_error("shared", operation);
                None
            }
            Err(CircuitError::Inner(e)) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_cache_error("shared", operation);
                warn!(operation, error = %e, "Shared cache call failed, degrading");
                None
            }
        }
    }

    /// Copy a shared-tier hit into the fast tier unless a write landed there
    /// while the shared read was in flight.
    fn promote(&self, full_key: String, bytes: Vec<u8>) {
        match self.fast.insert_if_absent(full_key, bytes, self.fast_ttl) {
            Some(true) => {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_cache_eviction(1);
            }
            Some(false) => {}
            None => debug!("Skipped promotion, fast tier already holds a newer value"),
        }
    }

    /// Read through both tiers. Never fails: backend and decode errors are misses.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let full = self.namespaced(key);

        if let Some(bytes) = self.fast.get(&full) {
            match codec::decode(&bytes) {
                Ok(value) => {
                    self.counters.fast_hits.fetch_add(1, Ordering::Relaxed);
                    crate::metrics::record_cache_lookup("fast", "hit");
                    return Some(value);
                }
                Err(e) => {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key_digest(&full), error = %e, "Dropping undecodable fast-tier entry");
                    self.fast.remove(&full);
                }
            }
        }

        let fetched = self.shared_call("get", |c| c.get(&full)).await;
        if let Some(Some(bytes)) = fetched {
            match codec::decode(&bytes) {
                Ok(value) => {
                    self.counters.shared_hits.fetch_add(1, Ordering::Relaxed);
                    crate::metrics::record_cache_lookup("shared", "hit");
                    debug!(key = %key_digest(&full), "Promoting shared-tier hit");
                    self.promote(full, bytes);
                    return Some(value);
                }
                Err(e) => {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key_digest(&full), error = %e, "Shared-tier value failed to decode");
                }
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_cache_lookup("all", "miss");
        None
    }

    /// Write through both tiers with `ttl` (or the tier defaults).
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        self.set_with(key, value, SetOptions { ttl, fast_only: false }).await
    }

    /// Write with explicit options. Only serialization errors are returned.
    pub async fn set_with<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        options: SetOptions,
    ) -> Result<(), CacheError> {
        let bytes = codec::encode(value)?;
        let full = self.namespaced(key);
        let fast_ttl = options.ttl.map_or(self.fast_ttl, |t| t.min(self.fast_ttl));
        let shared_ttl = options.ttl.unwrap_or(self.shared_ttl);

        let write_shared = !options.fast_only && self.shared.is_some();
        let shared_bytes = write_shared.then(|| bytes.clone());

        if self.fast.insert(full.clone(), bytes, fast_ttl) {
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_cache_eviction(1);
        }
        self.counters.sets.fetch_add(1, Ordering::Relaxed);

        if let Some(bytes) = shared_bytes {
            self.shared_call("set", |c| c.set(&full, &bytes, shared_ttl)).await;
        }
        Ok(())
    }

    /// Remove from both tiers. Returns true if either tier held the key.
    pub async fn delete(&self, key: &str) -> bool {
        let full = self.namespaced(key);
        let in_fast = self.fast.remove(&full);
        let keys = [full];
        let in_shared = self
            .shared_call("delete", |c| c.delete(&keys))
            .await
            .is_some_and(|n| n > 0);
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        in_fast || in_shared
    }

    pub async fn exists(&self, key: &str) -> bool {
        let full = self.namespaced(key);
        if self.fast.contains(&full) {
            return true;
        }
        self.shared_call("exists", |c| c.exists(&full))
            .await
            .unwrap_or(false)
    }

    /// Reset the expiry of `key` in both tiers. The fast tier caps `ttl` at its default.
    pub async fn expire(&self, key: &str, ttl: Duration) -> bool {
        let full = self.namespaced(key);
        let in_fast = self.fast.expire(&full, ttl.min(self.fast_ttl));
        let in_shared = self
            .shared_call("expire", |c| c.expire(&full, ttl))
            .await
            .unwrap_or(false);
        in_fast || in_shared
    }

    /// Batch read. Fast-tier misses are fetched from the shared tier in one pipeline.
    pub async fn get_many<T: DeserializeOwned>(&self, keys: &[&str]) -> HashMap<String, T> {
        let mut found = HashMap::with_capacity(keys.len());
        let mut missing: Vec<(&str, String)> = Vec::new();

        for &key in keys {
            let full = self.namespaced(key);
            match self.fast.get(&full).map(|b| codec::decode::<T>(&b)) {
                Some(Ok(value)) => {
                    self.counters.fast_hits.fetch_add(1, Ordering::Relaxed);
                    found.insert(key.to_string(), value);
                }
                _ => missing.push((key, full)),
            }
        }

        let mut misses = missing.len() as u64;
        if !missing.is_empty() {
            let ops: Vec<PipelineOp> = missing
                .iter()
                .map(|(_, full)| PipelineOp::Get(full.clone()))
                .collect();
            if let Some(results) = self.shared_call("get_many", |c| c.pipeline(ops)).await {
                for ((key, full), result) in missing.into_iter().zip(results) {
                    let PipelineResult::Value(Some(bytes)) = result else {
                        continue;
                    };
                    match codec::decode::<T>(&bytes) {
                        Ok(value) => {
                            self.counters.shared_hits.fetch_add(1, Ordering::Relaxed);
                            misses -= 1;
                            self.promote(full, bytes);
                            found.insert(key.to_string(), value);
                        }
                        Err(_) => {
                            self.counters.errors.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            }
        }
        self.counters.misses.fetch_add(misses, Ordering::Relaxed);
        found
    }

    /// Batch write. Every value is encoded before anything is written.
    pub async fn set_many<K, V, I>(
        &self,
        entries: I,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Serialize,
    {
        let encoded = entries
            .into_iter()
            .map(|(k, v)| Ok((self.namespaced(k.as_ref()), codec::encode(&v)?)))
            .collect::<Result<Vec<_>, CacheError>>()?;
        if encoded.is_empty() {
            return Ok(());
        }

        let fast_ttl = ttl.map_or(self.fast_ttl, |t| t.min(self.fast_ttl));
        let shared_ttl = ttl.unwrap_or(self.shared_ttl);
        let mut evicted = 0;
        for (full, bytes) in &encoded {
            if self.fast.insert(full.clone(), bytes.clone(), fast_ttl) {
                evicted += 1;
            }
        }
        self.counters.evictions.fetch_add(evicted, Ordering::Relaxed);
        self.counters.sets.fetch_add(encoded.len() as u64, Ordering::Relaxed);

        if self.shared.is_some() {
            let ops: Vec<PipelineOp> = encoded
                .into_iter()
                .map(|(key, value)| PipelineOp::Set { key, value, ttl: shared_ttl })
                .collect();
            self.shared_call("set_many", |c| c.pipeline(ops)).await;
        }
        Ok(())
    }

    /// Delete every key in this cache's namespace matching a Redis-style glob.
    ///
    /// The shared tier is walked with `SCAN` in batches of [`SCAN_BATCH`].
    /// Returns the number of entries removed, counted per tier.
    pub async fn delete_pattern(&self, pattern: &str) -> usize {
        let full_pattern = format!("{}{}", escape_glob(&self.prefix), pattern);
        let mut removed = self.fast.remove_matching(&full_pattern);

        if self.shared.is_some() {
            let mut cursor = 0u64;
            loop {
                let Some((next, keys)) = self
                    .shared_call("scan", |c| c.scan(cursor, &full_pattern, SCAN_BATCH))
                    .await
                else {
                    break;
                };
                if !keys.is_empty() {
                    if let Some(n) = self.shared_call("delete", |c| c.delete(&keys)).await {
                        removed += usize::try_from(n).unwrap_or(usize::MAX);
                    }
                }
                if next == 0 {
                    break;
                }
                cursor = next;
            }
        }

        self.counters.deletes.fetch_add(removed as u64, Ordering::Relaxed);
        info!(pattern = %key_digest(&full_pattern), removed, "Cache pattern invalidated");
        removed
    }

    /// Remove everything under this cache's prefix, and nothing else.
    ///
    /// Without a prefix the shared tier has no namespace of ours, so only
    /// the fast tier is cleared.
    pub async fn clear(&self) -> usize {
        if self.prefix.is_empty() {
            let removed = self.fast.remove_matching("*");
            self.counters.deletes.fetch_add(removed as u64, Ordering::Relaxed);
            warn!(removed, "Cache has no prefix, shared tier left untouched by clear");
            return removed;
        }
        self.delete_pattern("*").await
    }

    /// Fast-tier metadata for `key`, if it is live there.
    #[must_use]
    pub fn fast_entry(&self, key: &str) -> Option<EntryMetadata> {
        self.fast.metadata(&self.namespaced(key))
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        let entries = self.fast.len();
        crate::metrics::set_fast_cache_entries(entries);
        CacheStats {
            fast_hits: c.fast_hits.load(Ordering::Relaxed),
            shared_hits: c.shared_hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
            shared_skipped: c.shared_skipped.load(Ordering::Relaxed),
            sets: c.sets.load(Ordering::Relaxed),
            deletes: c.deletes.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            entries,
        }
    }
}

/// Escape glob metacharacters so a literal prefix matches only itself.
#[must_use]
pub fn escape_glob(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    for c in literal.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemorySharedCache;
    use async_trait::async_trait;
    use serde::Deserialize;

    fn config() -> CacheConfig {
        let mut config = CacheConfig::default();
        config.prefix = "t:".into();
        config.fast.max_entries = 8;
        config.fast.default_ttl_s = 60;
        config
    }

    fn with_shared() -> (TieredCache, Arc<InMemorySharedCache>) {
        let shared = Arc::new(InMemorySharedCache::new());
        let cache = TieredCache::new(&config(), Some(shared.clone() as Arc<dyn SharedCacheClient>));
        (cache, shared)
    }

    struct BrokenShared;

    #[async_trait]
    impl SharedCacheClient for BrokenShared {
        async fn get(&self, _: &str) -> Result<Option<Vec<u8>>, StorageError> {
            Err(StorageError::Backend("connection refused".into()))
        }
        async fn set(&self, _: &str, _: &[u8], _: Duration) -> Result<(), StorageError> {
            Err(StorageError::Backend("connection refused".into()))
        }
        async fn delete(&self, _: &[String]) -> Result<u64, StorageError> {
            Err(StorageError::Backend("connection refused".into()))
        }
        async fn scan(
            &self,
            _: u64,
            _: &str,
            _: usize,
        ) -> Result<(u64, Vec<String>), StorageError> {
            Err(StorageError::Backend("connection refused".into()))
        }
        async fn exists(&self, _: &str) -> Result<bool, StorageError> {
            Err(StorageError::Backend("connection refused".into()))
        }
        async fn expire(&self, _: &str, _: Duration) -> Result<bool, StorageError> {
            Err(StorageError::Backend("connection refused".into()))
        }
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Device {
        id: u32,
        name: String,
    }

    #[tokio::test]
    async fn test_set_then_get_hits_fast_tier() {
        let (cache, shared) = with_shared();
        let device = Device { id: 1, name: "kettle".into() };
        cache.set("device:1", &device, None).await.unwrap();

        assert_eq!(cache.get::<Device>("device:1").await, Some(device));
        assert!(shared.exists("t:device:1").await.unwrap());
        let stats = cache.stats();
        assert_eq!(stats.fast_hits, 1);
        assert_eq!(stats.sets, 1);
    }

    #[tokio::test]
    async fn test_shared_hit_promotes_with_fast_ttl() {
        let (cache, shared) = with_shared();
        shared.set("t:k", b"\"v\"", Duration::from_secs(30)).await.unwrap();

        assert_eq!(cache.get::<String>("k").await.as_deref(), Some("v"));
        let meta = cache.fast_entry("k").unwrap();
        assert_eq!(meta.ttl, Duration::from_secs(60));
        assert_eq!(cache.stats().shared_hits, 1);

        // Second read is served from the fast tier
        cache.get::<String>("k").await;
        assert_eq!(cache.stats().fast_hits, 1);
    }

    #[tokio::test]
    async fn test_caller_ttl_caps_fast_tier_only() {
        let (cache, shared) = with_shared();
        cache.set("short", &1, Some(Duration::from_secs(5))).await.unwrap();
        cache.set("long", &2, Some(Duration::from_secs(600))).await.unwrap();

        assert_eq!(cache.fast_entry("short").unwrap().ttl, Duration::from_secs(5));
        assert_eq!(cache.fast_entry("long").unwrap().ttl, Duration::from_secs(60));
        assert!(shared.ttl("t:long").unwrap() > Duration::from_secs(500));
    }

    #[tokio::test]
    async fn test_fast_only_skips_shared() {
        let (cache, shared) = with_shared();
        cache
            .set_with("local", &"x", SetOptions { ttl: None, fast_only: true })
            .await
            .unwrap();
        assert!(cache.exists("local").await);
        assert!(!shared.exists("t:local").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_clears_both_tiers_and_is_idempotent() {
        let (cache, shared) = with_shared();
        cache.set("k", &"v", None).await.unwrap();

        assert!(cache.delete("k").await);
        assert!(!cache.delete("k").await);
        assert!(cache.get::<String>("k").await.is_none());
        assert!(!shared.exists("t:k").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_pattern_and_clear_respect_namespace() {
        let (cache, shared) = with_shared();
        for i in 0..5 {
            cache.set(&format!("device:{i}"), &i, None).await.unwrap();
        }
        cache.set("reading:1", &1, None).await.unwrap();
        shared.set("other:device:1", b"1", Duration::from_secs(60)).await.unwrap();

        let removed = cache.delete_pattern("device:*").await;
        assert_eq!(removed, 10); // five per tier
        assert!(cache.exists("reading:1").await);

        cache.clear().await;
        assert!(!cache.exists("reading:1").await);
        assert!(shared.exists("other:device:1").await.unwrap());
    }

    #[tokio::test]
    async fn test_prefix_with_glob_chars_is_literal() {
        let mut cfg = config();
        cfg.prefix = "a*:".into();
        let shared = Arc::new(InMemorySharedCache::new());
        let cache = TieredCache::new(&cfg, Some(shared.clone() as Arc<dyn SharedCacheClient>));
        shared.set("ab:x", b"1", Duration::from_secs(60)).await.unwrap();
        cache.set("x", &1, None).await.unwrap();

        cache.clear().await;
        assert!(shared.exists("ab:x").await.unwrap());
        assert!(!shared.exists("a*:x").await.unwrap());
    }

    /// Shared tier whose `get` parks until released.
    #[derive(Default)]
    struct GatedShared {
        inner: InMemorySharedCache,
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl SharedCacheClient for GatedShared {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StorageError> {
            self.inner.set(key, value, ttl).await
        }
        async fn delete(&self, keys: &[String]) -> Result<u64, StorageError> {
            self.inner.delete(keys).await
        }
        async fn scan(
            &self,
            cursor: u64,
            pattern: &str,
            count: usize,
        ) -> Result<(u64, Vec<String>), StorageError> {
            self.inner.scan(cursor, pattern, count).await
        }
        async fn exists(&self, key: &str) -> Result<bool, StorageError> {
            self.inner.exists(key).await
        }
        async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StorageError> {
            self.inner.expire(key, ttl).await
        }
    }

    #[tokio::test]
    async fn test_write_during_shared_read_is_not_overwritten_by_promotion() {
        let shared = Arc::new(GatedShared::default());
        let old = codec::encode(&1u32).unwrap();
        shared.inner.set("t:k", &old, Duration::from_secs(60)).await.unwrap();
        let cache = TieredCache::new(&config(), Some(shared.clone() as Arc<dyn SharedCacheClient>));

        let (read, ()) = tokio::join!(cache.get::<u32>("k"), async {
            shared.entered.notified().await;
            cache.set("k", &2u32, None).await.unwrap();
            shared.release.notify_one();
        });

        // The read started before the write and may return the old value
        assert_eq!(read, Some(1));
        // The fast tier keeps the newer write
        assert_eq!(cache.get::<u32>("k").await, Some(2));
        assert_eq!(cache.stats().fast_hits, 1);
    }

    #[tokio::test]
    async fn test_clear_without_prefix_spares_shared_tier() {
        let mut cfg = config();
        cfg.prefix = String::new();
        let shared = Arc::new(InMemorySharedCache::new());
        let cache = TieredCache::new(&cfg, Some(shared.clone() as Arc<dyn SharedCacheClient>));
        shared.set("other-tenant:session", b"1", Duration::from_secs(60)).await.unwrap();
        cache.set("mine", &1, None).await.unwrap();

        assert_eq!(cache.clear().await, 1);
        assert!(cache.fast_entry("mine").is_none());
        assert!(shared.exists("other-tenant:session").await.unwrap());
        assert!(shared.exists("mine").await.unwrap());
    }

    #[tokio::test]
    async fn test_broken_shared_tier_leaves_fast_tier_working() {
        let cache = TieredCache::new(&config(), Some(Arc::new(BrokenShared)));
        cache.set("k", &"v", None).await.unwrap();
        assert_eq!(cache.get::<String>("k").await.as_deref(), Some("v"));
        assert!(cache.get::<String>("absent").await.is_none());
        assert!(cache.delete("k").await);
        assert_eq!(cache.delete_pattern("*").await, 0);

        let stats = cache.stats();
        assert!(stats.errors >= 4);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_get_many_and_set_many() {
        let (cache, shared) = with_shared();
        let batch: HashMap<String, u32> = [("a".to_string(), 1), ("b".to_string(), 2)].into();
        cache.set_many(&batch, None).await.unwrap();
        shared.set("t:c", b"3", Duration::from_secs(60)).await.unwrap();

        let got: HashMap<String, u32> = cache.get_many(&["a", "b", "c", "d"]).await;
        assert_eq!(got.len(), 3);
        assert_eq!(got["c"], 3);
        let stats = cache.stats();
        assert_eq!(stats.fast_hits, 2);
        assert_eq!(stats.shared_hits, 1);
        assert_eq!(stats.misses, 1);
        assert!(cache.fast_entry("c").is_some());
    }

    #[tokio::test]
    async fn test_serialization_error_propagates() {
        struct Unserializable;
        impl Serialize for Unserializable {
            fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
                Err(serde::ser::Error::custom("not serializable"))
            }
        }
        let cache = TieredCache::new(&config(), None);
        assert!(matches!(
            cache.set("bad", &Unserializable, None).await,
            Err(CacheError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_expire_updates_fast_entry() {
        let (cache, _shared) = with_shared();
        cache.set("k", &1, None).await.unwrap();
        assert!(cache.expire("k", Duration::from_secs(10)).await);
        assert_eq!(cache.fast_entry("k").unwrap().ttl, Duration::from_secs(10));
        assert!(!cache.expire("missing", Duration::from_secs(10)).await);
    }

    #[test]
    fn test_escape_glob() {
        assert_eq!(escape_glob("plug:"), "plug:");
        assert_eq!(escape_glob("a*[b]?"), r"a\*\[b\]\?");
    }
}
