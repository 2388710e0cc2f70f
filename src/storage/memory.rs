// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

use super::traits::{SharedCacheClient, StorageError};
use crate::cache::glob::glob_match;

#[derive(Debug, Clone)]
struct StoredValue {
    bytes: Vec<u8>,
    expires_at: Instant,
}

/// In-process stand-in for a remote shared cache.
///
/// Used by tests and the demo, and as the shared tier when several caches in
/// one process should see each other's writes.
#[derive(Debug, Default)]
pub struct InMemorySharedCache {
    data: DashMap<String, StoredValue>,
}

impl InMemorySharedCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current live key count
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.data.iter().filter(|e| e.value().expires_at > now).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining time to live for `key`, if present.
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.data
            .get(key)
            .and_then(|e| e.value().expires_at.checked_duration_since(now))
            .filter(|d| !d.is_zero())
    }

    fn live(&self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        let expired = match self.data.get(key) {
            None => return None,
            Some(entry) if entry.value().expires_at > now => {
                return Some(entry.value().bytes.clone());
            }
            Some(_) => true,
        };
        if expired {
            self.data.remove_if(key, |_, v| v.expires_at <= now);
        }
        None
    }
}

#[async_trait]
impl SharedCacheClient for InMemorySharedCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.live(key))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StorageError> {
        self.data.insert(
            key.to_string(),
            StoredValue {
                bytes: value.to_vec(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, StorageError> {
        let now = Instant::now();
        let removed = keys
            .iter()
            .filter_map(|k| self.data.remove(k))
            .filter(|(_, v)| v.expires_at > now)
            .count();
        Ok(removed as u64)
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), StorageError> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .data
            .iter()
            .filter(|e| e.value().expires_at > now)
            .map(|e| e.key().clone())
            .collect();
        keys.sort();

        let start = usize::try_from(cursor).unwrap_or(usize::MAX).min(keys.len());
        let end = start.saturating_add(count.max(1)).min(keys.len());
        let page = keys[start..end]
            .iter()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        let next = if end >= keys.len() { 0 } else { end as u64 };
        Ok((next, page))
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.live(key).is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StorageError> {
        if self.live(key).is_none() {
            return Ok(false);
        }
        Ok(match self.data.get_mut(key) {
            Some(mut entry) => {
                entry.expires_at = Instant::now() + ttl;
                true
            }
            None => false,
        })
    }
}
