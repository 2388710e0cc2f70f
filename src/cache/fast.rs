// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process fast tier: a bounded LRU of encoded values with per-entry TTL.
//!
//! One mutex guards the map and its recency order. Every operation takes it
//! briefly and never awaits while holding it.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::time::Instant;

use super::glob::glob_match;

#[derive(Debug, Clone)]
struct FastEntry {
    bytes: Vec<u8>,
    inserted_at: Instant,
    ttl: Duration,
    last_access: Instant,
}

impl FastEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) >= self.ttl
    }
}

/// Metadata of a live fast-tier entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryMetadata {
    pub inserted_at: Instant,
    pub ttl: Duration,
    pub last_access: Instant,
}

impl EntryMetadata {
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.ttl.saturating_sub(Instant::now().duration_since(self.inserted_at))
    }
}

pub struct FastTier {
    entries: Mutex<LruCache<String, FastEntry>>,
    /// Zero disables the tier
    capacity: usize,
}

impl FastTier {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
            capacity,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fetch a live entry, bumping its recency. Expired entries are dropped.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let expired = match entries.get_mut(key) {
            None => return None,
            Some(entry) if !entry.is_expired(now) => {
                entry.last_access = now;
                return Some(entry.bytes.clone());
            }
            Some(_) => true,
        };
        if expired {
            entries.pop(key);
        }
        None
    }

    /// Insert or replace. Returns true if another key was evicted to make room.
    pub fn insert(&self, key: String, bytes: Vec<u8>, ttl: Duration) -> bool {
        if self.capacity == 0 || ttl.is_zero() {
            self.remove(&key);
            return false;
        }
        let now = Instant::now();
        let entry = FastEntry {
            bytes,
            inserted_at: now,
            ttl,
            last_access: now,
        };
        let mut entries = self.entries.lock();
        match entries.push(key.clone(), entry) {
            Some((evicted, _)) => evicted != key,
            None => false,
        }
    }

    /// Insert only if no live entry holds `key`, checked and written under
    /// one lock. Returns `None` when a live entry was kept, otherwise whether
    /// another key was evicted.
    pub fn insert_if_absent(&self, key: String, bytes: Vec<u8>, ttl: Duration) -> Option<bool> {
        if self.capacity == 0 || ttl.is_zero() {
            return Some(false);
        }
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if entries.peek(&key).is_some_and(|e| !e.is_expired(now)) {
            return None;
        }
        let entry = FastEntry {
            bytes,
            inserted_at: now,
            ttl,
            last_access: now,
        };
        Some(match entries.push(key.clone(), entry) {
            Some((evicted, _)) => evicted != key,
            None => false,
        })
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.lock().pop(key).is_some()
    }

    /// True if a live entry exists. Does not affect recency.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .lock()
            .peek(key)
            .is_some_and(|e| !e.is_expired(now))
    }

    /// Restart the entry's TTL clock with `ttl`.
    pub fn expire(&self, key: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.peek_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.inserted_at = now;
                entry.ttl = ttl;
                true
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn metadata(&self, key: &str) -> Option<EntryMetadata> {
        let now = Instant::now();
        self.entries
            .lock()
            .peek(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| EntryMetadata {
                inserted_at: e.inserted_at,
                ttl: e.ttl,
                last_access: e.last_access,
            })
    }

    /// Remove every key matching a Redis-style glob. Returns the live entries removed.
    pub fn remove_matching(&self, pattern: &str) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(k, _)| glob_match(pattern, k))
            .map(|(k, _)| k.clone())
            .collect();
        doomed
            .iter()
            .filter_map(|k| entries.pop(k))
            .filter(|e| !e.is_expired(now))
            .count()
    }

    /// Entry count, including entries that expired but were not yet dropped.
    #[must_use]
    pub fn len(&self) -> usize {
        if self.capacity == 0 {
            return 0;
        }
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let tier = FastTier::new(4);
        tier.insert("a".into(), b"1".to_vec(), Duration::from_secs(10));
        assert_eq!(tier.get("a"), Some(b"1".to_vec()));
        assert!(tier.remove("a"));
        assert!(!tier.remove("a"));
        assert_eq!(tier.get("a"), None);
    }

    #[test]
    fn test_capacity_is_never_exceeded() {
        let tier = FastTier::new(3);
        let mut evictions = 0;
        for i in 0..10 {
            if tier.insert(format!("k{i}"), vec![i], Duration::from_secs(10)) {
                evictions += 1;
            }
            assert!(tier.len() <= 3);
        }
        assert_eq!(evictions, 7);
        // Most recent survive
        assert!(tier.contains("k9"));
        assert!(!tier.contains("k0"));
    }

    #[test]
    fn test_lru_order_respects_reads() {
        let tier = FastTier::new(2);
        tier.insert("a".into(), vec![1], Duration::from_secs(10));
        tier.insert("b".into(), vec![2], Duration::from_secs(10));
        tier.get("a");
        tier.insert("c".into(), vec![3], Duration::from_secs(10));
        assert!(tier.contains("a"));
        assert!(!tier.contains("b"));
    }

    #[test]
    fn test_insert_if_absent_keeps_live_entry() {
        let tier = FastTier::new(4);
        assert_eq!(
            tier.insert_if_absent("a".into(), vec![1], Duration::from_secs(10)),
            Some(false)
        );
        assert_eq!(tier.insert_if_absent("a".into(), vec![2], Duration::from_secs(10)), None);
        assert_eq!(tier.get("a"), Some(vec![1]));
    }

    #[test]
    fn test_replacing_key_is_not_an_eviction() {
        let tier = FastTier::new(1);
        assert!(!tier.insert("a".into(), vec![1], Duration::from_secs(10)));
        assert!(!tier.insert("a".into(), vec![2], Duration::from_secs(10)));
        assert_eq!(tier.get("a"), Some(vec![2]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_and_expire() {
        let tier = FastTier::new(4);
        tier.insert("a".into(), vec![1], Duration::from_secs(5));
        tier.insert("b".into(), vec![2], Duration::from_secs(5));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(tier.expire("b", Duration::from_secs(10)));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(tier.get("a"), None);
        assert_eq!(tier.get("b"), Some(vec![2]));
        assert_eq!(tier.metadata("b").unwrap().ttl, Duration::from_secs(10));
    }

    #[test]
    fn test_remove_matching() {
        let tier = FastTier::new(10);
        for key in ["p:device:1", "p:device:2", "p:reading:1", "q:device:1"] {
            tier.insert(key.into(), vec![0], Duration::from_secs(10));
        }
        assert_eq!(tier.remove_matching("p:device:*"), 2);
        assert!(tier.contains("p:reading:1"));
        assert!(tier.contains("q:device:1"));
    }

    #[test]
    fn test_zero_capacity_disables_tier() {
        let tier = FastTier::new(0);
        tier.insert("a".into(), vec![1], Duration::from_secs(10));
        assert_eq!(tier.get("a"), None);
        assert_eq!(tier.len(), 0);
    }
}
