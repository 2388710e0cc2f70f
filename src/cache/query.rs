// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Query-result caching keyed on normalized SQL text and parameters.
//!
//! Keys look like `query:{table}:{sha256}` so a write to a table can drop
//! every cached query that reads it with one pattern delete. The TTL comes
//! from the first rule whose marker appears in the query:
//!
//! | Rule       | Markers                                  | Default |
//! |------------|------------------------------------------|---------|
//! | device     | `device`                                 | 60 s    |
//! | reading    | `reading`                                | 10 s    |
//! | aggregate  | `count(`, `sum(`, `avg(`, `min(`, `max(` | 300 s   |
//! | statistics | `statistic`, `stats`                     | 600 s   |
//! | default    |                                          | 30 s    |

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::time::Duration;

use super::tiered::escape_glob;
use super::{CacheError, TieredCache};
use crate::config::QueryTtlConfig;

/// Collapse runs of whitespace so formatting never changes the key.
#[must_use]
pub fn normalize_query(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Ordered TTL rules; first match wins.
#[derive(Debug, Clone)]
pub struct QueryTtlRules {
    rules: Vec<(&'static [&'static str], Duration)>,
    default: Duration,
}

const DEVICE_MARKERS: &[&str] = &["device"];
const READING_MARKERS: &[&str] = &["reading"];
const AGGREGATE_MARKERS: &[&str] = &["count(", "sum(", "avg(", "min(", "max("];
const STATISTICS_MARKERS: &[&str] = &["statistic", "stats"];

impl QueryTtlRules {
    #[must_use]
    pub fn from_config(config: &QueryTtlConfig) -> Self {
        Self {
            rules: vec![
                (DEVICE_MARKERS, Duration::from_secs(config.device_s)),
                (READING_MARKERS, Duration::from_secs(config.reading_s)),
                (AGGREGATE_MARKERS, Duration::from_secs(config.aggregate_s)),
                (STATISTICS_MARKERS, Duration::from_secs(config.statistics_s)),
            ],
            default: Duration::from_secs(config.default_s),
        }
    }

    #[must_use]
    pub fn ttl_for(&self, sql: &str) -> Duration {
        let lowered = normalize_query(sql).to_lowercase();
        // "count (x)" and "count(x)" should hit the same rule
        let compact = lowered.replace(" (", "(");
        self.rules
            .iter()
            .find(|(markers, _)| markers.iter().any(|m| compact.contains(m)))
            .map_or(self.default, |(_, ttl)| *ttl)
    }
}

impl Default for QueryTtlRules {
    fn default() -> Self {
        Self::from_config(&QueryTtlConfig::default())
    }
}

/// Cache key for one (query, params) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryKey {
    pub key: String,
    /// First table named after `FROM`, or `_` if none
    pub table: String,
    pub normalized: String,
}

impl QueryKey {
    pub fn new<P: Serialize + ?Sized>(sql: &str, params: &P) -> Result<Self, CacheError> {
        let normalized = normalize_query(sql);
        let params =
            serde_json::to_vec(params).map_err(|e| CacheError::Serialization(e.to_string()))?;

        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        hasher.update([0u8]);
        hasher.update(&params);
        let digest = hex::encode(hasher.finalize());

        let table = primary_table(&normalized).unwrap_or_else(|| "_".to_string());
        Ok(Self {
            key: format!("query:{table}:{digest}"),
            table,
            normalized,
        })
    }
}

fn primary_table(normalized: &str) -> Option<String> {
    let mut words = normalized.split(' ');
    while let Some(word) = words.next() {
        if word.eq_ignore_ascii_case("from") {
            let raw = words.next()?;
            let table: String = raw
                .trim_matches(|c| matches!(c, '`' | '"' | '[' | ']' | '(' | ')' | ';' | ','))
                .chars()
                .filter(|c| c.is_alphanumeric() || matches!(c, '_' | '.'))
                .collect::<String>()
                .to_lowercase();
            return (!table.is_empty()).then_some(table);
        }
    }
    None
}

impl TieredCache {
    /// TTL the query helper would use for `sql`.
    #[must_use]
    pub fn query_ttl(&self, sql: &str) -> Duration {
        self.query_rules.ttl_for(sql)
    }

    /// Serve a query result from cache, or run `fetch` and cache its result
    /// under the rule-table TTL.
    pub async fn cached_query<T, P, E, F, Fut>(
        &self,
        sql: &str,
        params: &P,
        fetch: F,
    ) -> Result<T, E>
    where
        P: Serialize + ?Sized,
        T: Serialize + DeserializeOwned,
        E: From<CacheError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let key = QueryKey::new(sql, params)?;
        if let Some(hit) = self.get::<T>(&key.key).await {
            return Ok(hit);
        }
        let value = fetch().await?;
        self.set(&key.key, &value, Some(self.query_ttl(sql))).await?;
        Ok(value)
    }

    /// Drop every cached query whose primary table is `table`.
    pub async fn invalidate_table(&self, table: &str) -> usize {
        let pattern = format!("query:{}:*", escape_glob(&table.to_lowercase()));
        self.delete_pattern(&pattern).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::error::SubstrateError;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_normalize() {
        assert_eq!(
            normalize_query("SELECT *\n   FROM  devices\tWHERE id = ?"),
            "SELECT * FROM devices WHERE id = ?"
        );
    }

    #[test]
    fn test_ttl_rules_first_match_wins() {
        let rules = QueryTtlRules::default();
        assert_eq!(rules.ttl_for("SELECT * FROM devices"), Duration::from_secs(60));
        assert_eq!(rules.ttl_for("SELECT * FROM readings"), Duration::from_secs(10));
        assert_eq!(rules.ttl_for("SELECT AVG (watts) FROM samples"), Duration::from_secs(300));
        assert_eq!(rules.ttl_for("SELECT * FROM plug_statistics"), Duration::from_secs(600));
        assert_eq!(rules.ttl_for("SELECT * FROM users"), Duration::from_secs(30));
        // device precedes aggregate
        assert_eq!(rules.ttl_for("SELECT COUNT(*) FROM devices"), Duration::from_secs(60));
    }

    #[test]
    fn test_ttl_rules_are_configurable() {
        let config = QueryTtlConfig { reading_s: 2, ..QueryTtlConfig::default() };
        let rules = QueryTtlRules::from_config(&config);
        assert_eq!(rules.ttl_for("select * from readings"), Duration::from_secs(2));
    }

    #[test]
    fn test_query_key_stability() {
        let a = QueryKey::new("SELECT * FROM devices WHERE id = ?", &json!([1])).unwrap();
        let b = QueryKey::new("SELECT *  FROM devices\nWHERE id = ?", &json!([1])).unwrap();
        let c = QueryKey::new("SELECT * FROM devices WHERE id = ?", &json!([2])).unwrap();
        assert_eq!(a, b);
        assert_ne!(a.key, c.key);
        assert_eq!(a.table, "devices");
        assert!(a.key.starts_with("query:devices:"));
    }

    #[test]
    fn test_primary_table_extraction() {
        assert_eq!(primary_table("select 1"), None);
        assert_eq!(primary_table("SELECT * FROM `Readings` r"), Some("readings".into()));
        assert_eq!(primary_table("select * from main.devices;"), Some("main.devices".into()));
    }

    #[tokio::test]
    async fn test_cached_query_and_invalidate_table() {
        let cache = TieredCache::new(&CacheConfig::default(), None);
        let runs = AtomicUsize::new(0);
        let sql = "SELECT name FROM devices WHERE id = ?";

        for _ in 0..3 {
            let name: String = cache
                .cached_query(sql, &[42], || async {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, SubstrateError>("kettle".to_string())
                })
                .await
                .unwrap();
            assert_eq!(name, "kettle");
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        assert_eq!(cache.invalidate_table("devices").await, 1);
        let _: String = cache
            .cached_query(sql, &[42], || async {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok::<_, SubstrateError>("kettle".to_string())
            })
            .await
            .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
