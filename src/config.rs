// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the reliability substrate.
//!
//! Every tunable lives here; leaf components receive their section by value
//! and never read the environment. Configuration can be built in code, from
//! any serde source, or from the flat dotted-key map used by deployments.
//!
//! # Example
//!
//! ```
//! use telemetry_substrate::SubstrateConfig;
//! use serde_json::json;
//!
//! // Defaults
//! let config = SubstrateConfig::default();
//! assert_eq!(config.pool.size, 10);
//! assert_eq!(config.retention.cleanup_hour, 2);
//!
//! // Flat overrides
//! let config = SubstrateConfig::from_flat_map([
//!     ("pool.size".to_string(), json!(4)),
//!     ("cache.prefix".to_string(), json!("plugs:")),
//!     ("retention.rules.csv".to_string(), json!("14")),
//! ]).unwrap();
//! assert_eq!(config.pool.size, 4);
//! assert_eq!(config.cache.prefix, "plugs:");
//! assert_eq!(config.retention.rules["csv"], 14);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::resilience::policy::{BackoffStrategy, RetryPolicy};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration key '{0}'")]
    InvalidKey(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Root configuration. One section per component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubstrateConfig {
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

impl SubstrateConfig {
    /// Build a config from dotted keys (`pool.size`, `retention.rules.csv`, ...).
    ///
    /// String values are coerced to the type of the field they land on, so
    /// maps read from key/value stores work unchanged. Unknown keys are rejected.
    pub fn from_flat_map<I>(entries: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        // Start from defaults so map-valued keys merge instead of replacing
        let mut root = serde_json::to_value(Self::default())
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        for (key, value) in entries {
            insert_dotted(&mut root, &key, value)?;
        }
        let config: Self =
            serde_json::from_value(root).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply a single dotted-key override on top of this config.
    pub fn apply_flat(&mut self, key: &str, value: Value) -> Result<(), ConfigError> {
        let mut root =
            serde_json::to_value(&*self).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        insert_dotted(&mut root, key, value)?;
        let updated: Self =
            serde_json::from_value(root).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// Cross-field checks that serde defaults can't express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // An empty prefix would make `clear()` match every shared key
        if self.cache.prefix.trim().is_empty() {
            return Err(ConfigError::Invalid("cache.prefix must not be empty".into()));
        }
        let pool = &self.pool;
        if pool.min_size > pool.max_size {
            return Err(ConfigError::Invalid(format!(
                "pool.min_size ({}) exceeds pool.max_size ({})",
                pool.min_size, pool.max_size
            )));
        }
        if pool.size > pool.max_size {
            return Err(ConfigError::Invalid(format!(
                "pool.size ({}) exceeds pool.max_size ({})",
                pool.size, pool.max_size
            )));
        }
        if pool.acquire_timeout_s < 0.0 {
            return Err(ConfigError::Invalid("pool.acquire_timeout_s must be >= 0".into()));
        }
        let retention = &self.retention;
        if retention.cleanup_hour > 23 {
            return Err(ConfigError::Invalid(format!(
                "retention.cleanup_hour must be 0-23, got {}",
                retention.cleanup_hour
            )));
        }
        if retention.emergency_free_mb >= retention.warning_free_mb {
            return Err(ConfigError::Invalid(
                "retention.emergency_free_mb must be below retention.warning_free_mb".into(),
            ));
        }
        if retention.business_hours_start >= retention.business_hours_end
            || retention.business_hours_end > 24
        {
            return Err(ConfigError::Invalid(
                "business hours window is empty or out of range".into(),
            ));
        }
        if retention.utc_offset_minutes.abs() >= 24 * 60 {
            return Err(ConfigError::Invalid("retention.utc_offset_minutes out of range".into()));
        }
        if retention.batch_size == 0 {
            return Err(ConfigError::Invalid("retention.batch_size must be positive".into()));
        }
        for (name, overrides) in [
            ("database", &self.retry.database),
            ("network", &self.retry.network),
            ("file_op", &self.retry.file_op),
        ] {
            if overrides.max_attempts == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "retry.{name}.max_attempts must be positive"
                )));
            }
            if overrides.backoff_factor.is_some_and(|f| f <= 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "retry.{name}.backoff_factor must be positive"
                )));
            }
        }
        Ok(())
    }
}

/// Coerce a string to the JSON type already at the target field.
///
/// Fields with no typed default (`None` options, new map entries) fall back
/// to guessing from the text.
fn coerce(existing: Option<&Value>, value: Value) -> Value {
    let Value::String(s) = &value else {
        return value;
    };
    let trimmed = s.trim();
    match existing {
        Some(Value::String(_)) => value,
        Some(Value::Number(_)) => parse_number(trimmed).unwrap_or(value),
        Some(Value::Bool(_)) => parse_bool(trimmed).unwrap_or(value),
        _ => parse_number(trimmed)
            .or_else(|| parse_bool(trimmed))
            .unwrap_or(value),
    }
}

fn parse_number(text: &str) -> Option<Value> {
    if let Ok(n) = text.parse::<i64>() {
        return Some(Value::from(n));
    }
    text.parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .map(Value::from)
}

fn parse_bool(text: &str) -> Option<Value> {
    match text {
        "true" => Some(Value::Bool(true)),
        "false" => Some(Value::Bool(false)),
        _ => None,
    }
}

fn insert_dotted(root: &mut Value, key: &str, value: Value) -> Result<(), ConfigError> {
    let segments: Vec<&str> = key.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(ConfigError::InvalidKey(key.to_string()));
    }
    let (leaf, parents) = segments
        .split_last()
        .ok_or_else(|| ConfigError::InvalidKey(key.to_string()))?;

    let mut node = root;
    for segment in parents {
        let map = node
            .as_object_mut()
            .ok_or_else(|| ConfigError::InvalidKey(key.to_string()))?;
        node = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    let map = node
        .as_object_mut()
        .ok_or_else(|| ConfigError::InvalidKey(key.to_string()))?;
    let value = coerce(map.get(*leaf), value);
    map.insert(leaf.to_string(), value);
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// RETRY
// ═══════════════════════════════════════════════════════════════════════════

/// Overrides for the predefined retry policies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default)]
    pub database: RetryOverrides,
    #[serde(default)]
    pub network: RetryOverrides,
    #[serde(default)]
    pub file_op: RetryOverrides,
    /// Extra multiplier applied to backoff after a pool-exhausted failure
    #[serde(default = "default_pool_exhausted_multiplier")]
    pub pool_exhausted_multiplier: f64,
}

/// Per-field overrides; `None` keeps the preset value. Delays are seconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_delay: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_factor: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<BackoffStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_failures: Option<bool>,
}

fn default_pool_exhausted_multiplier() -> f64 { 2.0 }

impl RetryConfig {
    #[must_use]
    pub fn database_policy(&self) -> RetryPolicy {
        RetryPolicy::database().with_overrides(&self.database, self.pool_exhausted_multiplier)
    }

    #[must_use]
    pub fn network_policy(&self) -> RetryPolicy {
        RetryPolicy::network().with_overrides(&self.network, self.pool_exhausted_multiplier)
    }

    #[must_use]
    pub fn file_op_policy(&self) -> RetryPolicy {
        RetryPolicy::file_op().with_overrides(&self.file_op, self.pool_exhausted_multiplier)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// CACHE
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Namespace prepended to every key in both tiers
    #[serde(default = "default_cache_prefix")]
    pub prefix: String,
    #[serde(default)]
    pub fast: FastTierConfig,
    #[serde(default)]
    pub shared: SharedTierConfig,
    #[serde(default)]
    pub query_ttl: QueryTtlConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FastTierConfig {
    #[serde(default = "default_fast_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_fast_ttl_s")]
    pub default_ttl_s: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SharedTierConfig {
    /// Redis connection string; `None` runs fast-tier only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default = "default_shared_ttl_s")]
    pub default_ttl_s: u64,
    /// Consecutive shared-tier failures before the breaker opens
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,
    #[serde(default = "default_circuit_recovery_s")]
    pub circuit_recovery_s: u64,
}

/// TTLs picked by the query-cache helper from substrings of the query text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryTtlConfig {
    #[serde(default = "default_device_ttl_s")]
    pub device_s: u64,
    #[serde(default = "default_reading_ttl_s")]
    pub reading_s: u64,
    #[serde(default = "default_aggregate_ttl_s")]
    pub aggregate_s: u64,
    #[serde(default = "default_statistics_ttl_s")]
    pub statistics_s: u64,
    #[serde(default = "default_query_ttl_s")]
    pub default_s: u64,
}

fn default_cache_prefix() -> String { "substrate:".to_string() }
fn default_fast_max_entries() -> usize { 1000 }
fn default_fast_ttl_s() -> u64 { 300 }
fn default_shared_ttl_s() -> u64 { 3600 }
fn default_circuit_failure_threshold() -> u32 { 5 }
fn default_circuit_recovery_s() -> u64 { 30 }
fn default_device_ttl_s() -> u64 { 60 }
fn default_reading_ttl_s() -> u64 { 10 }
fn default_aggregate_ttl_s() -> u64 { 300 }
fn default_statistics_ttl_s() -> u64 { 600 }
fn default_query_ttl_s() -> u64 { 30 }

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            prefix: default_cache_prefix(),
            fast: FastTierConfig::default(),
            shared: SharedTierConfig::default(),
            query_ttl: QueryTtlConfig::default(),
        }
    }
}

impl Default for FastTierConfig {
    fn default() -> Self {
        Self {
            max_entries: default_fast_max_entries(),
            default_ttl_s: default_fast_ttl_s(),
        }
    }
}

impl Default for SharedTierConfig {
    fn default() -> Self {
        Self {
            url: None,
            default_ttl_s: default_shared_ttl_s(),
            circuit_failure_threshold: default_circuit_failure_threshold(),
            circuit_recovery_s: default_circuit_recovery_s(),
        }
    }
}

impl Default for QueryTtlConfig {
    fn default() -> Self {
        Self {
            device_s: default_device_ttl_s(),
            reading_s: default_reading_ttl_s(),
            aggregate_s: default_aggregate_ttl_s(),
            statistics_s: default_statistics_ttl_s(),
            default_s: default_query_ttl_s(),
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub fn fast_ttl(&self) -> Duration {
        Duration::from_secs(self.fast.default_ttl_s)
    }

    #[must_use]
    pub fn shared_ttl(&self) -> Duration {
        Duration::from_secs(self.shared.default_ttl_s)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// POOL
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    /// Database URL for the sqlx connection factory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Nominal pool size
    #[serde(default = "default_pool_size")]
    pub size: usize,
    /// Transient connections allowed above `size`
    #[serde(default = "default_pool_max_overflow")]
    pub max_overflow: usize,
    #[serde(default = "default_pool_acquire_timeout_s")]
    pub acquire_timeout_s: f64,
    /// Connections older than this are destroyed on release
    #[serde(default = "default_pool_recycle_s")]
    pub recycle_s: u64,
    /// Idle time after which a connection is probed before being handed out
    #[serde(default = "default_pool_idle_probe_threshold_s")]
    pub idle_probe_threshold_s: u64,
    /// Error count above which a connection is destroyed on release
    #[serde(default = "default_pool_max_errors")]
    pub max_errors: u32,
    /// Bounds for `optimize()` resizing
    #[serde(default = "default_pool_min_size")]
    pub min_size: usize,
    #[serde(default = "default_pool_max_size")]
    pub max_size: usize,
}

fn default_pool_size() -> usize { 10 }
fn default_pool_max_overflow() -> usize { 20 }
fn default_pool_acquire_timeout_s() -> f64 { 30.0 }
fn default_pool_recycle_s() -> u64 { 3600 }
fn default_pool_idle_probe_threshold_s() -> u64 { 30 }
fn default_pool_max_errors() -> u32 { 3 }
fn default_pool_min_size() -> usize { 2 }
fn default_pool_max_size() -> usize { 50 }

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            url: None,
            size: default_pool_size(),
            max_overflow: default_pool_max_overflow(),
            acquire_timeout_s: default_pool_acquire_timeout_s(),
            recycle_s: default_pool_recycle_s(),
            idle_probe_threshold_s: default_pool_idle_probe_threshold_s(),
            max_errors: default_pool_max_errors(),
            min_size: default_pool_min_size(),
            max_size: default_pool_max_size(),
        }
    }
}

impl PoolConfig {
    #[must_use]
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.acquire_timeout_s)
    }

    #[must_use]
    pub fn recycle_interval(&self) -> Duration {
        Duration::from_secs(self.recycle_s)
    }

    #[must_use]
    pub fn idle_probe_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_probe_threshold_s)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// HEALTH MONITOR
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthConfig {
    #[serde(default = "default_health_check_interval_s")]
    pub check_interval_s: u64,
    #[serde(default = "default_consecutive_failures_to_optimize")]
    pub consecutive_failures_to_optimize: u32,
    /// failed / created ratio above which the pool reports degraded
    #[serde(default = "default_degraded_failure_ratio")]
    pub degraded_failure_ratio: f64,
    /// Retry failure ratio that turns a degraded pool observation into an unhealthy one
    #[serde(default = "default_retry_failure_ratio")]
    pub retry_failure_ratio: f64,
}

fn default_health_check_interval_s() -> u64 { 60 }
fn default_consecutive_failures_to_optimize() -> u32 { 3 }
fn default_degraded_failure_ratio() -> f64 { 0.2 }
fn default_retry_failure_ratio() -> f64 { 0.5 }

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_s: default_health_check_interval_s(),
            consecutive_failures_to_optimize: default_consecutive_failures_to_optimize(),
            degraded_failure_ratio: default_degraded_failure_ratio(),
            retry_failure_ratio: default_retry_failure_ratio(),
        }
    }
}

impl HealthConfig {
    #[must_use]
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_s.max(1))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// RETENTION
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetentionConfig {
    /// Directory holding produced artifacts; its filesystem is watched for free space
    #[serde(default = "default_retention_root")]
    pub root: PathBuf,
    /// Local hour (0-23) of daily maintenance
    #[serde(default = "default_cleanup_hour")]
    pub cleanup_hour: u32,
    /// Storage watch interval inside business hours
    #[serde(default = "default_check_interval_min")]
    pub check_interval_min: u64,
    /// Storage watch interval outside business hours
    #[serde(default = "default_off_hours_interval_min")]
    pub off_hours_interval_min: u64,
    #[serde(default = "default_emergency_free_mb")]
    pub emergency_free_mb: u64,
    #[serde(default = "default_warning_free_mb")]
    pub warning_free_mb: u64,
    /// Retention in days per format tag
    #[serde(default = "default_retention_rules")]
    pub rules: HashMap<String, u64>,
    /// Retention in days for tags without a rule
    #[serde(default = "default_rule_days")]
    pub default_rule_days: u64,
    /// Offset of the local zone from UTC; all schedule hours are in this zone
    #[serde(default)]
    pub utc_offset_minutes: i32,
    #[serde(default = "default_business_hours_start")]
    pub business_hours_start: u32,
    #[serde(default = "default_business_hours_end")]
    pub business_hours_end: u32,
    /// How long before expiry an artifact is flagged expiring_soon
    #[serde(default = "default_expiring_window_h")]
    pub expiring_window_h: u64,
    /// Scheduler wake-up period
    #[serde(default = "default_retention_tick_s")]
    pub tick_s: u64,
    #[serde(default = "default_retention_batch_size")]
    pub batch_size: usize,
    /// Consecutive failed ticks before status turns degraded
    #[serde(default = "default_retention_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_retention_root() -> PathBuf { PathBuf::from("./exports") }
fn default_cleanup_hour() -> u32 { 2 }
fn default_check_interval_min() -> u64 { 60 }
fn default_off_hours_interval_min() -> u64 { 240 }
fn default_emergency_free_mb() -> u64 { 100 }
fn default_warning_free_mb() -> u64 { 500 }
fn default_rule_days() -> u64 { 7 }
fn default_business_hours_start() -> u32 { 8 }
fn default_business_hours_end() -> u32 { 18 }
fn default_expiring_window_h() -> u64 { 24 }
fn default_retention_tick_s() -> u64 { 60 }
fn default_retention_batch_size() -> usize { 50 }
fn default_retention_failure_threshold() -> u32 { 3 }

fn default_retention_rules() -> HashMap<String, u64> {
    HashMap::from([
        ("csv".to_string(), 7),
        ("json".to_string(), 7),
        ("xlsx".to_string(), 30),
        ("pdf".to_string(), 30),
    ])
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            root: default_retention_root(),
            cleanup_hour: default_cleanup_hour(),
            check_interval_min: default_check_interval_min(),
            off_hours_interval_min: default_off_hours_interval_min(),
            emergency_free_mb: default_emergency_free_mb(),
            warning_free_mb: default_warning_free_mb(),
            rules: default_retention_rules(),
            default_rule_days: default_rule_days(),
            utc_offset_minutes: 0,
            business_hours_start: default_business_hours_start(),
            business_hours_end: default_business_hours_end(),
            expiring_window_h: default_expiring_window_h(),
            tick_s: default_retention_tick_s(),
            batch_size: default_retention_batch_size(),
            failure_threshold: default_retention_failure_threshold(),
        }
    }
}

impl RetentionConfig {
    #[must_use]
    pub fn warning_free_bytes(&self) -> u64 {
        self.warning_free_mb * 1024 * 1024
    }

    #[must_use]
    pub fn emergency_free_bytes(&self) -> u64 {
        self.emergency_free_mb * 1024 * 1024
    }

    #[must_use]
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_s.max(1))
    }
}
