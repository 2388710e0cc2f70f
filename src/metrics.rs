// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the substrate.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `substrate_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//! - `_bytes` suffix for sizes
//!
//! # Labels
//! - `tier`: fast, shared
//! - `operation`: caller-supplied retry operation name
//! - `status` / `outcome`: success, error, rejected, timeout

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

// ═══════════════════════════════════════════════════════════════════════════
// RETRY
// ═══════════════════════════════════════════════════════════════════════════

/// Record one attempt of a retried operation
pub fn record_retry_attempt(operation: &str, outcome: &str) {
    counter!(
        "substrate_retry_attempts_total",
        "operation" => operation.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a backoff sleep taken between attempts
pub fn record_retry_delay(operation: &str, delay: Duration) {
    histogram!(
        "substrate_retry_delay_seconds",
        "operation" => operation.to_string()
    )
    .record(delay.as_secs_f64());
}

/// Record an operation that gave up, labelled with the final error kind
pub fn record_retry_exhausted(operation: &str, kind: &str) {
    counter!(
        "substrate_retry_exhausted_total",
        "operation" => operation.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// CACHE
// ═══════════════════════════════════════════════════════════════════════════

/// Record a cache lookup result (`hit` / `miss`) per tier
pub fn record_cache_lookup(tier: &str, result: &str) {
    counter!(
        "substrate_cache_lookups_total",
        "tier" => tier.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

/// Record a cache operation that degraded because of a backend failure
pub fn record_cache_error(tier: &str, operation: &str) {
    counter!(
        "substrate_cache_errors_total",
        "tier" => tier.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record cache operation latency
pub fn record_cache_latency(tier: &str, operation: &str, duration: Duration) {
    histogram!(
        "substrate_cache_operation_seconds",
        "tier" => tier.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record fast-tier capacity evictions
pub fn record_cache_eviction(count: usize) {
    counter!("substrate_cache_evictions_total").increment(count as u64);
}

/// Set current fast-tier entry count
pub fn set_fast_cache_entries(count: usize) {
    gauge!("substrate_cache_fast_entries").set(count as f64);
}

/// Set circuit breaker state (0=closed, 1=half-open, 2=open)
pub fn set_circuit_state(circuit: &str, state: u8) {
    gauge!(
        "substrate_circuit_breaker_state",
        "circuit" => circuit.to_string()
    )
    .set(f64::from(state));
}

/// Record a call routed through a circuit breaker
pub fn record_circuit_call(circuit: &str, outcome: &str) {
    counter!(
        "substrate_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// POOL
// ═══════════════════════════════════════════════════════════════════════════

/// Record an acquire attempt (`success`, `timeout`, `cancelled`, `closed`, `error`)
pub fn record_pool_acquire(status: &str) {
    counter!(
        "substrate_pool_acquires_total",
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record how long an acquire waited for a connection
pub fn record_pool_wait(duration: Duration) {
    histogram!("substrate_pool_wait_seconds").record(duration.as_secs_f64());
}

/// Record a connection lifecycle event (`created`, `destroyed`, `failed`, `probe_failed`)
pub fn record_pool_connection_event(event: &str) {
    counter!(
        "substrate_pool_connection_events_total",
        "event" => event.to_string()
    )
    .increment(1);
}

/// Set pool occupancy per state (`idle`, `active`, `overflow`)
pub fn set_pool_connections(state: &str, count: usize) {
    gauge!(
        "substrate_pool_connections",
        "state" => state.to_string()
    )
    .set(count as f64);
}

/// Set the nominal pool size after an optimize pass
pub fn set_pool_size(size: usize) {
    gauge!("substrate_pool_size").set(size as f64);
}

/// Set pool health (0=healthy, 1=degraded, 2=unhealthy)
pub fn set_pool_health(status: u8) {
    gauge!("substrate_pool_health").set(f64::from(status));
}

/// Record an optimize pass, labelled by trigger (`manual`, `monitor`)
pub fn record_pool_optimize(trigger: &str) {
    counter!(
        "substrate_pool_optimize_total",
        "trigger" => trigger.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// RETENTION
// ═══════════════════════════════════════════════════════════════════════════

/// Record a scheduler job run (`daily`, `storage_check`, `emergency`, `reconcile`)
pub fn record_retention_run(job: &str, success: bool) {
    counter!(
        "substrate_retention_runs_total",
        "job" => job.to_string(),
        "status" => if success { "success" } else { "error" }
    )
    .increment(1);
}

/// Record deleted artifacts and reclaimed bytes
pub fn record_retention_deleted(count: usize, bytes: u64) {
    counter!("substrate_retention_deleted_total").increment(count as u64);
    counter!("substrate_retention_reclaimed_bytes_total").increment(bytes);
}

/// Record artifacts flagged as expiring soon
pub fn record_retention_marked(count: usize) {
    counter!("substrate_retention_marked_total").increment(count as u64);
}

/// Record a per-artifact failure during a job
pub fn record_retention_error(job: &str) {
    counter!(
        "substrate_retention_errors_total",
        "job" => job.to_string()
    )
    .increment(1);
}

/// Set last observed free space on the artifact volume
pub fn set_free_space_bytes(bytes: u64) {
    gauge!("substrate_retention_free_space_bytes").set(bytes as f64);
}

/// Set storage level (0=ok, 1=warning, 2=emergency)
pub fn set_storage_level(level: u8) {
    gauge!("substrate_retention_storage_level").set(f64::from(level));
}

/// Record job duration
pub fn record_retention_duration(job: &str, duration: Duration) {
    histogram!(
        "substrate_retention_job_seconds",
        "job" => job.to_string()
    )
    .record(duration.as_secs_f64());
}

/// A timing guard that records cache latency on drop
pub struct LatencyTimer {
    tier: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(tier: &'static str, operation: &'static str) -> Self {
        Self {
            tier,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_cache_latency(self.tier, self.operation, self.start.elapsed());
    }
}
