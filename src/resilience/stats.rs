// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Process-wide retry statistics.
//!
//! Counters are plain atomics; the per-operation map is a `DashMap`. One
//! execution updates its counters in a single call, and [`RetryStats::snapshot`]
//! reads every counter once.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
struct OperationCounters {
    attempts: AtomicU64,
    successes: AtomicU64,
}

#[derive(Debug, Default)]
pub struct RetryStats {
    total_attempts: AtomicU64,
    successful_attempts: AtomicU64,
    failed_attempts: AtomicU64,
    total_delay_us: AtomicU64,
    operations: DashMap<String, OperationCounters>,
}

/// Per-operation counters in a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OperationStats {
    pub attempts: u64,
    pub successes: u64,
}

/// Point-in-time copy of [`RetryStats`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetryStatsSnapshot {
    pub total_attempts: u64,
    /// Executions that eventually succeeded
    pub successful_attempts: u64,
    /// Executions that ended in a terminal error
    pub failed_attempts: u64,
    pub total_delay: Duration,
    pub operations: BTreeMap<String, OperationStats>,
}

impl RetryStatsSnapshot {
    /// Share of finished executions that failed (0.0 - 1.0).
    #[must_use]
    pub fn failure_ratio(&self) -> f64 {
        let finished = self.successful_attempts + self.failed_attempts;
        if finished == 0 {
            return 0.0;
        }
        self.failed_attempts as f64 / finished as f64
    }
}

impl RetryStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// An execution of `operation` succeeded after `attempts` attempts.
    pub fn record_success(&self, operation: &str, attempts: u32) {
        let attempts = u64::from(attempts);
        self.total_attempts.fetch_add(attempts, Ordering::Relaxed);
        self.successful_attempts.fetch_add(1, Ordering::Relaxed);
        let entry = self.operations.entry(operation.to_string()).or_default();
        entry.attempts.fetch_add(attempts, Ordering::Relaxed);
        entry.successes.fetch_add(1, Ordering::Relaxed);
    }

    /// An execution of `operation` gave up after `attempts` attempts.
    pub fn record_failure(&self, operation: &str, attempts: u32) {
        let attempts = u64::from(attempts);
        self.total_attempts.fetch_add(attempts, Ordering::Relaxed);
        self.failed_attempts.fetch_add(1, Ordering::Relaxed);
        let entry = self.operations.entry(operation.to_string()).or_default();
        entry.attempts.fetch_add(attempts, Ordering::Relaxed);
    }

    pub fn record_delay(&self, delay: Duration) {
        let micros = u64::try_from(delay.as_micros()).unwrap_or(u64::MAX);
        self.total_delay_us.fetch_add(micros, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> RetryStatsSnapshot {
        let operations = self
            .operations
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    OperationStats {
                        attempts: entry.value().attempts.load(Ordering::Relaxed),
                        successes: entry.value().successes.load(Ordering::Relaxed),
                    },
                )
            })
            .collect();
        RetryStatsSnapshot {
            total_attempts: self.total_attempts.load(Ordering::Relaxed),
            successful_attempts: self.successful_attempts.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
            total_delay: Duration::from_micros(self.total_delay_us.load(Ordering::Relaxed)),
            operations,
        }
    }

    /// Zero every counter. Only the owning engine may do this.
    pub(crate) fn reset(&self) {
        self.total_attempts.store(0, Ordering::Relaxed);
        self.successful_attempts.store(0, Ordering::Relaxed);
        self.failed_attempts.store(0, Ordering::Relaxed);
        self.total_delay_us.store(0, Ordering::Relaxed);
        self.operations.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_and_failure_accounting() {
        let stats = RetryStats::new();
        stats.record_success("read_plug", 3);
        stats.record_failure("read_plug", 5);
        stats.record_success("write_export", 1);
        stats.record_delay(Duration::from_millis(30));

        let snap = stats.snapshot();
        assert_eq!(snap.total_attempts, 9);
        assert_eq!(snap.successful_attempts, 2);
        assert_eq!(snap.failed_attempts, 1);
        assert_eq!(snap.total_delay, Duration::from_millis(30));
        assert_eq!(
            snap.operations["read_plug"],
            OperationStats { attempts: 8, successes: 1 }
        );
        assert_eq!(
            snap.operations["write_export"],
            OperationStats { attempts: 1, successes: 1 }
        );
        assert!((snap.failure_ratio() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_reset() {
        let stats = RetryStats::new();
        stats.record_success("op", 2);
        stats.reset();
        assert_eq!(stats.snapshot(), RetryStatsSnapshot::default());
    }
}
