// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Background pool health monitor.
//!
//! Every check interval the monitor runs [`ConnectionPool::health_check`] and
//! reads the retry statistics. A degraded pool whose retry failure ratio
//! since the previous observation is at or above `retry_failure_ratio` counts
//! as unhealthy. After `consecutive_failures_to_optimize` unhealthy
//! observations in a row the monitor calls `optimize()` and starts counting
//! again.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{ConnectionFactory, ConnectionPool, HealthReport, HealthStatus};
use crate::config::HealthConfig;
use crate::resilience::RetryEngine;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorReport {
    /// Pool status, escalated by retry failures
    pub status: HealthStatus,
    pub pool: HealthReport,
    /// Failed over finished retry executions since the previous observation
    pub retry_failure_ratio: f64,
    pub consecutive_unhealthy: u32,
    pub optimized: bool,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MonitorState {
    consecutive_unhealthy: u32,
    /// (successful, failed) executions at the previous observation
    last_retry: (u64, u64),
    last_report: Option<MonitorReport>,
    optimizations: u64,
}

pub struct HealthMonitor<F: ConnectionFactory> {
    pool: ConnectionPool<F>,
    retry: RetryEngine,
    config: HealthConfig,
    state: Mutex<MonitorState>,
    /// Serializes observations
    checking: tokio::sync::Mutex<()>,
}

impl<F: ConnectionFactory> HealthMonitor<F> {
    pub fn new(pool: ConnectionPool<F>, retry: RetryEngine, config: HealthConfig) -> Self {
        pool.set_degraded_ratio(config.degraded_failure_ratio);
        Self {
            pool,
            retry,
            config,
            state: Mutex::new(MonitorState::default()),
            checking: tokio::sync::Mutex::new(()),
        }
    }

    /// Run the monitor loop until `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    #[tracing::instrument(skip_all)]
    async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.check_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        interval.tick().await;
        info!(interval_s = self.config.check_interval().as_secs(), "Health monitor running");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.observe_once().await;
                }
            }
        }
        info!("Health monitor stopped");
    }

    /// One observation. Triggers `optimize()` when the unhealthy streak is long enough.
    pub async fn observe_once(&self) -> MonitorReport {
        let _guard = self.checking.lock().await;

        let pool = self.pool.health_check().await;
        let retry = self.retry.stats();

        let (retry_failure_ratio, escalate) = {
            let mut state = self.state.lock();
            let (prev_ok, prev_failed) = state.last_retry;
            // A reset moves the counters backwards; start a fresh window
            let (ok, failed) = if retry.successful_attempts < prev_ok
                || retry.failed_attempts < prev_failed
            {
                (retry.successful_attempts, retry.failed_attempts)
            } else {
                (
                    retry.successful_attempts - prev_ok,
                    retry.failed_attempts - prev_failed,
                )
            };
            state.last_retry = (retry.successful_attempts, retry.failed_attempts);
            let finished = ok + failed;
            let ratio = if finished == 0 {
                0.0
            } else {
                failed as f64 / finished as f64
            };
            (ratio, finished > 0 && ratio >= self.config.retry_failure_ratio)
        };

        let status = match pool.status {
            HealthStatus::Degraded if escalate => HealthStatus::Unhealthy,
            other => other,
        };

        let consecutive = {
            let mut state = self.state.lock();
            state.consecutive_unhealthy = if status == HealthStatus::Unhealthy {
                state.consecutive_unhealthy + 1
            } else {
                0
            };
            state.consecutive_unhealthy
        };

        let optimized = consecutive >= self.config.consecutive_failures_to_optimize;
        if optimized {
            warn!(consecutive, "Pool unhealthy repeatedly, optimizing");
            self.pool.optimize_for("monitor").await;
        }

        let report = {
            let mut state = self.state.lock();
            if optimized {
                state.consecutive_unhealthy = 0;
                state.optimizations += 1;
            }
            let report = MonitorReport {
                status,
                pool,
                retry_failure_ratio,
                consecutive_unhealthy: consecutive,
                optimized,
                observed_at: Utc::now(),
            };
            state.last_report = Some(report.clone());
            report
        };

        crate::metrics::set_pool_health(report.status.as_u8());
        report
    }

    /// The most recent observation.
    #[must_use]
    pub fn report(&self) -> Option<MonitorReport> {
        self.state.lock().last_report.clone()
    }

    #[must_use]
    pub fn consecutive_unhealthy(&self) -> u32 {
        self.state.lock().consecutive_unhealthy
    }

    #[must_use]
    pub fn optimizations(&self) -> u64 {
        self.state.lock().optimizations
    }

    #[must_use]
    pub fn pool(&self) -> &ConnectionPool<F> {
        &self.pool
    }
}
