// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The connection pool.
//!
//! One mutex guards the idle set, the waiter queue, and all counters. It is
//! never held across an await: factory calls happen outside the lock against
//! a reservation taken inside it.
//!
//! Capacity accounting counts three groups: leased connections, idle
//! connections, and *pending* ones (being created, probed, or retired by
//! maintenance). Together they never exceed `size + max_overflow`.
//!
//! # Example
//!
//! ```
//! use telemetry_substrate::config::PoolConfig;
//! use telemetry_substrate::pool::{ConnectionFactory, ConnectionPool, PoolError};
//!
//! struct Loopback;
//!
//! #[async_trait::async_trait]
//! impl ConnectionFactory for Loopback {
//!     type Connection = String;
//!     async fn create(&self) -> Result<String, PoolError> { Ok("conn".into()) }
//!     async fn destroy(&self, _conn: String) {}
//!     async fn probe(&self, _conn: &mut String) -> bool { true }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let pool = ConnectionPool::new(Loopback, &PoolConfig::default());
//! {
//!     let conn = pool.acquire().await.unwrap();
//!     assert_eq!(conn.as_str(), "conn");
//!     assert_eq!(pool.stats().active, 1);
//! }
//! assert_eq!(pool.stats().idle, 1);
//! # }
//! ```

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ConnectionFactory, PoolError};
use crate::config::PoolConfig;

/// failed / created ratio above which `health_check` reports degraded.
pub const DEFAULT_DEGRADED_RATIO: f64 = 0.2;

struct Slot<C> {
    conn: C,
    created_at: Instant,
    last_used: Instant,
    error_count: u32,
    overflow: bool,
}

impl<C> Slot<C> {
    fn new(conn: C, overflow: bool) -> Self {
        let now = Instant::now();
        Self {
            conn,
            created_at: now,
            last_used: now,
            error_count: 0,
            overflow,
        }
    }
}

/// What a queued acquirer is handed.
enum Grant<C> {
    Ready(Slot<C>),
    /// Capacity was reserved; the acquirer creates the connection itself
    Create { overflow: bool },
}

struct Waiter<C> {
    id: u64,
    tx: oneshot::Sender<Grant<C>>,
}

struct Settings {
    max_overflow: usize,
    acquire_timeout: Duration,
    recycle_interval: Duration,
    idle_probe_threshold: Duration,
    max_errors: u32,
    min_size: usize,
    max_size: usize,
}

struct PoolState<C> {
    idle: VecDeque<Slot<C>>,
    leased: usize,
    pending: usize,
    /// Overflow connections leased or being created
    overflow_open: usize,
    size: usize,
    waiters: VecDeque<Waiter<C>>,
    next_waiter: u64,
    closed: bool,
    total_created: u64,
    total_failed: u64,
    peak_active: usize,
    // Observation window, reset by health_check
    window_created: u64,
    window_failed: u64,
    last_error: Option<String>,
    degraded_ratio: f64,
}

impl<C> PoolState<C> {
    fn regular_open(&self) -> usize {
        (self.leased + self.pending + self.idle.len()).saturating_sub(self.overflow_open)
    }

    fn lease(&mut self) {
        self.leased += 1;
        self.peak_active = self.peak_active.max(self.leased);
    }

    /// Reserve room for one new connection. `Some(true)` means overflow.
    fn reserve(&mut self, max_overflow: usize) -> Option<bool> {
        if self.regular_open() < self.size {
            self.pending += 1;
            Some(false)
        } else if self.overflow_open < max_overflow {
            self.pending += 1;
            self.overflow_open += 1;
            Some(true)
        } else {
            None
        }
    }

    fn unreserve(&mut self, overflow: bool) {
        self.pending = self.pending.saturating_sub(1);
        if overflow {
            self.overflow_open = self.overflow_open.saturating_sub(1);
        }
    }

    fn note_failure(&mut self, error: &str) {
        self.total_failed += 1;
        self.window_failed += 1;
        self.last_error = Some(error.to_string());
    }

    fn note_created(&mut self) {
        self.total_created += 1;
        self.window_created += 1;
    }

    /// Hand idle connections or fresh reservations to queued acquirers, oldest first.
    fn serve_waiters(&mut self, max_overflow: usize) {
        if self.closed {
            return;
        }
        while !self.waiters.is_empty() {
            let grant = if let Some(slot) = self.idle.pop_back() {
                self.lease();
                Grant::Ready(slot)
            } else if let Some(overflow) = self.reserve(max_overflow) {
                Grant::Create { overflow }
            } else {
                break;
            };
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            // Receiver gone: take the grant back and try the next waiter
            if let Err(grant) = waiter.tx.send(grant) {
                match grant {
                    Grant::Ready(slot) => {
                        self.leased -= 1;
                        self.idle.push_back(slot);
                    }
                    Grant::Create { overflow } => self.unreserve(overflow),
                }
            }
        }
    }

    fn waiting(&self) -> usize {
        self.waiters.iter().filter(|w| !w.tx.is_closed()).count()
    }

    fn publish(&self) {
        crate::metrics::set_pool_connections("idle", self.idle.len());
        crate::metrics::set_pool_connections("active", self.leased);
        crate::metrics::set_pool_connections("overflow", self.overflow_open);
    }
}

struct PoolInner<F: ConnectionFactory> {
    factory: F,
    settings: Settings,
    state: Mutex<PoolState<F::Connection>>,
}

impl<F: ConnectionFactory> PoolInner<F> {
    /// Return a leased connection, destroying it if it should not be reused.
    fn checkin(self: &Arc<Self>, mut slot: Slot<F::Connection>, broken: bool) {
        let doomed = {
            let mut state = self.state.lock();
            state.leased = state.leased.saturating_sub(1);
            let reason = if state.closed {
                Some("closed")
            } else if slot.overflow {
                Some("overflow")
            } else if broken {
                Some("broken")
            } else if slot.created_at.elapsed() > self.settings.recycle_interval {
                Some("recycled")
            } else if slot.error_count > self.settings.max_errors {
                Some("errors")
            } else if state.regular_open() >= state.size {
                Some("oversize")
            } else {
                None
            };
            let doomed = match reason {
                Some(reason) => {
                    if slot.overflow {
                        state.overflow_open = state.overflow_open.saturating_sub(1);
                    }
                    Some((slot, reason))
                }
                None => {
                    slot.last_used = Instant::now();
                    state.idle.push_back(slot);
                    None
                }
            };
            state.serve_waiters(self.settings.max_overflow);
            state.publish();
            doomed
        };

        if let Some((slot, reason)) = doomed {
            debug!(reason, "Destroying connection on release");
            self.destroy_later(slot.conn);
        }
    }

    /// Give back connections borrowed by maintenance. `taken` counts every
    /// slot that was borrowed, including ones already destroyed.
    fn restore(self: &Arc<Self>, taken: usize, keep: Vec<Slot<F::Connection>>) {
        let mut doomed = Vec::new();
        {
            let mut state = self.state.lock();
            state.pending = state.pending.saturating_sub(taken);
            for slot in keep {
                if state.closed || state.regular_open() >= state.size {
                    doomed.push(slot);
                } else {
                    state.idle.push_back(slot);
                }
            }
            state.serve_waiters(self.settings.max_overflow);
            state.publish();
        }
        for slot in doomed {
            self.destroy_later(slot.conn);
        }
    }

    fn cancel_reservation(&self, overflow: bool, error: Option<&PoolError>) {
        let mut state = self.state.lock();
        state.unreserve(overflow);
        if let Some(error) = error {
            state.note_failure(&error.to_string());
        }
        state.serve_waiters(self.settings.max_overflow);
        state.publish();
    }

    fn destroy_later(self: &Arc<Self>, conn: F::Connection) {
        crate::metrics::record_pool_connection_event("destroyed");
        // Outside a runtime the connection is simply dropped
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let inner = Arc::clone(self);
            handle.spawn(async move {
                inner.factory.destroy(conn).await;
            });
        }
    }
}

/// Capacity reserved for a connection being created. Released on drop
/// unless the connection was created.
struct Reservation<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
    overflow: bool,
    armed: bool,
}

impl<F: ConnectionFactory> Reservation<F> {
    fn complete(mut self, conn: F::Connection) -> PooledConnection<F> {
        self.armed = false;
        {
            let mut state = self.inner.state.lock();
            state.pending = state.pending.saturating_sub(1);
            state.lease();
            state.note_created();
            state.publish();
        }
        crate::metrics::record_pool_connection_event("created");
        PooledConnection::new(Slot::new(conn, self.overflow), Arc::clone(&self.inner))
    }

    fn fail(mut self, error: &PoolError) {
        self.armed = false;
        self.inner.cancel_reservation(self.overflow, Some(error));
        crate::metrics::record_pool_connection_event("failed");
    }
}

impl<F: ConnectionFactory> Drop for Reservation<F> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.cancel_reservation(self.overflow, None);
        }
    }
}

/// A queued acquirer. Dropping it leaves the queue and returns any grant
/// that arrived after the acquirer stopped waiting.
struct QueuedWait<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
    id: u64,
    rx: oneshot::Receiver<Grant<F::Connection>>,
    done: bool,
}

impl<F: ConnectionFactory> Drop for QueuedWait<F> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.inner.state.lock().waiters.retain(|w| w.id != self.id);
        self.rx.close();
        match self.rx.try_recv() {
            Ok(Grant::Ready(slot)) => self.inner.checkin(slot, false),
            Ok(Grant::Create { overflow }) => self.inner.cancel_reservation(overflow, None),
            Err(_) => {}
        }
    }
}

/// Idle connections borrowed by maintenance.
struct Borrowed<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
    taken: usize,
    keep: Vec<Slot<F::Connection>>,
}

impl<F: ConnectionFactory> Drop for Borrowed<F> {
    fn drop(&mut self) {
        self.inner.restore(self.taken, std::mem::take(&mut self.keep));
    }
}

enum Ticket<C> {
    Granted(Grant<C>),
    Queued(u64, oneshot::Receiver<Grant<C>>),
}

/// Pool occupancy and lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub active: usize,
    pub idle: usize,
    /// Overflow connections currently open
    pub overflow: usize,
    /// Connections being created or checked by maintenance
    pub pending: usize,
    pub waiting: usize,
    pub size: usize,
    pub max_overflow: usize,
    pub total_created: u64,
    pub total_failed: u64,
    pub peak_active: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }

    /// Gauge value: 0 healthy, 1 degraded, 2 unhealthy.
    #[must_use]
    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Degraded => 1,
            Self::Unhealthy => 2,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub active: usize,
    pub idle: usize,
    /// Lifetime failures: creation errors and failed probes
    pub failed: u64,
    /// active / (size + max_overflow)
    pub pool_utilization: f64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OptimizeReport {
    pub destroyed: usize,
    pub previous_size: usize,
    pub new_size: usize,
}

/// Bounded pool of connections produced by `F`.
pub struct ConnectionPool<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> Clone for ConnectionPool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ConnectionFactory> fmt::Debug for ConnectionPool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    pub fn new(factory: F, config: &PoolConfig) -> Self {
        let settings = Settings {
            max_overflow: config.max_overflow,
            acquire_timeout: config.acquire_timeout(),
            recycle_interval: config.recycle_interval(),
            idle_probe_threshold: config.idle_probe_threshold(),
            max_errors: config.max_errors,
            min_size: config.min_size,
            max_size: config.max_size,
        };
        let state = PoolState {
            idle: VecDeque::new(),
            leased: 0,
            pending: 0,
            overflow_open: 0,
            size: config.size,
            waiters: VecDeque::new(),
            next_waiter: 0,
            closed: false,
            total_created: 0,
            total_failed: 0,
            peak_active: 0,
            window_created: 0,
            window_failed: 0,
            last_error: None,
            degraded_ratio: DEFAULT_DEGRADED_RATIO,
        };
        crate::metrics::set_pool_size(config.size);
        Self {
            inner: Arc::new(PoolInner {
                factory,
                settings,
                state: Mutex::new(state),
            }),
        }
    }

    /// Override the failed / created ratio used by `health_check`.
    pub fn set_degraded_ratio(&self, ratio: f64) {
        self.inner.state.lock().degraded_ratio = ratio;
    }

    #[must_use]
    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub async fn acquire(&self) -> Result<PooledConnection<F>, PoolError> {
        self.acquire_with_cancel(&CancellationToken::new()).await
    }

    /// Lease a connection, waiting up to the acquire timeout. Cancelling
    /// removes the caller from the wait queue.
    pub async fn acquire_with_cancel(
        &self,
        cancel: &CancellationToken,
    ) -> Result<PooledConnection<F>, PoolError> {
        let started = Instant::now();
        let result = self.acquire_inner(cancel, started).await;
        let status = match &result {
            Ok(_) => "success",
            Err(PoolError::Exhausted { .. }) => "timeout",
            Err(PoolError::Cancelled) => "cancelled",
            Err(PoolError::Closed) => "closed",
            Err(PoolError::Create { .. }) => "error",
        };
        crate::metrics::record_pool_acquire(status);
        crate::metrics::record_pool_wait(started.elapsed());
        if let Err(PoolError::Exhausted { waited_ms }) = &result {
            warn!(waited_ms, "Connection pool exhausted");
        }
        result
    }

    async fn acquire_inner(
        &self,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<PooledConnection<F>, PoolError> {
        let grant = match self.try_grant()? {
            Ticket::Granted(grant) => grant,
            Ticket::Queued(id, rx) => self.wait(id, rx, cancel, started).await?,
        };
        match grant {
            Grant::Ready(slot) => self.hand_out(slot, cancel).await,
            Grant::Create { overflow } => self.open_new(overflow, cancel).await,
        }
    }

    fn try_grant(&self) -> Result<Ticket<F::Connection>, PoolError> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(PoolError::Closed);
        }
        state.waiters.retain(|w| !w.tx.is_closed());
        // Newcomers queue behind existing waiters
        if state.waiters.is_empty() {
            if let Some(slot) = state.idle.pop_back() {
                state.lease();
                state.publish();
                return Ok(Ticket::Granted(Grant::Ready(slot)));
            }
            if let Some(overflow) = state.reserve(self.inner.settings.max_overflow) {
                return Ok(Ticket::Granted(Grant::Create { overflow }));
            }
        }
        let (tx, rx) = oneshot::channel();
        let id = state.next_waiter;
        state.next_waiter += 1;
        state.waiters.push_back(Waiter { id, tx });
        debug!(waiting = state.waiters.len(), "Pool saturated, queueing acquirer");
        Ok(Ticket::Queued(id, rx))
    }

    async fn wait(
        &self,
        id: u64,
        rx: oneshot::Receiver<Grant<F::Connection>>,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<Grant<F::Connection>, PoolError> {
        let mut queued = QueuedWait {
            inner: Arc::clone(&self.inner),
            id,
            rx,
            done: false,
        };
        let deadline = started + self.inner.settings.acquire_timeout;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            received = tokio::time::timeout_at(deadline, &mut queued.rx) => Some(received),
        };
        match outcome {
            None => Err(PoolError::Cancelled),
            Some(Ok(Ok(grant))) => {
                queued.done = true;
                Ok(grant)
            }
            // Sender dropped: the pool closed while we waited
            Some(Ok(Err(_))) => {
                queued.done = true;
                Err(PoolError::Closed)
            }
            Some(Err(_)) => Err(PoolError::Exhausted {
                waited_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    async fn open_new(
        &self,
        overflow: bool,
        cancel: &CancellationToken,
    ) -> Result<PooledConnection<F>, PoolError> {
        let reservation = Reservation {
            inner: Arc::clone(&self.inner),
            overflow,
            armed: true,
        };
        let created = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PoolError::Cancelled),
            created = self.inner.factory.create() => created,
        };
        match created {
            Ok(conn) => {
                if overflow {
                    debug!("Opened overflow connection");
                }
                Ok(reservation.complete(conn))
            }
            Err(PoolError::Cancelled) => Err(PoolError::Cancelled),
            Err(e) => {
                warn!(error = %e, overflow, "Failed to create connection");
                reservation.fail(&e);
                Err(e)
            }
        }
    }

    /// Lease an idle connection, probing it first if it sat idle too long.
    async fn hand_out(
        &self,
        slot: Slot<F::Connection>,
        cancel: &CancellationToken,
    ) -> Result<PooledConnection<F>, PoolError> {
        let needs_probe = slot.last_used.elapsed() >= self.inner.settings.idle_probe_threshold;
        let mut leased = PooledConnection::new(slot, Arc::clone(&self.inner));
        if !needs_probe || self.inner.factory.probe(&mut *leased).await {
            return Ok(leased);
        }

        warn!("Idle connection failed liveness probe, recreating");
        crate::metrics::record_pool_connection_event("probe_failed");
        self.inner
            .state
            .lock()
            .note_failure("idle connection failed liveness probe");

        // One re-create attempt; on failure the broken connection is destroyed on drop
        leased.mark_broken();
        let created = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PoolError::Cancelled),
            created = self.inner.factory.create() => created,
        };
        match created {
            Ok(fresh) => {
                let stale = leased.replace(fresh);
                {
                    let mut state = self.inner.state.lock();
                    state.note_created();
                }
                crate::metrics::record_pool_connection_event("created");
                self.inner.destroy_later(stale);
                Ok(leased)
            }
            Err(e) => {
                warn!(error = %e, "Re-create after failed probe also failed");
                self.inner.state.lock().note_failure(&e.to_string());
                crate::metrics::record_pool_connection_event("failed");
                Err(e)
            }
        }
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            active: state.leased,
            idle: state.idle.len(),
            overflow: state.overflow_open,
            pending: state.pending,
            waiting: state.waiting(),
            size: state.size,
            max_overflow: self.inner.settings.max_overflow,
            total_created: state.total_created,
            total_failed: state.total_failed,
            peak_active: state.peak_active,
        }
    }

    /// Take the whole idle set out of circulation.
    fn borrow_idle(&self) -> Option<(Borrowed<F>, Vec<Slot<F::Connection>>)> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return None;
        }
        let slots: Vec<_> = state.idle.drain(..).collect();
        state.pending += slots.len();
        state.publish();
        let borrowed = Borrowed {
            inner: Arc::clone(&self.inner),
            taken: slots.len(),
            keep: Vec::new(),
        };
        Some((borrowed, slots))
    }

    /// Probe every idle connection and classify the pool.
    ///
    /// Unhealthy when every idle probe fails, or when nothing is open and
    /// every creation in the window failed. Degraded when failures over
    /// creations in the window since the previous check exceed the ratio.
    pub async fn health_check(&self) -> HealthReport {
        let mut probed = 0usize;
        let mut failed_probes = 0u64;

        if let Some((mut borrowed, slots)) = self.borrow_idle() {
            probed = slots.len();
            for mut slot in slots {
                if self.inner.factory.probe(&mut slot.conn).await {
                    slot.last_used = Instant::now();
                    borrowed.keep.push(slot);
                } else {
                    failed_probes += 1;
                    crate::metrics::record_pool_connection_event("probe_failed");
                    self.inner.destroy_later(slot.conn);
                }
            }
        }

        let report = {
            let mut state = self.inner.state.lock();
            for _ in 0..failed_probes {
                state.note_failure("idle connection failed liveness probe");
            }
            let created = std::mem::take(&mut state.window_created);
            let failed = std::mem::take(&mut state.window_failed);

            let status = if state.closed
                || (probed > 0 && failed_probes == probed as u64)
                || (created == 0 && failed > 0 && state.leased == 0 && state.idle.is_empty())
            {
                HealthStatus::Unhealthy
            } else if failed > 0
                && (created == 0 || failed as f64 / created as f64 > state.degraded_ratio)
            {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            };

            let capacity = state.size + self.inner.settings.max_overflow;
            HealthReport {
                status,
                active: state.leased,
                idle: state.idle.len(),
                failed: state.total_failed,
                pool_utilization: if capacity == 0 {
                    0.0
                } else {
                    state.leased as f64 / capacity as f64
                },
                last_error: state.last_error.clone(),
            }
        };

        crate::metrics::set_pool_health(report.status.as_u8());
        if report.status == HealthStatus::Healthy {
            debug!(active = report.active, idle = report.idle, "Pool health check passed");
        } else {
            warn!(
                status = %report.status,
                active = report.active,
                idle = report.idle,
                failed = report.failed,
                probed,
                failed_probes,
                "Pool health check not healthy"
            );
        }
        report
    }

    /// Destroy every idle connection, reset failure counters, and resize
    /// within `[min_size, max_size]` from the observed peak.
    pub async fn optimize(&self) -> OptimizeReport {
        self.optimize_for("manual").await
    }

    pub(crate) async fn optimize_for(&self, trigger: &'static str) -> OptimizeReport {
        let mut destroyed = 0usize;
        if let Some((borrowed, mut slots)) = self.borrow_idle() {
            if let Some(first) = slots.first_mut() {
                if let Err(e) = self.inner.factory.optimize_hook(&mut first.conn).await {
                    warn!(error = %e, "Connection optimize hook failed");
                }
            }
            destroyed = slots.len();
            for slot in slots {
                self.inner.factory.destroy(slot.conn).await;
                crate::metrics::record_pool_connection_event("destroyed");
            }
            drop(borrowed);
        }

        let (previous_size, new_size) = {
            let mut state = self.inner.state.lock();
            let previous = state.size;
            let peak = state.peak_active;
            let target = if previous > 0 && peak >= previous {
                previous + previous.div_ceil(4)
            } else if peak * 2 < previous {
                previous - previous / 4
            } else {
                previous
            };
            if target != previous {
                state.size = target
                    .max(self.inner.settings.min_size)
                    .min(self.inner.settings.max_size);
            }
            state.total_failed = 0;
            state.window_failed = 0;
            state.window_created = 0;
            state.last_error = None;
            state.peak_active = state.leased;
            // A grown pool may now have room for queued acquirers
            state.serve_waiters(self.inner.settings.max_overflow);
            state.publish();
            (previous, state.size)
        };

        crate::metrics::record_pool_optimize(trigger);
        crate::metrics::set_pool_size(new_size);
        info!(trigger, destroyed, previous_size, new_size, "Connection pool optimized");
        OptimizeReport {
            destroyed,
            previous_size,
            new_size,
        }
    }

    /// Refuse new acquires, wake waiters with `Closed`, destroy idle connections.
    /// Leased connections are destroyed when released.
    pub async fn close(&self) {
        let (idle, waiters) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let idle: Vec<_> = state.idle.drain(..).collect();
            let waiters: Vec<_> = state.waiters.drain(..).collect();
            state.publish();
            (idle, waiters)
        };
        drop(waiters);
        let count = idle.len();
        for slot in idle {
            self.inner.factory.destroy(slot.conn).await;
            crate::metrics::record_pool_connection_event("destroyed");
        }
        info!(destroyed = count, "Connection pool closed");
    }
}

/// A leased connection. Dropping it returns the connection to the pool.
pub struct PooledConnection<F: ConnectionFactory> {
    slot: Option<Slot<F::Connection>>,
    inner: Arc<PoolInner<F>>,
    broken: bool,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    fn new(slot: Slot<F::Connection>, inner: Arc<PoolInner<F>>) -> Self {
        Self {
            slot: Some(slot),
            inner,
            broken: false,
        }
    }

    fn slot(&self) -> &Slot<F::Connection> {
        match &self.slot {
            Some(slot) => slot,
            None => unreachable!("pooled connection used after release"),
        }
    }

    fn slot_mut(&mut self) -> &mut Slot<F::Connection> {
        match &mut self.slot {
            Some(slot) => slot,
            None => unreachable!("pooled connection used after release"),
        }
    }

    /// Swap in a freshly created connection, returning the old one.
    fn replace(&mut self, conn: F::Connection) -> F::Connection {
        self.broken = false;
        let slot = self.slot_mut();
        slot.created_at = Instant::now();
        slot.error_count = 0;
        std::mem::replace(&mut slot.conn, conn)
    }

    /// Destroy the connection on release instead of returning it.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Count an error against the connection. Past the pool's limit it is
    /// destroyed on release.
    pub fn record_error(&mut self) {
        self.slot_mut().error_count += 1;
    }

    #[must_use]
    pub fn error_count(&self) -> u32 {
        self.slot().error_count
    }

    #[must_use]
    pub fn age(&self) -> Duration {
        self.slot().created_at.elapsed()
    }

    #[must_use]
    pub fn is_overflow(&self) -> bool {
        self.slot().overflow
    }
}

impl<F: ConnectionFactory> fmt::Debug for PooledConnection<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

impl<F: ConnectionFactory> Deref for PooledConnection<F> {
    type Target = F::Connection;

    fn deref(&self) -> &Self::Target {
        &self.slot().conn
    }
}

impl<F: ConnectionFactory> DerefMut for PooledConnection<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.slot_mut().conn
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.inner.checkin(slot, self.broken);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct MockFactory {
        next_id: AtomicU32,
        destroyed: AtomicU32,
        hooks: AtomicU32,
        failing_creates: AtomicU32,
        probe_ok: AtomicBool,
    }

    impl MockFactory {
        fn new() -> Self {
            Self {
                next_id: AtomicU32::new(0),
                destroyed: AtomicU32::new(0),
                hooks: AtomicU32::new(0),
                failing_creates: AtomicU32::new(0),
                probe_ok: AtomicBool::new(true),
            }
        }
    }

    #[async_trait]
    impl ConnectionFactory for MockFactory {
        type Connection = u32;

        async fn create(&self) -> Result<u32, PoolError> {
            let failing = self.failing_creates.load(Ordering::SeqCst);
            if failing > 0 {
                self.failing_creates.store(failing - 1, Ordering::SeqCst);
                return Err(PoolError::create(&"connection refused".to_string()));
            }
            Ok(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
        }

        async fn destroy(&self, _conn: u32) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }

        async fn probe(&self, _conn: &mut u32) -> bool {
            self.probe_ok.load(Ordering::SeqCst)
        }

        async fn optimize_hook(&self, _conn: &mut u32) -> Result<(), PoolError> {
            self.hooks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config(size: usize, max_overflow: usize) -> PoolConfig {
        PoolConfig {
            size,
            max_overflow,
            acquire_timeout_s: 0.5,
            min_size: 1,
            max_size: 50,
            ..PoolConfig::default()
        }
    }

    fn pool(size: usize, max_overflow: usize) -> ConnectionPool<MockFactory> {
        ConnectionPool::new(MockFactory::new(), &config(size, max_overflow))
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_idle_connection_is_reused() {
        let pool = pool(2, 0);
        let first = *pool.acquire().await.unwrap();
        let second = *pool.acquire().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(pool.stats().total_created, 1);
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_overflow_connection_destroyed_on_release() {
        let pool = pool(1, 1);
        let regular = pool.acquire().await.unwrap();
        let extra = pool.acquire().await.unwrap();
        assert!(!regular.is_overflow());
        assert!(extra.is_overflow());
        assert_eq!(pool.stats().overflow, 1);

        drop(extra);
        settle().await;
        let stats = pool.stats();
        assert_eq!(stats.overflow, 0);
        assert_eq!(stats.idle, 0);
        assert_eq!(pool.factory().destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_size_zero_creates_only_transient_connections() {
        let pool = pool(0, 2);
        let conn = pool.acquire().await.unwrap();
        assert!(conn.is_overflow());
        drop(conn);
        settle().await;
        assert_eq!(pool.stats().idle, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_times_out_with_pool_exhausted() {
        let pool = pool(1, 0);
        let _held = pool.acquire().await.unwrap();

        let started = Instant::now();
        match pool.acquire().await {
            Err(PoolError::Exhausted { waited_ms }) => assert!(waited_ms >= 500),
            other => panic!("expected exhaustion, got {:?}", other.map(|c| *c)),
        }
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert_eq!(pool.stats().waiting, 0);
    }

    #[tokio::test]
    async fn test_waiters_are_served_in_order() {
        let pool = pool(1, 0);
        let held = pool.acquire().await.unwrap();
        let id = *held;

        let p1 = pool.clone();
        let first = tokio::spawn(async move {
            let conn = p1.acquire().await.unwrap();
            let id = *conn;
            drop(conn);
            id
        });
        settle().await;
        let p2 = pool.clone();
        let second = tokio::spawn(async move { *p2.acquire().await.unwrap() });
        settle().await;
        assert_eq!(pool.stats().waiting, 2);

        drop(held);
        assert_eq!(first.await.unwrap(), id);
        assert_eq!(second.await.unwrap(), id);
        assert_eq!(pool.stats().total_created, 1);
    }

    #[tokio::test]
    async fn test_cancel_leaves_queue() {
        let pool = pool(1, 0);
        let held = pool.acquire().await.unwrap();
        let cancel = CancellationToken::new();

        let p = pool.clone();
        let token = cancel.clone();
        let waiter = tokio::spawn(async move { p.acquire_with_cancel(&token).await.map(|c| *c) });
        settle().await;
        assert_eq!(pool.stats().waiting, 1);

        cancel.cancel();
        assert!(matches!(waiter.await.unwrap(), Err(PoolError::Cancelled)));
        assert_eq!(pool.stats().waiting, 0);

        drop(held);
        assert_eq!(pool.stats().idle, 1);
        assert_eq!(pool.stats().active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_connection_is_not_returned() {
        let pool = ConnectionPool::new(
            MockFactory::new(),
            &PoolConfig { recycle_s: 10, ..config(2, 0) },
        );
        let conn = pool.acquire().await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        drop(conn);
        assert_eq!(pool.stats().idle, 0);
    }

    #[tokio::test]
    async fn test_error_count_past_limit_destroys() {
        let pool = pool(2, 0);
        let mut conn = pool.acquire().await.unwrap();
        for _ in 0..4 {
            conn.record_error();
        }
        assert_eq!(conn.error_count(), 4);
        drop(conn);
        assert_eq!(pool.stats().idle, 0);

        let mut conn = pool.acquire().await.unwrap();
        conn.mark_broken();
        drop(conn);
        assert_eq!(pool.stats().idle, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_recreates_once() {
        let pool = pool(2, 0);
        let first = *pool.acquire().await.unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;
        pool.factory().probe_ok.store(false, Ordering::SeqCst);
        let conn = pool.acquire().await.unwrap();
        assert_ne!(*conn, first);

        let stats = pool.stats();
        assert_eq!(stats.total_created, 2);
        assert_eq!(stats.total_failed, 1);
        drop(conn);
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_and_failed_recreate_surfaces_error() {
        let pool = pool(2, 0);
        drop(pool.acquire().await.unwrap());

        tokio::time::advance(Duration::from_secs(31)).await;
        pool.factory().probe_ok.store(false, Ordering::SeqCst);
        pool.factory().failing_creates.store(1, Ordering::SeqCst);
        assert!(matches!(pool.acquire().await, Err(PoolError::Create { .. })));

        let stats = pool.stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.total_failed, 2);
    }

    #[tokio::test]
    async fn test_create_failure_releases_capacity() {
        let pool = pool(1, 0);
        pool.factory().failing_creates.store(1, Ordering::SeqCst);
        assert!(pool.acquire().await.is_err());
        assert_eq!(pool.stats().pending, 0);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_optimize_destroys_idle_and_keeps_active() {
        let pool = pool(4, 0);
        let held = pool.acquire().await.unwrap();
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        drop(a);
        drop(b);
        assert_eq!(pool.stats().idle, 2);

        let report = pool.optimize().await;
        assert_eq!(report.destroyed, 2);
        assert_eq!(pool.factory().hooks.load(Ordering::SeqCst), 1);
        let stats = pool.stats();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.total_failed, 0);
        drop(held);
    }

    #[tokio::test]
    async fn test_optimize_resizes_from_peak() {
        let pool = pool(4, 0);
        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(pool.acquire().await.unwrap());
        }
        assert_eq!(pool.optimize().await.new_size, 5);
        held.clear();

        // Peak is now 4 of 5; no change. Then an idle pass shrinks.
        assert_eq!(pool.optimize().await.new_size, 5);
        assert_eq!(pool.optimize().await.new_size, 4);
    }

    #[tokio::test]
    async fn test_health_check_states() {
        let pool = pool(3, 0);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        drop(a);
        drop(b);
        assert_eq!(pool.health_check().await.status, HealthStatus::Healthy);

        pool.factory().probe_ok.store(false, Ordering::SeqCst);
        let report = pool.health_check().await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.idle, 0);
        assert!(report.last_error.is_some());

        pool.factory().probe_ok.store(true, Ordering::SeqCst);
        pool.factory().failing_creates.store(1, Ordering::SeqCst);
        let _ = pool.acquire().await;
        let held: Vec<_> = vec![pool.acquire().await.unwrap(), pool.acquire().await.unwrap()];
        // 1 failure against 2 creations
        assert_eq!(pool.health_check().await.status, HealthStatus::Degraded);
        drop(held);
        assert_eq!(pool.health_check().await.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_close_rejects_and_wakes_waiters() {
        let pool = pool(1, 0);
        let held = pool.acquire().await.unwrap();
        let p = pool.clone();
        let waiter = tokio::spawn(async move { p.acquire().await.map(|c| *c) });
        settle().await;

        pool.close().await;
        assert!(matches!(waiter.await.unwrap(), Err(PoolError::Closed)));
        assert!(matches!(pool.acquire().await, Err(PoolError::Closed)));

        drop(held);
        settle().await;
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.factory().destroyed.load(Ordering::SeqCst), 1);
    }
}
