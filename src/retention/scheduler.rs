// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retention scheduler.
//!
//! A single cooperative task that wakes every `tick_s` and runs whichever of
//! two schedules is due:
//!
//! | Job | When | Work |
//! |-----|------|------|
//! | Daily maintenance | first tick in `[cleanup_hour, cleanup_hour + 1h)` local | assign expiry, delete expired, flag expiring soon |
//! | Storage watch | every `check_interval_min` in business hours, `off_hours_interval_min` otherwise | measure free space, warn, emergency cleanup |
//!
//! Deletion always removes the file before the record moves to `deleted`.
//! If the record update fails after the file is gone, the record stays live
//! with no file behind it; [`RetentionScheduler::reconcile`] (also run at
//! startup) finds those and finishes the transition.
//!
//! Cancellation is observed between artifacts, never in the middle of one.

use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, Offset, Timelike, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::artifact::{ArtifactRecord, ArtifactStatus, RetentionRules, RuleSet};
use super::clock::Clock;
use super::disk::DiskSpace;
use super::store::{ArtifactCursor, ArtifactPage, ArtifactQuery, ArtifactStore, ArtifactStoreError};
use crate::config::RetentionConfig;
use crate::error::{Classify, ErrorKind};
use crate::resilience::{RetryEngine, RetryError, RetryPolicy};

const MB: u64 = 1024 * 1024;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] ArtifactStoreError),

    #[error(transparent)]
    Retry(#[from] RetryError<ArtifactStoreError>),

    #[error("retention scheduler is already running")]
    AlreadyRunning,
}

impl Classify for SchedulerError {
    fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Store(e) => e.kind(),
            Self::Retry(e) => Some(e.kind),
            Self::AlreadyRunning => Some(ErrorKind::Permanent),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageLevel {
    Ok,
    Warning,
    Emergency,
}

impl StorageLevel {
    fn classify(free_bytes: u64, config: &RetentionConfig) -> Self {
        if free_bytes < config.emergency_free_bytes() {
            Self::Emergency
        } else if free_bytes < config.warning_free_bytes() {
            Self::Warning
        } else {
            Self::Ok
        }
    }

    #[must_use]
    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::Warning => 1,
            Self::Emergency => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerHealth {
    Healthy,
    /// `failure_threshold` or more jobs failed in a row
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub health: SchedulerHealth,
    pub consecutive_failures: u32,
    pub last_daily_run: Option<DateTime<Utc>>,
    pub last_storage_check: Option<DateTime<Utc>>,
    pub last_emergency_cleanup: Option<DateTime<Utc>>,
    pub storage_level: Option<StorageLevel>,
    pub free_bytes: Option<u64>,
    pub last_error: Option<String>,
}

/// Outcome of a maintenance or cleanup run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub expiry_assigned: usize,
    pub marked_expiring: usize,
    pub deleted: usize,
    pub bytes_freed: u64,
    /// Artifacts skipped after an error
    pub failed: usize,
    /// Set by storage cleanups
    pub free_bytes_after: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub scanned: usize,
    /// Live records whose file was missing, now `deleted`
    pub fixed: usize,
    pub failed: usize,
}

/// What one wake-up did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub daily: Option<CleanupReport>,
    pub storage: Option<StorageLevel>,
    pub emergency: Option<CleanupReport>,
    /// Jobs that returned an error
    pub failures: u32,
}

#[derive(Debug, Default)]
struct SchedulerState {
    last_daily: Option<DateTime<Utc>>,
    last_storage_check: Option<DateTime<Utc>>,
    last_emergency: Option<DateTime<Utc>>,
    storage_level: Option<StorageLevel>,
    free_bytes: Option<u64>,
    consecutive_failures: u32,
    last_error: Option<String>,
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct RetentionScheduler {
    config: RetentionConfig,
    store: Arc<dyn ArtifactStore>,
    disk: Arc<dyn DiskSpace>,
    clock: Arc<dyn Clock>,
    retry: RetryEngine,
    rules: RetentionRules,
    store_policy: RetryPolicy,
    file_policy: RetryPolicy,
    offset: FixedOffset,
    state: Mutex<SchedulerState>,
    /// One job at a time, ticks and forced runs alike
    job_lock: tokio::sync::Mutex<()>,
    running: Mutex<Option<Running>>,
}

fn hours(h: u64) -> ChronoDuration {
    ChronoDuration::hours(i64::try_from(h.min(87_600)).unwrap_or(24))
}

fn minutes(m: u64) -> ChronoDuration {
    ChronoDuration::minutes(i64::try_from(m.clamp(1, 525_600)).unwrap_or(60))
}

impl RetentionScheduler {
    pub fn new(
        config: RetentionConfig,
        store: Arc<dyn ArtifactStore>,
        disk: Arc<dyn DiskSpace>,
        clock: Arc<dyn Clock>,
        retry: RetryEngine,
    ) -> Self {
        let offset = FixedOffset::east_opt(config.utc_offset_minutes.saturating_mul(60))
            .unwrap_or_else(|| Utc.fix());
        Self {
            rules: RetentionRules::from_config(&config),
            config,
            store,
            disk,
            clock,
            retry,
            store_policy: RetryPolicy::database(),
            file_policy: RetryPolicy::file_op(),
            offset,
            state: Mutex::new(SchedulerState::default()),
            job_lock: tokio::sync::Mutex::new(()),
            running: Mutex::new(None),
        }
    }

    /// Policy for artifact store reads and record updates.
    #[must_use]
    pub fn with_store_policy(mut self, policy: RetryPolicy) -> Self {
        self.store_policy = policy;
        self
    }

    /// Policy for file deletion and existence checks.
    #[must_use]
    pub fn with_file_policy(mut self, policy: RetryPolicy) -> Self {
        self.file_policy = policy;
        self
    }

    /// Spawn the scheduler loop. Reconciles partial deletes before the first tick.
    #[tracing::instrument(skip(self))]
    pub fn start(self: &Arc<Self>) -> Result<(), SchedulerError> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }
        let cancel = CancellationToken::new();
        let this = Arc::clone(self);
        let token = cancel.clone();
        let handle = tokio::spawn(async move { this.run(token).await });
        *running = Some(Running { cancel, handle });
        info!(
            tick_s = self.config.tick().as_secs(),
            cleanup_hour = self.config.cleanup_hour,
            utc_offset_minutes = self.config.utc_offset_minutes,
            "Retention scheduler started"
        );
        Ok(())
    }

    /// Cancel the loop and wait for it. The artifact being processed is finished first.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        let Some(Running { cancel, handle }) = running else {
            return;
        };
        cancel.cancel();
        if let Err(e) = handle.await {
            warn!(error = %e, "Retention scheduler task ended abnormally");
        }
        info!("Retention scheduler stopped");
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        match self.reconcile_with(&cancel).await {
            Ok(report) if report.fixed > 0 => {
                info!(fixed = report.fixed, scanned = report.scanned, "Reconciled partial deletes");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Startup reconciliation failed"),
        }

        let mut interval = tokio::time::interval(self.config.tick());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.run_tick(&cancel).await;
                }
            }
        }
    }

    /// Run whatever is due now. Safe to call repeatedly: a schedule that
    /// already ran in its current slot is skipped.
    pub async fn tick(&self) -> TickReport {
        let cancel = self.current_token();
        self.run_tick(&cancel).await
    }

    /// Run daily maintenance now, regardless of the hour.
    #[tracing::instrument(skip(self))]
    pub async fn force_daily_maintenance(&self) -> Result<CleanupReport, SchedulerError> {
        let _job = self.job_lock.lock().await;
        let cancel = self.current_token();
        self.run_daily(self.clock.now(), &cancel).await
    }

    /// Delete the oldest expired or expiring artifacts until free space is
    /// back above the warning threshold.
    #[tracing::instrument(skip(self))]
    pub async fn force_storage_cleanup(&self) -> Result<CleanupReport, SchedulerError> {
        let _job = self.job_lock.lock().await;
        let cancel = self.current_token();
        let now = self.clock.now();
        // The cleanup measures free space, which counts as this slot's check
        self.state.lock().last_storage_check = Some(now);
        self.run_emergency(now, &cancel).await
    }

    /// Mark live records whose file is missing as deleted.
    pub async fn reconcile(&self) -> Result<ReconcileReport, SchedulerError> {
        let cancel = self.current_token();
        self.reconcile_with(&cancel).await
    }

    /// Replace the retention rules. Running jobs keep the rules they started with.
    pub fn update_rules(&self, rules: RuleSet) {
        info!(rules = rules.len(), "Retention rules updated");
        self.rules.update(rules);
    }

    #[must_use]
    pub fn rules(&self) -> Arc<RuleSet> {
        self.rules.snapshot()
    }

    #[must_use]
    pub fn status(&self) -> SchedulerStatus {
        let running = self.is_running();
        let state = self.state.lock();
        let health = if state.consecutive_failures >= self.config.failure_threshold.max(1) {
            SchedulerHealth::Degraded
        } else {
            SchedulerHealth::Healthy
        };
        SchedulerStatus {
            running,
            health,
            consecutive_failures: state.consecutive_failures,
            last_daily_run: state.last_daily,
            last_storage_check: state.last_storage_check,
            last_emergency_cleanup: state.last_emergency,
            storage_level: state.storage_level,
            free_bytes: state.free_bytes,
            last_error: state.last_error.clone(),
        }
    }

    fn current_token(&self) -> CancellationToken {
        self.running
            .lock()
            .as_ref()
            .map(|r| r.cancel.clone())
            .unwrap_or_default()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Schedules
    // ═══════════════════════════════════════════════════════════════════════

    /// Today's maintenance slot in UTC.
    fn daily_slot(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = now.with_timezone(&self.offset);
        local
            .date_naive()
            .and_hms_opt(self.config.cleanup_hour, 0, 0)?
            .and_local_timezone(self.offset)
            .single()
            .map(|t| t.with_timezone(&Utc))
    }

    fn daily_due(&self, now: DateTime<Utc>, last: Option<DateTime<Utc>>) -> bool {
        let Some(slot) = self.daily_slot(now) else {
            return false;
        };
        now >= slot && now < slot + ChronoDuration::hours(1) && last.map_or(true, |l| l < slot)
    }

    fn in_business_hours(&self, now: DateTime<Utc>) -> bool {
        let hour = now.with_timezone(&self.offset).hour();
        (self.config.business_hours_start..self.config.business_hours_end).contains(&hour)
    }

    fn storage_interval(&self, now: DateTime<Utc>) -> ChronoDuration {
        if self.in_business_hours(now) {
            minutes(self.config.check_interval_min)
        } else {
            minutes(self.config.off_hours_interval_min)
        }
    }

    fn storage_due(&self, now: DateTime<Utc>, last: Option<DateTime<Utc>>) -> bool {
        last.map_or(true, |l| now - l >= self.storage_interval(now))
    }

    async fn run_tick(&self, cancel: &CancellationToken) -> TickReport {
        let _job = self.job_lock.lock().await;
        let now = self.clock.now();
        let (daily_due, storage_due) = {
            let state = self.state.lock();
            (
                self.daily_due(now, state.last_daily),
                self.storage_due(now, state.last_storage_check),
            )
        };

        let mut report = TickReport::default();
        if daily_due && !cancel.is_cancelled() {
            match self.run_daily(now, cancel).await {
                Ok(daily) => report.daily = Some(daily),
                Err(_) => report.failures += 1,
            }
        }
        if storage_due && !cancel.is_cancelled() {
            match self.run_storage_check(now) {
                Ok(level) => {
                    report.storage = Some(level);
                    if level == StorageLevel::Emergency && !cancel.is_cancelled() {
                        match self.run_emergency(now, cancel).await {
                            Ok(cleanup) => report.emergency = Some(cleanup),
                            Err(_) => report.failures += 1,
                        }
                    }
                }
                Err(_) => report.failures += 1,
            }
        }
        report
    }

    async fn run_daily(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<CleanupReport, SchedulerError> {
        let started = Instant::now();
        let result = self.daily_maintenance(now, cancel).await;
        self.finish("daily", started, &result);
        if let Ok(report) = &result {
            if cancel.is_cancelled() {
                info!(
                    deleted = report.deleted,
                    "Daily maintenance interrupted, remaining work runs on the next due tick"
                );
                return result;
            }
            self.state.lock().last_daily = Some(now);
            info!(
                expiry_assigned = report.expiry_assigned,
                deleted = report.deleted,
                marked_expiring = report.marked_expiring,
                failed = report.failed,
                "Daily maintenance complete"
            );
        }
        result
    }

    fn run_storage_check(&self, now: DateTime<Utc>) -> Result<StorageLevel, SchedulerError> {
        let started = Instant::now();
        self.state.lock().last_storage_check = Some(now);
        let result = self.measure_free().map(|free| (free, self.note_storage(free)));
        self.finish("storage_check", started, &result);
        let (free, level) = result?;
        match level {
            StorageLevel::Ok => debug!(free_mb = free / MB, "Storage check ok"),
            StorageLevel::Warning => warn!(
                free_mb = free / MB,
                warning_mb = self.config.warning_free_mb,
                "Storage below warning threshold"
            ),
            StorageLevel::Emergency => error!(
                free_mb = free / MB,
                emergency_mb = self.config.emergency_free_mb,
                "Storage below emergency threshold, starting cleanup"
            ),
        }
        Ok(level)
    }

    async fn run_emergency(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<CleanupReport, SchedulerError> {
        let started = Instant::now();
        let result = self.storage_cleanup(now, cancel).await;
        self.finish("emergency", started, &result);
        if let Ok(report) = &result {
            self.state.lock().last_emergency = Some(now);
            info!(
                deleted = report.deleted,
                bytes_freed = report.bytes_freed,
                failed = report.failed,
                free_mb = report.free_bytes_after.map(|b| b / MB),
                "Storage cleanup complete"
            );
        }
        result
    }

    fn finish<T>(&self, job: &'static str, started: Instant, result: &Result<T, SchedulerError>) {
        crate::metrics::record_retention_duration(job, started.elapsed());
        crate::metrics::record_retention_run(job, result.is_ok());
        let mut state = self.state.lock();
        match result {
            Ok(_) => state.consecutive_failures = 0,
            Err(e) => {
                state.consecutive_failures += 1;
                state.last_error = Some(e.to_string());
                if state.consecutive_failures == self.config.failure_threshold.max(1) {
                    error!(
                        job,
                        consecutive_failures = state.consecutive_failures,
                        error = %e,
                        "Retention scheduler degraded"
                    );
                } else {
                    warn!(job, error = %e, "Retention job failed");
                }
            }
        }
    }

    fn measure_free(&self) -> Result<u64, SchedulerError> {
        Ok(self.disk.free_bytes(&self.config.root)?)
    }

    fn note_storage(&self, free: u64) -> StorageLevel {
        let level = StorageLevel::classify(free, &self.config);
        crate::metrics::set_free_space_bytes(free);
        crate::metrics::set_storage_level(level.as_u8());
        let mut state = self.state.lock();
        state.free_bytes = Some(free);
        state.storage_level = Some(level);
        level
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Jobs
    // ═══════════════════════════════════════════════════════════════════════

    async fn page(&self, query: &ArtifactQuery) -> Result<ArtifactPage, SchedulerError> {
        // Store reads finish even when the loop is cancelled
        let uncancelled = CancellationToken::new();
        Ok(self
            .retry
            .execute("retention_list", &self.store_policy, &uncancelled, || {
                self.store.list(query)
            })
            .await?)
    }

    async fn daily_maintenance(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<CleanupReport, SchedulerError> {
        let rules = self.rules.snapshot();
        let batch = self.config.batch_size.max(1);
        let mut report = CleanupReport::default();
        let uncancelled = CancellationToken::new();

        // Assign expiry to records that have none
        let mut cursor: Option<ArtifactCursor> = None;
        loop {
            let page = self
                .page(&ArtifactQuery::live().missing_expiry().limit(batch).after(cursor.take()))
                .await?;
            for record in &page.records {
                if cancel.is_cancelled() {
                    return Ok(report);
                }
                let expires_at = record.created_at + rules.retention_for(&record.format_tag);
                let result = self
                    .retry
                    .execute("retention_set_expiry", &self.store_policy, &uncancelled, || {
                        self.store.set_expiry(&record.artifact_id, expires_at)
                    })
                    .await;
                match result {
                    Ok(()) => report.expiry_assigned += 1,
                    Err(e) => {
                        warn!(artifact_id = %record.artifact_id, error = %e, "Could not assign expiry");
                        crate::metrics::record_retention_error("daily");
                        report.failed += 1;
                    }
                }
            }
            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        // Delete everything past expiry
        let mut cursor: Option<ArtifactCursor> = None;
        loop {
            let page = self
                .page(&ArtifactQuery::live().expires_before(now).limit(batch).after(cursor.take()))
                .await?;
            for record in &page.records {
                if cancel.is_cancelled() {
                    return Ok(report);
                }
                self.delete_artifact(record, "daily", &mut report).await;
            }
            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        // Flag what expires inside the window
        let horizon = now + hours(self.config.expiring_window_h);
        let mut marked = 0usize;
        let mut cursor: Option<ArtifactCursor> = None;
        loop {
            let page = self
                .page(
                    &ArtifactQuery::default()
                        .with_statuses(&[ArtifactStatus::Active])
                        .expires_before(horizon)
                        .limit(batch)
                        .after(cursor.take()),
                )
                .await?;
            for record in &page.records {
                if cancel.is_cancelled() {
                    break;
                }
                // Expired records that failed to delete stay active for the next run
                if record.is_expired(now) {
                    continue;
                }
                let result = self
                    .retry
                    .execute("retention_mark_expiring", &self.store_policy, &uncancelled, || {
                        self.store.transition(
                            &record.artifact_id,
                            ArtifactStatus::Active,
                            ArtifactStatus::ExpiringSoon,
                        )
                    })
                    .await;
                match result {
                    Ok(()) => marked += 1,
                    Err(e) => {
                        warn!(artifact_id = %record.artifact_id, error = %e, "Could not flag artifact as expiring");
                        crate::metrics::record_retention_error("daily");
                        report.failed += 1;
                    }
                }
            }
            match page.next {
                Some(next) if !cancel.is_cancelled() => cursor = Some(next),
                _ => break,
            }
        }
        report.marked_expiring = marked;
        crate::metrics::record_retention_marked(marked);

        Ok(report)
    }

    /// Expired artifacts go first, then those expiring inside the window.
    /// Each pass walks records oldest first.
    async fn storage_cleanup(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<CleanupReport, SchedulerError> {
        let warning = self.config.warning_free_bytes();
        let horizon = now + hours(self.config.expiring_window_h);
        let mut report = CleanupReport::default();

        let mut free = self.measure_free()?;
        self.note_storage(free);
        free = self.cleanup_pass(now, now, free, cancel, &mut report).await?;
        free = self.cleanup_pass(now, horizon, free, cancel, &mut report).await?;

        if free < warning {
            warn!(
                free_mb = free / MB,
                warning_mb = self.config.warning_free_mb,
                "Storage still below warning threshold after cleanup"
            );
        }
        report.free_bytes_after = Some(free);
        Ok(report)
    }

    /// Delete live artifacts expiring at or before `upto` while free space is
    /// below the warning threshold. Returns the last measured free space.
    async fn cleanup_pass(
        &self,
        now: DateTime<Utc>,
        upto: DateTime<Utc>,
        mut free: u64,
        cancel: &CancellationToken,
        report: &mut CleanupReport,
    ) -> Result<u64, SchedulerError> {
        let warning = self.config.warning_free_bytes();
        let batch = self.config.batch_size.max(1);
        let mut cursor: Option<ArtifactCursor> = None;
        while free < warning && !cancel.is_cancelled() {
            let page = self
                .page(&ArtifactQuery::live().expires_before(upto).limit(batch).after(cursor.take()))
                .await?;
            if page.records.is_empty() {
                break;
            }
            for record in &page.records {
                if cancel.is_cancelled() {
                    break;
                }
                // Expired records were already tried by the first pass
                if upto > now && record.is_expired(now) {
                    continue;
                }
                self.delete_artifact(record, "emergency", report).await;
            }
            free = self.measure_free()?;
            self.note_storage(free);
            debug!(deleted = report.deleted, free_mb = free / MB, "Cleanup batch finished");
            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(free)
    }

    /// File first, then record. Failures are logged and counted, never raised.
    async fn delete_artifact(
        &self,
        record: &ArtifactRecord,
        job: &'static str,
        report: &mut CleanupReport,
    ) {
        let uncancelled = CancellationToken::new();
        let removed = self
            .retry
            .execute("retention_delete_file", &self.file_policy, &uncancelled, || {
                self.store.delete_file(&record.file_path)
            })
            .await;
        if let Err(e) = removed {
            warn!(
                artifact_id = %record.artifact_id,
                path = %record.file_path.display(),
                error = %e,
                "Artifact file could not be deleted"
            );
            crate::metrics::record_retention_error(job);
            report.failed += 1;
            return;
        }

        let updated = self
            .retry
            .execute("retention_mark_deleted", &self.store_policy, &uncancelled, || {
                self.store
                    .transition(&record.artifact_id, record.status, ArtifactStatus::Deleted)
            })
            .await;
        match updated {
            Ok(()) => {
                debug!(artifact_id = %record.artifact_id, size_bytes = record.size_bytes, "Artifact deleted");
                crate::metrics::record_retention_deleted(1, record.size_bytes);
                report.deleted += 1;
                report.bytes_freed += record.size_bytes;
            }
            Err(e) => {
                warn!(
                    artifact_id = %record.artifact_id,
                    error = %e,
                    "Artifact file removed but record update failed"
                );
                crate::metrics::record_retention_error(job);
                report.failed += 1;
            }
        }
    }

    async fn reconcile_with(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ReconcileReport, SchedulerError> {
        let _job = self.job_lock.lock().await;
        let started = Instant::now();
        let result = self.reconcile_records(cancel).await;
        self.finish("reconcile", started, &result);
        result
    }

    async fn reconcile_records(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ReconcileReport, SchedulerError> {
        let batch = self.config.batch_size.max(1);
        let uncancelled = CancellationToken::new();
        let mut report = ReconcileReport::default();
        let mut cursor: Option<ArtifactCursor> = None;

        while !cancel.is_cancelled() {
            let page = self
                .page(&ArtifactQuery::live().limit(batch).after(cursor.take()))
                .await?;
            for record in &page.records {
                if cancel.is_cancelled() {
                    break;
                }
                report.scanned += 1;
                let exists = self
                    .retry
                    .execute("retention_file_exists", &self.file_policy, &uncancelled, || {
                        self.store.file_exists(&record.file_path)
                    })
                    .await;
                let fixed = match exists {
                    Ok(true) => continue,
                    Ok(false) => {
                        let policy = &self.store_policy;
                        self.retry
                            .execute("retention_mark_deleted", policy, &uncancelled, || {
                                self.store.transition(
                                    &record.artifact_id,
                                    record.status,
                                    ArtifactStatus::Deleted,
                                )
                            })
                            .await
                    }
                    Err(e) => Err(e),
                };
                match fixed {
                    Ok(()) => {
                        info!(artifact_id = %record.artifact_id, "File missing, record marked deleted");
                        report.fixed += 1;
                    }
                    Err(e) => {
                        warn!(artifact_id = %record.artifact_id, error = %e, "Reconciliation failed for artifact");
                        crate::metrics::record_retention_error("reconcile");
                        report.failed += 1;
                    }
                }
            }
            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(report)
    }
}
