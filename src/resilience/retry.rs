// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry engine.
//!
//! Runs a fallible operation under a [`RetryPolicy`], sleeping between
//! attempts and recording every execution in [`RetryStats`]. The operation is
//! a closure producing a fresh future per attempt, so anything it leases
//! (a pooled connection, a temp file) is released before the backoff sleep.
//!
//! # Example
//!
//! ```
//! use telemetry_substrate::{RetryEngine, RetryPolicy};
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let engine = RetryEngine::new();
//! let cancel = CancellationToken::new();
//! let policy = RetryPolicy::database();
//!
//! let value: Result<u32, _> = engine
//!     .execute("read_power", &policy, &cancel, || async { Ok::<_, String>(230) })
//!     .await;
//! assert_eq!(value.unwrap(), 230);
//! assert_eq!(engine.stats().successful_attempts, 1);
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::policy::RetryPolicy;
use super::stats::{RetryStats, RetryStatsSnapshot};
use crate::error::{Classify, ErrorKind};

/// Why a retried execution stopped.
#[derive(Debug)]
pub enum Cause<E> {
    /// The last error returned by the operation
    Operation(E),
    /// The caller's cancellation token fired
    Cancelled,
    /// The execution deadline passed
    DeadlineExceeded,
}

impl<E: fmt::Display> fmt::Display for Cause<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Operation(e) => write!(f, "{e}"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::DeadlineExceeded => f.write_str("deadline exceeded"),
        }
    }
}

/// Terminal error surfaced by the engine.
#[derive(Debug)]
pub struct RetryError<E> {
    pub operation: String,
    pub kind: ErrorKind,
    pub attempts: u32,
    pub elapsed: Duration,
    pub cause: Cause<E>,
}

impl<E> RetryError<E> {
    /// The most recent operation error, if the execution ended on one.
    #[must_use]
    pub fn last_error(&self) -> Option<&E> {
        match &self.cause {
            Cause::Operation(e) => Some(e),
            _ => None,
        }
    }

    #[must_use]
    pub fn into_last_error(self) -> Option<E> {
        match self.cause {
            Cause::Operation(e) => Some(e),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self.cause, Cause::Cancelled | Cause::DeadlineExceeded)
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "operation '{}' failed ({}) after {} attempt(s) in {:?}: {}",
            self.operation, self.kind, self.attempts, self.elapsed, self.cause
        )
    }
}

impl<E> std::error::Error for RetryError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.cause {
            Cause::Operation(e) => Some(e),
            _ => None,
        }
    }
}

impl<E: fmt::Display> Classify for RetryError<E> {
    fn kind(&self) -> Option<ErrorKind> {
        Some(self.kind)
    }
}

enum Interrupt {
    Cancelled,
    Deadline,
}

type NoCleanup = fn() -> std::future::Ready<()>;

/// Policy-driven retry executor with shared statistics.
#[derive(Debug, Clone, Default)]
pub struct RetryEngine {
    stats: Arc<RetryStats>,
}

impl RetryEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn stats(&self) -> RetryStatsSnapshot {
        self.stats.snapshot()
    }

    /// Zero the statistics. Reached only through the engine's owner.
    pub fn reset_stats(&self) {
        info!("Retry statistics reset");
        self.stats.reset();
    }

    /// Run `operation` until it succeeds, a terminal error occurs, or `cancel` fires.
    pub async fn execute<T, E, F, Fut>(
        &self,
        name: &str,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify,
    {
        self.run(name, policy, cancel, None, operation, None::<NoCleanup>).await
    }

    /// Like [`execute`](Self::execute), but gives up once `timeout` has elapsed
    /// in total, including backoff sleeps.
    pub async fn execute_with_timeout<T, E, F, Fut>(
        &self,
        name: &str,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        timeout: Duration,
        operation: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify,
    {
        let deadline = Instant::now() + timeout;
        self.run(name, policy, cancel, Some(deadline), operation, None::<NoCleanup>)
            .await
    }

    /// Like [`execute`](Self::execute), running `cleanup` before every retry
    /// (never before the first attempt).
    pub async fn execute_with_cleanup<T, E, F, Fut, C, CFut>(
        &self,
        name: &str,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        operation: F,
        cleanup: C,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: FnMut() -> CFut,
        CFut: Future<Output = ()>,
        E: Classify,
    {
        self.run(name, policy, cancel, None, operation, Some(cleanup)).await
    }

    async fn run<T, E, F, Fut, C, CFut>(
        &self,
        name: &str,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
        mut operation: F,
        mut cleanup: Option<C>,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: FnMut() -> CFut,
        CFut: Future<Output = ()>,
        E: Classify,
    {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(self.interrupted(name, Interrupt::Cancelled, attempt, started));
            }
            attempt += 1;

            if attempt > 1 {
                if let Some(cleanup) = cleanup.as_mut() {
                    debug!(operation = %name, attempt, "Running cleanup before retry");
                    cleanup().await;
                }
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Interrupt::Cancelled),
                _ = sleep_until_opt(deadline) => Err(Interrupt::Deadline),
                result = operation() => Ok(result),
            };

            let error = match outcome {
                Err(interrupt) => return Err(self.interrupted(name, interrupt, attempt, started)),
                Ok(Ok(value)) => {
                    self.stats.record_success(name, attempt);
                    crate::metrics::record_retry_attempt(name, "success");
                    if attempt > 1 {
                        info!(operation = %name, attempts = attempt, "Operation succeeded after retries");
                    }
                    return Ok(value);
                }
                Ok(Err(error)) => error,
            };

            if !policy.should_retry(&error, attempt) {
                let kind = policy.classify(&error);
                self.stats.record_failure(name, attempt);
                crate::metrics::record_retry_attempt(name, "failure");
                crate::metrics::record_retry_exhausted(name, kind.as_str());
                if policy.log_failures {
                    warn!(
                        operation = %name,
                        attempts = attempt,
                        kind = %kind,
                        error = %error,
                        "Operation failed, giving up"
                    );
                }
                return Err(RetryError {
                    operation: name.to_string(),
                    kind,
                    attempts: attempt,
                    elapsed: started.elapsed(),
                    cause: Cause::Operation(error),
                });
            }

            let delay = policy.delay_for(attempt, error.kind());
            crate::metrics::record_retry_attempt(name, "retry");
            if policy.log_failures {
                warn!(
                    operation = %name,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Retry attempt failed"
                );
            }
            drop(error);

            if !delay.is_zero() {
                let slept = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(Interrupt::Cancelled),
                    _ = sleep_until_opt(deadline) => Err(Interrupt::Deadline),
                    _ = tokio::time::sleep(delay) => Ok(()),
                };
                if let Err(interrupt) = slept {
                    return Err(self.interrupted(name, interrupt, attempt, started));
                }
                self.stats.record_delay(delay);
                crate::metrics::record_retry_delay(name, delay);
            }
        }
    }

    /// Blocking variant for synchronous drivers. Sleeps in short slices so
    /// cancellation is noticed during backoff.
    pub fn execute_blocking<T, E, F>(
        &self,
        name: &str,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Result<T, E>,
        E: Classify,
    {
        const SLICE: Duration = Duration::from_millis(10);
        let started = std::time::Instant::now();
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(self.cancelled_blocking(name, attempt, started.elapsed()));
            }
            attempt += 1;

            let error = match operation() {
                Ok(value) => {
                    self.stats.record_success(name, attempt);
                    crate::metrics::record_retry_attempt(name, "success");
                    if attempt > 1 {
                        info!(operation = %name, attempts = attempt, "Operation succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if !policy.should_retry(&error, attempt) {
                let kind = policy.classify(&error);
                self.stats.record_failure(name, attempt);
                crate::metrics::record_retry_attempt(name, "failure");
                crate::metrics::record_retry_exhausted(name, kind.as_str());
                if policy.log_failures {
                    warn!(operation = %name, attempts = attempt, kind = %kind, error = %error, "Operation failed, giving up");
                }
                return Err(RetryError {
                    operation: name.to_string(),
                    kind,
                    attempts: attempt,
                    elapsed: started.elapsed(),
                    cause: Cause::Operation(error),
                });
            }

            let delay = policy.delay_for(attempt, error.kind());
            crate::metrics::record_retry_attempt(name, "retry");
            if policy.log_failures {
                warn!(
                    operation = %name,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Retry attempt failed"
                );
            }

            let wake_at = std::time::Instant::now() + delay;
            loop {
                let now = std::time::Instant::now();
                if now >= wake_at {
                    break;
                }
                if cancel.is_cancelled() {
                    return Err(self.cancelled_blocking(name, attempt, started.elapsed()));
                }
                std::thread::sleep(SLICE.min(wake_at - now));
            }
            self.stats.record_delay(delay);
            crate::metrics::record_retry_delay(name, delay);
        }
    }

    fn interrupted<E>(
        &self,
        name: &str,
        interrupt: Interrupt,
        attempts: u32,
        started: Instant,
    ) -> RetryError<E> {
        let cause = match interrupt {
            Interrupt::Cancelled => Cause::Cancelled,
            Interrupt::Deadline => Cause::DeadlineExceeded,
        };
        self.finish_interrupted(name, cause, attempts, started.elapsed())
    }

    fn cancelled_blocking<E>(&self, name: &str, attempts: u32, elapsed: Duration) -> RetryError<E> {
        self.finish_interrupted(name, Cause::Cancelled, attempts, elapsed)
    }

    fn finish_interrupted<E>(
        &self,
        name: &str,
        cause: Cause<E>,
        attempts: u32,
        elapsed: Duration,
    ) -> RetryError<E> {
        // A cancelled execution still counts as one failed attempt
        let attempts = attempts.max(1);
        self.stats.record_failure(name, attempts);
        crate::metrics::record_retry_attempt(name, "cancelled");
        crate::metrics::record_retry_exhausted(name, ErrorKind::Cancelled.as_str());
        info!(operation = %name, attempts, "Operation cancelled");
        RetryError {
            operation: name.to_string(),
            kind: ErrorKind::Cancelled,
            attempts,
            elapsed,
            cause,
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SubstrateError;
    use crate::resilience::policy::BackoffStrategy;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn scenario_policy() -> RetryPolicy {
        RetryPolicy::test()
            .with_max_attempts(3)
            .with_base_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_secs(1))
            .with_strategy(BackoffStrategy::Exponential)
            .with_backoff_factor(2.0)
            .with_jitter(false)
    }

    #[tokio::test]
    async fn test_succeeds_first_try() {
        let engine = RetryEngine::new();
        let result: Result<i32, RetryError<String>> = engine
            .execute("op", &RetryPolicy::test(), &CancellationToken::new(), || async { Ok(42) })
            .await;

        assert_eq!(result.unwrap(), 42);
        let stats = engine.stats();
        assert_eq!(stats.total_attempts, 1);
        assert_eq!(stats.total_delay, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let engine = RetryEngine::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let result = engine
            .execute("connect", &scenario_policy(), &CancellationToken::new(), || {
                let calls = calls_clone.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("connection refused".to_string())
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "ok");
        let stats = engine.stats();
        assert_eq!(stats.total_delay, Duration::from_millis(30));
        assert_eq!(stats.operations["connect"].attempts, 3);
        assert_eq!(stats.operations["connect"].successes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let engine = RetryEngine::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let result: Result<(), _> = engine
            .execute("poll", &scenario_policy(), &CancellationToken::new(), || {
                let calls = calls_clone.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    Err(format!("timeout #{n}"))
                }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(err.kind, ErrorKind::Transient);
        assert_eq!(err.last_error().map(String::as_str), Some("timeout #3"));
        assert_eq!(engine.stats().failed_attempts, 1);
        assert_eq!(engine.stats().total_delay, Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_non_retryable_runs_once() {
        let engine = RetryEngine::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let result: Result<(), _> = engine
            .execute("write", &scenario_policy(), &CancellationToken::new(), || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(SubstrateError::operation(ErrorKind::Integrity, "checksum mismatch"))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.unwrap_err().kind, ErrorKind::Integrity);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_delay() {
        let engine = RetryEngine::new();
        let cancel = CancellationToken::new();
        let policy = scenario_policy().with_base_delay(Duration::from_secs(60));

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            trigger.cancel();
        });

        let result: Result<(), _> = engine
            .execute("slow", &policy, &cancel, || async { Err("timeout".to_string()) })
            .await;

        let err = result.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.kind, ErrorKind::Cancelled);
        assert_eq!(err.attempts, 1);
        assert_eq!(engine.stats().failed_attempts, 1);
    }

    #[tokio::test]
    async fn test_pre_cancelled_records_failure() {
        let engine = RetryEngine::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<(), RetryError<String>> = engine
            .execute("never", &scenario_policy(), &cancel, || async { Ok(()) })
            .await;

        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(engine.stats().total_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_cancellation_with_deadline() {
        let engine = RetryEngine::new();
        let result: Result<(), RetryError<String>> = engine
            .execute_with_timeout(
                "hang",
                &scenario_policy(),
                &CancellationToken::new(),
                Duration::from_millis(100),
                || async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(())
                },
            )
            .await;

        let err = result.unwrap_err();
        assert!(matches!(err.cause, Cause::DeadlineExceeded));
        assert_eq!(err.kind, ErrorKind::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_runs_before_each_retry_only() {
        let engine = RetryEngine::new();
        let cleanups = Arc::new(AtomicUsize::new(0));
        let cleanups_clone = cleanups.clone();

        let result: Result<(), _> = engine
            .execute_with_cleanup(
                "partial_write",
                &scenario_policy(),
                &CancellationToken::new(),
                || async { Err("temporary failure".to_string()) },
                || {
                    let c = cleanups_clone.clone();
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                    }
                },
            )
            .await;

        assert!(result.is_err());
        // 3 attempts -> 2 retries -> 2 cleanups
        assert_eq!(cleanups.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_blocking_variant() {
        let engine = RetryEngine::new();
        let mut calls = 0;
        let policy = scenario_policy().with_base_delay(Duration::from_millis(1));

        let result = engine.execute_blocking("sync_read", &policy, &CancellationToken::new(), || {
            calls += 1;
            if calls < 2 {
                Err("database is locked".to_string())
            } else {
                Ok(calls)
            }
        });

        assert_eq!(result.unwrap(), 2);
        assert_eq!(engine.stats().operations["sync_read"].attempts, 2);
    }

    #[test]
    fn test_blocking_respects_cancel_during_sleep() {
        let engine = RetryEngine::new();
        let cancel = CancellationToken::new();
        let policy = scenario_policy().with_base_delay(Duration::from_secs(30));

        let trigger = cancel.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let result: Result<(), _> =
            engine.execute_blocking("sync", &policy, &cancel, || Err("timeout".to_string()));
        handle.join().unwrap();

        assert!(result.unwrap_err().is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_reset_stats() {
        let engine = RetryEngine::new();
        let _ = engine
            .execute("op", &RetryPolicy::test(), &CancellationToken::new(), || async {
                Ok::<_, String>(())
            })
            .await;
        engine.reset_stats();
        assert_eq!(engine.stats().total_attempts, 0);
    }

    #[tokio::test]
    async fn test_retry_error_display_has_context() {
        let engine = RetryEngine::new();
        let err = engine
            .execute("bad_query", &RetryPolicy::test(), &CancellationToken::new(), || async {
                Err::<(), _>(SubstrateError::operation(ErrorKind::Permanent, "no such column"))
            })
            .await
            .unwrap_err();

        let text = err.to_string();
        assert!(text.contains("bad_query"));
        assert!(text.contains("permanent"));
        assert!(text.contains("1 attempt"));
        assert!(text.contains("no such column"));
    }
}
