// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry policies: when to retry and how long to wait.
//!
//! A [`RetryPolicy`] is an immutable value. Use the preset constructors and
//! override individual fields with the `with_*` builders.
//!
//! # Example
//!
//! ```
//! use telemetry_substrate::{BackoffStrategy, RetryPolicy};
//! use std::time::Duration;
//!
//! let db = RetryPolicy::database();
//! assert_eq!(db.max_attempts, 3);
//! assert_eq!(db.strategy, BackoffStrategy::Exponential);
//!
//! let quick = RetryPolicy::network()
//!     .with_max_attempts(2)
//!     .with_base_delay(Duration::from_millis(50))
//!     .with_jitter(false);
//! assert_eq!(quick.base_delay_for(2), Duration::from_millis(75));
//! ```

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::config::RetryOverrides;
use crate::error::{Classify, ErrorKind};

/// Floor applied to jittered delays.
pub const MIN_JITTERED_DELAY: Duration = Duration::from_millis(100);

/// Jitter amplitude as a fraction of the computed delay.
const JITTER_FRACTION: f64 = 0.1;

/// Messages that mark an untyped error as transient (matched case-insensitively).
pub const TRANSIENT_PATTERNS: &[&str] = &[
    "connection refused",
    "timeout",
    "temporary failure",
    "service unavailable",
    "database is locked",
    "no such host",
    "network unreachable",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Always `base_delay`
    Fixed,
    /// `base_delay * attempt`
    Linear,
    /// `base_delay * backoff_factor^(attempt - 1)`
    Exponential,
    /// Uniform in `[base_delay, max_delay]`
    Random,
}

/// Configuration for retrying a fallible operation.
///
/// Use the preset constructors for common patterns:
/// - [`RetryPolicy::database()`] - short exponential backoff for queries
/// - [`RetryPolicy::network()`] - patient backoff for device and remote I/O
/// - [`RetryPolicy::file_op()`] - quick linear retry for local files
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    pub backoff_factor: f64,
    pub jitter: bool,
    pub retryable: HashSet<ErrorKind>,
    pub non_retryable: HashSet<ErrorKind>,
    /// Fallback for untyped errors; see [`TRANSIENT_PATTERNS`]
    pub transient_patterns: Vec<String>,
    /// Log each failed attempt at warn level
    pub log_failures: bool,
    /// Extra delay multiplier after a [`ErrorKind::PoolExhausted`] failure
    pub pool_exhausted_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::database()
    }
}

impl RetryPolicy {
    fn base(
        max_attempts: u32,
        strategy: BackoffStrategy,
        base_delay: Duration,
        max_delay: Duration,
        backoff_factor: f64,
    ) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy,
            backoff_factor,
            jitter: true,
            retryable: HashSet::from([ErrorKind::Transient, ErrorKind::PoolExhausted]),
            non_retryable: HashSet::from([
                ErrorKind::Permanent,
                ErrorKind::Cancelled,
                ErrorKind::Integrity,
            ]),
            transient_patterns: TRANSIENT_PATTERNS.iter().map(|p| (*p).to_string()).collect(),
            log_failures: true,
            pool_exhausted_multiplier: 2.0,
        }
    }

    /// 3 attempts, exponential from 0.5s, capped at 5s.
    #[must_use]
    pub fn database() -> Self {
        Self::base(
            3,
            BackoffStrategy::Exponential,
            Duration::from_millis(500),
            Duration::from_secs(5),
            2.0,
        )
    }

    /// 5 attempts, exponential (factor 1.5) from 1s, capped at 30s.
    #[must_use]
    pub fn network() -> Self {
        Self::base(
            5,
            BackoffStrategy::Exponential,
            Duration::from_secs(1),
            Duration::from_secs(30),
            1.5,
        )
    }

    /// 3 attempts, linear from 0.1s, capped at 1s. Failures are not logged.
    #[must_use]
    pub fn file_op() -> Self {
        Self {
            log_failures: false,
            ..Self::base(
                3,
                BackoffStrategy::Linear,
                Duration::from_millis(100),
                Duration::from_secs(1),
                2.0,
            )
        }
    }

    /// Apply configured overrides on top of this preset.
    #[must_use]
    pub fn with_overrides(
        mut self,
        overrides: &RetryOverrides,
        pool_exhausted_multiplier: f64,
    ) -> Self {
        if let Some(n) = overrides.max_attempts {
            self.max_attempts = n;
        }
        if let Some(secs) = overrides.base_delay {
            self.base_delay = Duration::from_secs_f64(secs.max(0.0));
        }
        if let Some(secs) = overrides.max_delay {
            self.max_delay = Duration::from_secs_f64(secs.max(0.0));
        }
        if let Some(f) = overrides.backoff_factor {
            self.backoff_factor = f;
        }
        if let Some(s) = overrides.strategy {
            self.strategy = s;
        }
        if let Some(j) = overrides.jitter {
            self.jitter = j;
        }
        if let Some(l) = overrides.log_failures {
            self.log_failures = l;
        }
        self.pool_exhausted_multiplier = pool_exhausted_multiplier;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    #[must_use]
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    #[must_use]
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    #[must_use]
    pub fn with_log_failures(mut self, log_failures: bool) -> Self {
        self.log_failures = log_failures;
        self
    }

    /// Move `kind` into the retryable set.
    #[must_use]
    pub fn with_retryable(mut self, kind: ErrorKind) -> Self {
        self.non_retryable.remove(&kind);
        self.retryable.insert(kind);
        self
    }

    /// Move `kind` into the non-retryable set.
    #[must_use]
    pub fn with_non_retryable(mut self, kind: ErrorKind) -> Self {
        self.retryable.remove(&kind);
        self.non_retryable.insert(kind);
        self
    }

    /// Replace the transient-message fallback list.
    #[must_use]
    pub fn with_transient_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.transient_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Strategy delay for `attempt` (1-based), clamped to `[0, max_delay]`, before jitter.
    #[must_use]
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base = self.base_delay.as_secs_f64();
        let max = self.max_delay.as_secs_f64();
        let raw = match self.strategy {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Linear => base * f64::from(attempt),
            BackoffStrategy::Exponential => {
                let exp = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
                base * self.backoff_factor.powi(exp)
            }
            BackoffStrategy::Random => {
                if base >= max {
                    max
                } else {
                    rand::thread_rng().gen_range(base..=max)
                }
            }
        };
        Duration::from_secs_f64(clamp_secs(raw, max))
    }

    /// Sleep before the retry that follows a failure at `attempt` with error `kind`.
    ///
    /// Pool exhaustion stretches the delay by `pool_exhausted_multiplier`.
    /// Jitter (±10%) is applied after clamping and never yields less than 100ms.
    #[must_use]
    pub fn delay_for(&self, attempt: u32, kind: Option<ErrorKind>) -> Duration {
        let max = self.max_delay.as_secs_f64();
        let mut secs = self.base_delay_for(attempt).as_secs_f64();
        if kind == Some(ErrorKind::PoolExhausted) {
            secs = clamp_secs(secs * self.pool_exhausted_multiplier, max);
        }
        if !self.jitter {
            return Duration::from_secs_f64(secs);
        }
        let perturbation = rand::thread_rng().gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
        let jittered = Duration::from_secs_f64(clamp_secs(secs * (1.0 + perturbation), max));
        let ceiling = self.max_delay.max(MIN_JITTERED_DELAY);
        jittered.max(MIN_JITTERED_DELAY).min(ceiling)
    }

    /// True if `message` contains one of the transient patterns (case-insensitive).
    #[must_use]
    pub fn looks_transient(&self, message: &str) -> bool {
        let lowered = message.to_lowercase();
        self.transient_patterns
            .iter()
            .any(|p| lowered.contains(&p.to_lowercase()))
    }

    /// Kind used for reporting: the typed kind, else one inferred from the message.
    #[must_use]
    pub fn classify<E: Classify + ?Sized>(&self, error: &E) -> ErrorKind {
        error.kind().unwrap_or_else(|| {
            if self.looks_transient(&error.to_string()) {
                ErrorKind::Transient
            } else {
                ErrorKind::Permanent
            }
        })
    }

    /// Retry decision after a failure at `attempt` (1-based).
    #[must_use]
    pub fn should_retry<E: Classify + ?Sized>(&self, error: &E, attempt: u32) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }
        match error.kind() {
            Some(kind) if self.non_retryable.contains(&kind) => false,
            Some(kind) if self.retryable.contains(&kind) => true,
            _ => self.looks_transient(&error.to_string()),
        }
    }

    /// Fast policy for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            jitter: false,
            ..Self::base(
                3,
                BackoffStrategy::Exponential,
                Duration::from_millis(1),
                Duration::from_millis(10),
                2.0,
            )
        }
    }
}

fn clamp_secs(secs: f64, max: f64) -> f64 {
    if secs.is_nan() {
        return 0.0;
    }
    secs.clamp(0.0, max)
}
