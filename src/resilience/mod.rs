// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry policies, the retry engine, and the shared-tier circuit breaker.

pub mod circuit_breaker;
pub mod policy;
pub mod retry;
pub mod stats;

pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, CircuitState};
pub use policy::{BackoffStrategy, RetryPolicy, TRANSIENT_PATTERNS};
pub use retry::{Cause, RetryEngine, RetryError};
pub use stats::{OperationStats, RetryStats, RetryStatsSnapshot};
