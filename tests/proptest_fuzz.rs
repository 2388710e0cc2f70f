// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Property-based tests (fuzzing) for substrate invariants.
//!
//! Uses proptest to generate random policies, patterns, byte strings and
//! acquire/release sequences, and checks that bounds hold and nothing panics.
//!
//! Run with: `cargo test --test proptest_fuzz`

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use proptest::prelude::*;

use telemetry_substrate::cache::codec::{self, Encoding};
use telemetry_substrate::cache::glob::glob_match;
use telemetry_substrate::cache::tiered::escape_glob;
use telemetry_substrate::cache::normalize_query;
use telemetry_substrate::config::PoolConfig;
use telemetry_substrate::pool::{ConnectionFactory, ConnectionPool, PoolError, PooledConnection};
use telemetry_substrate::{BackoffStrategy, ErrorKind, RetryPolicy};

// =============================================================================
// Strategies for generating test data
// =============================================================================

fn strategy_strategy() -> impl Strategy<Value = BackoffStrategy> {
    prop_oneof![
        Just(BackoffStrategy::Fixed),
        Just(BackoffStrategy::Linear),
        Just(BackoffStrategy::Exponential),
        Just(BackoffStrategy::Random),
    ]
}

/// Policies with `max_delay >= 100ms`, the floor jitter never goes below.
fn policy_strategy() -> impl Strategy<Value = RetryPolicy> {
    (
        1u32..12,
        0u64..5_000,
        100u64..60_000,
        1.0f64..4.0,
        strategy_strategy(),
        any::<bool>(),
    )
        .prop_map(|(attempts, base_ms, max_ms, factor, strategy, jitter)| {
            RetryPolicy::database()
                .with_max_attempts(attempts)
                .with_base_delay(Duration::from_millis(base_ms))
                .with_max_delay(Duration::from_millis(max_ms))
                .with_backoff_factor(factor)
                .with_strategy(strategy)
                .with_jitter(jitter)
        })
}

fn error_kind_strategy() -> impl Strategy<Value = Option<ErrorKind>> {
    prop_oneof![
        Just(None),
        Just(Some(ErrorKind::Transient)),
        Just(Some(ErrorKind::PoolExhausted)),
    ]
}

/// Keys shaped like cache keys, glob metacharacters included.
fn key_strategy() -> impl Strategy<Value = String> {
    "[a-z0-9:_*?\\[\\]\\\\-]{0,24}"
}

// =============================================================================
// Retry delay bounds
// =============================================================================

proptest! {
    /// Every delay is capped by max_delay, and jittered delays never drop below 100ms
    #[test]
    fn prop_delay_within_bounds(
        policy in policy_strategy(),
        kind in error_kind_strategy(),
        attempt_seed in any::<u32>(),
    ) {
        let attempt = attempt_seed % policy.max_attempts + 1;
        let delay = policy.delay_for(attempt, kind);
        prop_assert!(delay <= policy.max_delay, "{delay:?} > {:?}", policy.max_delay);
        if policy.jitter {
            prop_assert!(delay >= Duration::from_millis(100), "{delay:?} below jitter floor");
        }
    }

    /// Unjittered exponential delays never shrink from one attempt to the next
    #[test]
    fn prop_exponential_is_monotonic(policy in policy_strategy(), attempt in 1u32..30) {
        let policy = policy.with_strategy(BackoffStrategy::Exponential).with_jitter(false);
        prop_assert!(policy.base_delay_for(attempt) <= policy.base_delay_for(attempt + 1));
    }

    /// Zero base delay without jitter means no sleep at all
    #[test]
    fn prop_zero_base_no_sleep(attempt in 1u32..20, strategy in strategy_strategy()) {
        prop_assume!(strategy != BackoffStrategy::Random);
        let policy = RetryPolicy::network()
            .with_base_delay(Duration::ZERO)
            .with_strategy(strategy)
            .with_jitter(false);
        prop_assert_eq!(policy.delay_for(attempt, None), Duration::ZERO);
    }

    /// The last permitted attempt is never retried
    #[test]
    fn prop_no_retry_past_max_attempts(policy in policy_strategy(), message in ".*") {
        let error = format!("timeout: {message}");
        prop_assert!(!policy.should_retry(&error, policy.max_attempts));
    }
}

// =============================================================================
// Glob matching
// =============================================================================

proptest! {
    /// An escaped literal matches exactly itself
    #[test]
    fn prop_escaped_literal_matches_itself(key in key_strategy()) {
        prop_assert!(glob_match(&escape_glob(&key), &key));
    }

    /// An escaped literal never matches a longer key
    #[test]
    fn prop_escaped_literal_is_exact(key in key_strategy(), suffix in "[a-z]{1,5}") {
        let longer = format!("{key}{suffix}");
        prop_assert!(!glob_match(&escape_glob(&key), &longer));
    }

    /// `prefix*` selects every key under the prefix
    #[test]
    fn prop_prefix_star_matches(prefix in key_strategy(), rest in key_strategy()) {
        let pattern = format!("{}*", escape_glob(&prefix));
        let key = format!("{prefix}{rest}");
        prop_assert!(glob_match(&pattern, &key));
    }

    /// Arbitrary patterns never panic, malformed classes included
    #[test]
    fn prop_glob_never_panics(pattern in ".{0,32}", text in ".{0,32}") {
        let _ = glob_match(&pattern, &text);
    }
}

// =============================================================================
// Codec and query normalization
// =============================================================================

proptest! {
    /// Decoding garbage fails cleanly
    #[test]
    fn fuzz_decode_random_bytes(bytes in prop::collection::vec(any::<u8>(), 0..4096)) {
        let _ = codec::decode::<serde_json::Value>(&bytes);
        let _ = codec::decode::<HashMap<String, i64>>(&bytes);
    }

    /// A binary marker followed by garbage is rejected, not misread
    #[test]
    fn fuzz_decode_corrupted_binary(tail in prop::collection::vec(any::<u8>(), 0..256)) {
        let mut bytes = codec::BINARY_MAGIC.to_vec();
        bytes.extend_from_slice(&tail);
        let _ = codec::decode::<HashMap<(u8, u8), String>>(&bytes);
    }

    /// Maps JSON cannot key fall back to the binary encoding and survive it
    #[test]
    fn prop_tuple_keyed_map_uses_binary(
        entries in prop::collection::hash_map((any::<u8>(), any::<u8>()), ".{0,8}", 1..16),
    ) {
        let bytes = codec::encode(&entries).unwrap();
        prop_assert_eq!(codec::encoding_of(&bytes), Encoding::Binary);
        let decoded: HashMap<(u8, u8), String> = codec::decode(&bytes).unwrap();
        prop_assert_eq!(decoded, entries);
    }

    /// Whitespace layout never changes a query's cache identity
    #[test]
    fn prop_normalize_query_ignores_layout(
        words in prop::collection::vec("[a-zA-Z_=?]{1,8}", 1..10),
    ) {
        let spaced = format!("  {}\n", words.join("   \n\t "));
        let single = words.join(" ");
        prop_assert_eq!(normalize_query(&spaced), single);
    }
}

// =============================================================================
// Pool accounting
// =============================================================================

#[derive(Default)]
struct Counter {
    next: AtomicU32,
}

#[async_trait]
impl ConnectionFactory for Counter {
    type Connection = u32;

    async fn create(&self) -> Result<u32, PoolError> {
        Ok(self.next.fetch_add(1, Ordering::SeqCst))
    }

    async fn destroy(&self, _conn: u32) {}

    async fn probe(&self, _conn: &mut u32) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
enum PoolOp {
    Acquire,
    Release(usize),
    MarkBroken(usize),
}

fn pool_op_strategy() -> impl Strategy<Value = PoolOp> {
    prop_oneof![
        3 => Just(PoolOp::Acquire),
        2 => any::<usize>().prop_map(PoolOp::Release),
        1 => any::<usize>().prop_map(PoolOp::MarkBroken),
    ]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// `active + idle <= size + max_overflow` after every operation
    #[test]
    fn prop_pool_never_exceeds_capacity(
        size in 0usize..5,
        max_overflow in 0usize..4,
        ops in prop::collection::vec(pool_op_strategy(), 1..60),
    ) {
        prop_assume!(size + max_overflow > 0);
        let capacity = size + max_overflow;
        runtime().block_on(async {
            let config = PoolConfig {
                size,
                max_overflow,
                acquire_timeout_s: 0.01,
                min_size: 0,
                ..PoolConfig::default()
            };
            let pool = ConnectionPool::new(Counter::default(), &config);
            let mut held: Vec<PooledConnection<Counter>> = Vec::new();

            for op in ops {
                match op {
                    PoolOp::Acquire => match pool.acquire().await {
                        Ok(conn) => held.push(conn),
                        Err(e) => {
                            prop_assert!(matches!(e, PoolError::Exhausted { .. }), "expected PoolError::Exhausted");
                            prop_assert_eq!(held.len(), capacity);
                        }
                    },
                    PoolOp::Release(i) if !held.is_empty() => {
                        let conn = held.swap_remove(i % held.len());
                        drop(conn);
                    }
                    PoolOp::MarkBroken(i) if !held.is_empty() => {
                        let idx = i % held.len();
                        let mut conn = held.swap_remove(idx);
                        conn.mark_broken();
                    }
                    _ => {}
                }
                let stats = pool.stats();
                prop_assert_eq!(stats.active, held.len());
                prop_assert!(stats.active + stats.idle <= capacity);
                prop_assert!(stats.idle <= size);
            }

            drop(held);
            let stats = pool.stats();
            prop_assert_eq!(stats.active, 0);
            if size == 0 {
                // Overflow-only pools keep nothing idle
                prop_assert_eq!(stats.idle, 0);
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}
