// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Caller-facing operations: cached reads and invalidating writes.
//!
//! ```text
//! query: cache ──hit──► value
//!          │ miss
//!          ▼
//!        retry ⟲ (acquire ► run ► release) ──► cache.set ──► value
//!
//! write: retry ⟲ (acquire ► run ► release) ──► delete_pattern(each) ──► value
//! ```
//!
//! The connection is moved into the caller's closure and released when its
//! future completes, so it is never held across a backoff sleep.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Substrate, SubstrateHealth};
use crate::error::SubstrateError;
use crate::pool::{ConnectionFactory, PooledConnection};

impl<F: ConnectionFactory> Substrate<F> {
    /// Serve `sql` from cache, or run it on a pooled connection under the
    /// database retry policy and cache the result with the query's TTL.
    pub async fn query<T, P, Q, Fut>(
        &self,
        sql: &str,
        params: &P,
        run: Q,
    ) -> Result<T, SubstrateError>
    where
        T: Serialize + DeserializeOwned,
        P: Serialize + ?Sized,
        Q: Fn(PooledConnection<F>) -> Fut,
        Fut: Future<Output = Result<T, SubstrateError>>,
    {
        self.query_with_cancel(sql, params, &CancellationToken::new(), run)
            .await
    }

    /// [`query`](Self::query) with a cancellation token for the retry loop
    /// and any wait for a connection.
    pub async fn query_with_cancel<T, P, Q, Fut>(
        &self,
        sql: &str,
        params: &P,
        cancel: &CancellationToken,
        run: Q,
    ) -> Result<T, SubstrateError>
    where
        T: Serialize + DeserializeOwned,
        P: Serialize + ?Sized,
        Q: Fn(PooledConnection<F>) -> Fut,
        Fut: Future<Output = Result<T, SubstrateError>>,
    {
        let run = &run;
        self.cache
            .cached_query(sql, params, || async {
                self.retry
                    .execute("db_query", &self.database_policy, cancel, || async move {
                        let conn = self.pool.acquire_with_cancel(cancel).await?;
                        run(conn).await
                    })
                    .await
                    .map_err(SubstrateError::from)
            })
            .await
    }

    /// Run a write on a pooled connection under the database retry policy,
    /// then drop every cache entry matching one of `invalidate`.
    ///
    /// Patterns are globs relative to the cache prefix; cached queries live
    /// under `query:<table>:*`.
    pub async fn write<T, Q, Fut>(
        &self,
        name: &str,
        invalidate: &[&str],
        run: Q,
    ) -> Result<T, SubstrateError>
    where
        Q: Fn(PooledConnection<F>) -> Fut,
        Fut: Future<Output = Result<T, SubstrateError>>,
    {
        let cancel = CancellationToken::new();
        let cancel = &cancel;
        let run = &run;
        let value = self
            .retry
            .execute(name, &self.database_policy, cancel, || async move {
                let conn = self.pool.acquire_with_cancel(cancel).await?;
                run(conn).await
            })
            .await?;

        for pattern in invalidate {
            let removed = self.cache.delete_pattern(pattern).await;
            debug!(operation = %name, pattern = %pattern, removed, "Invalidated cache after write");
        }
        Ok(value)
    }

    /// Snapshot of every component.
    #[must_use]
    pub fn health(&self) -> SubstrateHealth {
        SubstrateHealth {
            state: self.state(),
            monitor: self.monitor.report(),
            pool: self.pool.stats(),
            cache: self.cache.stats(),
            retry: self.retry.stats(),
            retention: self.scheduler.status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::coordinator::{Collaborators, Substrate, SubstrateState};
    use crate::error::{ErrorKind, SubstrateError};
    use crate::pool::{ConnectionFactory, PoolError};
    use crate::retention::{ManualClock, MemoryArtifactStore};
    use crate::SubstrateConfig;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Connections are numbered; every query bumps a shared counter.
    #[derive(Default)]
    struct Numbered {
        next: AtomicU32,
    }

    #[async_trait]
    impl ConnectionFactory for Numbered {
        type Connection = u32;

        async fn create(&self) -> Result<u32, PoolError> {
            Ok(self.next.fetch_add(1, Ordering::SeqCst))
        }

        async fn destroy(&self, _conn: u32) {}

        async fn probe(&self, _conn: &mut u32) -> bool {
            true
        }
    }

    fn substrate() -> Substrate<Numbered> {
        let store = Arc::new(MemoryArtifactStore::with_virtual_files());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 2, 1, 12, 0, 0).unwrap()));
        Substrate::new(
            SubstrateConfig::default(),
            Numbered::default(),
            Collaborators::new(store).with_clock(clock),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_query_runs_once_then_hits_cache() {
        let substrate = substrate();
        let calls = AtomicU32::new(0);
        let sql = "SELECT watts FROM reading WHERE device_id = ?";

        for _ in 0..3 {
            let watts: f64 = substrate
                .query(sql, &[7], |_conn| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(231.5)
                })
                .await
                .unwrap();
            assert!((watts - 231.5).abs() < f64::EPSILON);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(substrate.pool().stats().active, 0);
    }

    #[tokio::test]
    async fn test_write_invalidates_table_queries() {
        let substrate = substrate();
        let calls = AtomicU32::new(0);
        let sql = "SELECT name FROM device WHERE id = ?";
        let read = || {
            substrate.query(sql, &[1], |_conn| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok("plug-1".to_string())
            })
        };

        read().await.unwrap();
        read().await.unwrap();
        substrate
            .write("rename_device", &["query:device:*"], |_conn| async { Ok(()) })
            .await
            .unwrap();
        read().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_surfaces_structured_error() {
        let substrate = substrate();
        let err = substrate
            .write("bad_insert", &[], |_conn| async {
                Err::<(), _>(SubstrateError::operation(
                    ErrorKind::Permanent,
                    "column count mismatch",
                ))
            })
            .await
            .unwrap_err();
        match err {
            SubstrateError::Exhausted { operation, kind, attempts, message, .. } => {
                assert_eq!(operation, "bad_insert");
                assert_eq!(kind, ErrorKind::Permanent);
                assert_eq!(attempts, 1);
                assert!(message.contains("column count mismatch"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(substrate.retry().stats().failed_attempts, 1);
        substrate.reset_retry_stats();
        assert_eq!(substrate.retry().stats().failed_attempts, 0);
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let substrate = substrate();
        assert_eq!(substrate.state(), SubstrateState::Created);
        substrate.start().unwrap();
        assert_eq!(substrate.state(), SubstrateState::Running);
        assert!(substrate.start().is_err());
        assert!(substrate.health().retention.running);

        substrate.shutdown().await;
        assert_eq!(substrate.state(), SubstrateState::Stopped);
        assert!(substrate.pool().is_closed());
        assert!(!substrate.scheduler().is_running());
    }
}
