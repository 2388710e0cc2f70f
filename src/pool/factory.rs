// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Database adapter seam.
//!
//! [`ConnectionFactory`] is the async contract the pool depends on.
//! Synchronous drivers implement [`BlockingConnectionFactory`] instead and are
//! wrapped in [`Blocking`], which runs every driver call on the blocking
//! thread pool.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::warn;

use super::PoolError;

#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Send + 'static;

    async fn create(&self) -> Result<Self::Connection, PoolError>;

    /// Close a connection. Errors are the adapter's to log.
    async fn destroy(&self, conn: Self::Connection);

    /// Round-trip noop. `false` marks the connection broken.
    async fn probe(&self, conn: &mut Self::Connection) -> bool;

    /// Maintenance run by `optimize()` on a connection taken from the idle
    /// set, so never inside a caller's transaction.
    async fn optimize_hook(&self, _conn: &mut Self::Connection) -> Result<(), PoolError> {
        Ok(())
    }
}

/// Same contract as [`ConnectionFactory`] for synchronous drivers.
pub trait BlockingConnectionFactory: Send + Sync + 'static {
    type Connection: Send + 'static;

    fn create(&self) -> Result<Self::Connection, PoolError>;
    fn destroy(&self, conn: Self::Connection);
    fn probe(&self, conn: &mut Self::Connection) -> bool;

    fn optimize_hook(&self, _conn: &mut Self::Connection) -> Result<(), PoolError> {
        Ok(())
    }
}

/// Connection handed out by a [`Blocking`] pool. Lock it on the thread that
/// runs the synchronous driver call.
pub type BlockingConnection<C> = Arc<Mutex<C>>;

/// Adapts a [`BlockingConnectionFactory`] to the async pool.
pub struct Blocking<B> {
    factory: Arc<B>,
}

impl<B> Blocking<B> {
    pub fn new(factory: B) -> Self {
        Self {
            factory: Arc::new(factory),
        }
    }
}

fn join_error(e: tokio::task::JoinError) -> PoolError {
    PoolError::Create {
        kind: None,
        message: format!("blocking driver task failed: {e}"),
    }
}

#[async_trait]
impl<B: BlockingConnectionFactory> ConnectionFactory for Blocking<B> {
    type Connection = BlockingConnection<B::Connection>;

    async fn create(&self) -> Result<Self::Connection, PoolError> {
        let factory = Arc::clone(&self.factory);
        let conn = tokio::task::spawn_blocking(move || factory.create())
            .await
            .map_err(join_error)??;
        Ok(Arc::new(Mutex::new(conn)))
    }

    async fn destroy(&self, conn: Self::Connection) {
        let factory = Arc::clone(&self.factory);
        // A caller still holding a clone closes the driver connection on drop
        let result = tokio::task::spawn_blocking(move || {
            if let Ok(conn) = Arc::try_unwrap(conn) {
                factory.destroy(conn.into_inner());
            }
        })
        .await;
        if let Err(e) = result {
            warn!(error = %e, "Blocking destroy task failed");
        }
    }

    async fn probe(&self, conn: &mut Self::Connection) -> bool {
        let factory = Arc::clone(&self.factory);
        let conn = Arc::clone(conn);
        tokio::task::spawn_blocking(move || factory.probe(&mut conn.lock()))
            .await
            .unwrap_or(false)
    }

    async fn optimize_hook(&self, conn: &mut Self::Connection) -> Result<(), PoolError> {
        let factory = Arc::clone(&self.factory);
        let conn = Arc::clone(conn);
        tokio::task::spawn_blocking(move || factory.optimize_hook(&mut conn.lock()))
            .await
            .map_err(join_error)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct Counting {
        created: AtomicU32,
        destroyed: AtomicU32,
    }

    impl BlockingConnectionFactory for Counting {
        type Connection = u32;

        fn create(&self) -> Result<u32, PoolError> {
            Ok(self.created.fetch_add(1, Ordering::SeqCst) + 1)
        }

        fn destroy(&self, _conn: u32) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }

        fn probe(&self, conn: &mut u32) -> bool {
            *conn % 2 == 1
        }
    }

    #[tokio::test]
    async fn test_blocking_adapter_runs_driver_calls() {
        let adapter = Blocking::new(Counting::default());

        let mut first = adapter.create().await.unwrap();
        let mut second = adapter.create().await.unwrap();
        assert_eq!(*first.lock(), 1);
        assert!(adapter.probe(&mut first).await);
        assert!(!adapter.probe(&mut second).await);
        assert!(adapter.optimize_hook(&mut first).await.is_ok());

        adapter.destroy(first).await;
        adapter.destroy(second).await;
        assert_eq!(adapter.factory.destroyed.load(Ordering::SeqCst), 2);
    }
}
