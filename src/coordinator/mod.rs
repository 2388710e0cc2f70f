// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Composition root.
//!
//! [`Substrate`] builds the four components from one [`SubstrateConfig`] and
//! owns them for the life of the process:
//! - retry engine with process-wide statistics
//! - two-tier cache (fast LRU, optional shared tier behind a breaker)
//! - connection pool plus its background health monitor
//! - retention scheduler
//!
//! Leaf code never reaches for globals; everything it needs is handed out
//! from here.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use telemetry_substrate::coordinator::{Collaborators, Substrate};
//! use telemetry_substrate::pool::SqlConnectionFactory;
//! use telemetry_substrate::retention::MemoryArtifactStore;
//! use telemetry_substrate::SubstrateConfig;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), telemetry_substrate::SubstrateError> {
//! let config = SubstrateConfig::default();
//! let factory = SqlConnectionFactory::new("sqlite::memory:");
//! let collaborators = Collaborators::new(Arc::new(MemoryArtifactStore::new()));
//!
//! let substrate = Substrate::new(config, factory, collaborators)?;
//! substrate.start()?;
//! // ... serve traffic ...
//! substrate.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod api;
mod lifecycle;
mod types;

pub use types::{Collaborators, SubstrateHealth, SubstrateState};

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cache::{CacheError, TieredCache};
use crate::config::{CacheConfig, SubstrateConfig};
use crate::error::SubstrateError;
use crate::pool::{ConnectionFactory, ConnectionPool, HealthMonitor};
use crate::resilience::{RetryEngine, RetryPolicy};
use crate::retention::RetentionScheduler;
use crate::storage::{RedisSharedCache, SharedCacheClient};

struct Background {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Substrate<F: ConnectionFactory> {
    config: SubstrateConfig,
    retry: RetryEngine,
    cache: Arc<TieredCache>,
    pool: ConnectionPool<F>,
    monitor: Arc<HealthMonitor<F>>,
    scheduler: Arc<RetentionScheduler>,
    /// Policy for `query` and `write`
    database_policy: RetryPolicy,
    state: watch::Sender<SubstrateState>,
    /// Health monitor task, present while running
    background: Mutex<Option<Background>>,
}

impl<F: ConnectionFactory> Substrate<F> {
    /// Validate `config` and build every component. Nothing runs until [`start`](Self::start).
    pub fn new(
        config: SubstrateConfig,
        factory: F,
        collaborators: Collaborators,
    ) -> Result<Self, SubstrateError> {
        config.validate()?;

        let retry = RetryEngine::new();
        let cache = Arc::new(TieredCache::new(&config.cache, collaborators.shared_cache));
        let pool = ConnectionPool::new(factory, &config.pool);
        let monitor = Arc::new(HealthMonitor::new(
            pool.clone(),
            retry.clone(),
            config.health.clone(),
        ));
        let scheduler = Arc::new(
            RetentionScheduler::new(
                config.retention.clone(),
                collaborators.artifact_store,
                collaborators.disk,
                collaborators.clock,
                retry.clone(),
            )
            .with_store_policy(config.retry.database_policy())
            .with_file_policy(config.retry.file_op_policy()),
        );
        let (state, _) = watch::channel(SubstrateState::Created);

        info!(
            pool_size = config.pool.size,
            max_overflow = config.pool.max_overflow,
            fast_entries = config.cache.fast.max_entries,
            shared_tier = cache.has_shared_tier(),
            "Substrate built"
        );

        Ok(Self {
            database_policy: config.retry.database_policy(),
            config,
            retry,
            cache,
            pool,
            monitor,
            scheduler,
            state,
            background: Mutex::new(None),
        })
    }

    /// Connect the Redis shared tier named by `cache.shared.url`, if any.
    pub async fn connect_shared_cache(
        config: &CacheConfig,
    ) -> Result<Option<Arc<dyn SharedCacheClient>>, SubstrateError> {
        let Some(url) = config.shared.url.as_deref() else {
            return Ok(None);
        };
        let client = RedisSharedCache::connect(url, &RetryEngine::new())
            .await
            .map_err(CacheError::Backend)?;
        Ok(Some(Arc::new(client)))
    }

    #[must_use]
    pub fn config(&self) -> &SubstrateConfig {
        &self.config
    }

    #[must_use]
    pub fn retry(&self) -> &RetryEngine {
        &self.retry
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    #[must_use]
    pub fn pool(&self) -> &ConnectionPool<F> {
        &self.pool
    }

    #[must_use]
    pub fn monitor(&self) -> &Arc<HealthMonitor<F>> {
        &self.monitor
    }

    #[must_use]
    pub fn scheduler(&self) -> &Arc<RetentionScheduler> {
        &self.scheduler
    }

    #[must_use]
    pub fn state(&self) -> SubstrateState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<SubstrateState> {
        self.state.subscribe()
    }

    /// Zero the retry statistics. Only the composition root can do this.
    pub fn reset_retry_stats(&self) {
        self.retry.reset_stats();
    }
}
