// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Telemetry Substrate
//!
//! The reliability layer between device-facing I/O and the rest of a
//! telemetry ingestion process.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Caller operations                       │
//! │  • store reading, run query, write export file             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      A: Retry Engine                        │
//! │  • Typed error kinds, curated transient fallback           │
//! │  • Fixed / linear / exponential / random backoff           │
//! │  • Process-wide statistics                                 │
//! └─────────────────────────────────────────────────────────────┘
//!                 │ reads                    │ writes
//!                 ▼                          │
//! ┌───────────────────────────────┐          │
//! │        B: Two-Tier Cache      │◄─────────┤ invalidate
//! │  • Fast LRU + shared tier     │          │
//! │  • Promotion, glob delete     │          │
//! └───────────────────────────────┘          │
//!                 │ miss                     │
//!                 ▼                          ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              C: Connection Pool + Health Monitor            │
//! │  • Bounded size with overflow, FIFO waiters                │
//! │  • Idle probes, recycling, optimize on repeated failure    │
//! └─────────────────────────────────────────────────────────────┘
//!
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  D: Retention Scheduler                     │
//! │  • Daily expiry maintenance, storage watch                 │
//! │  • Emergency cleanup, startup reconciliation               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use telemetry_substrate::coordinator::{Collaborators, Substrate};
//! use telemetry_substrate::pool::SqlConnectionFactory;
//! use telemetry_substrate::retention::SqlArtifactStore;
//! use telemetry_substrate::{SubstrateConfig, SubstrateError};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), SubstrateError> {
//!     let config = SubstrateConfig::from_flat_map([
//!         ("pool.size".to_string(), "8".into()),
//!         ("retention.rules.csv".to_string(), "14".into()),
//!     ])?;
//!
//!     let url = "sqlite://telemetry.db?mode=rwc";
//!     let artifacts = Arc::new(SqlArtifactStore::connect(url).await?);
//!     let shared = Substrate::<SqlConnectionFactory>::connect_shared_cache(&config.cache).await?;
//!     let collaborators = Collaborators::new(artifacts).with_shared_cache(shared);
//!
//!     let substrate = Substrate::new(config, SqlConnectionFactory::new(url), collaborators)?;
//!     substrate.start()?;
//!
//!     let online: i64 = substrate
//!         .query("SELECT COUNT(*) FROM device WHERE online = ?", &[1], |mut conn| async move {
//!             let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM device WHERE online = 1")
//!                 .fetch_one(&mut *conn)
//!                 .await?;
//!             Ok::<_, SubstrateError>(row.0)
//!         })
//!         .await?;
//!     println!("{online} devices online");
//!
//!     substrate.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`resilience`]: Retry policies, the retry engine, the shared-tier circuit breaker
//! - [`cache`]: Fast tier, tiered cache, memoizer, per-query TTL helper
//! - [`storage`]: Shared cache clients (Redis, in-memory)
//! - [`pool`]: Connection pool, factories, health monitor
//! - [`retention`]: Artifact records, stores, retention scheduler
//! - [`coordinator`]: The [`Substrate`](coordinator::Substrate) composition root
//! - [`config`]: Nested config with a flat-key loader

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod redact;
pub mod resilience;
pub mod retention;
pub mod storage;

pub use cache::{CacheError, CacheStats, Memoized, TieredCache};
pub use config::{ConfigError, SubstrateConfig};
pub use coordinator::{Collaborators, Substrate, SubstrateHealth, SubstrateState};
pub use error::{Classify, ErrorKind, SubstrateError};
pub use pool::{ConnectionFactory, ConnectionPool, HealthMonitor, PoolError, PooledConnection};
pub use resilience::{BackoffStrategy, RetryEngine, RetryError, RetryPolicy};
pub use retention::{ArtifactRecord, ArtifactStatus, ArtifactStore, RetentionScheduler};
pub use storage::{SharedCacheClient, StorageError};
