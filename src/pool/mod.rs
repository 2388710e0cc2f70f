// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded connection pool with liveness probes and a background health monitor.
//!
//! # Connection lifecycle
//!
//! ```text
//! created → idle ↔ in-use → (released, healthy, fresh)  → idle
//!                         → (released, stale or broken) → destroyed
//!                         → (probe failure)             → broken → destroyed
//! ```
//!
//! Connections created above the nominal size are overflow connections and
//! are always destroyed on release. The pool is generic over exactly one
//! [`ConnectionFactory`], so async and blocking drivers never share a pool.

pub mod connection_pool;
pub mod factory;
pub mod monitor;
pub mod sql;

use thiserror::Error;

use crate::error::{Classify, ErrorKind};

pub use connection_pool::{
    ConnectionPool, HealthReport, HealthStatus, OptimizeReport, PoolStats, PooledConnection,
};
pub use factory::{Blocking, BlockingConnection, BlockingConnectionFactory, ConnectionFactory};
pub use monitor::{HealthMonitor, MonitorReport};
pub use sql::SqlConnectionFactory;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("pool exhausted: no connection available after {waited_ms} ms")]
    Exhausted { waited_ms: u64 },

    #[error("pool is closed")]
    Closed,

    #[error("failed to create connection: {message}")]
    Create {
        kind: Option<ErrorKind>,
        message: String,
    },

    #[error("acquire cancelled")]
    Cancelled,
}

impl PoolError {
    /// Wrap a driver error, keeping its classification.
    pub fn create<E: Classify + ?Sized>(error: &E) -> Self {
        Self::Create {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl Classify for PoolError {
    fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Exhausted { .. } => Some(ErrorKind::PoolExhausted),
            Self::Closed => Some(ErrorKind::Permanent),
            Self::Create { kind, .. } => *kind,
            Self::Cancelled => Some(ErrorKind::Cancelled),
        }
    }
}
