// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the substrate composition root.

use serde::Serialize;
use std::sync::Arc;

use crate::cache::CacheStats;
use crate::pool::{MonitorReport, PoolStats};
use crate::resilience::RetryStatsSnapshot;
use crate::retention::{
    ArtifactStore, Clock, DiskSpace, SchedulerStatus, SysinfoDiskSpace, SystemClock,
};
use crate::storage::SharedCacheClient;

/// Substrate lifecycle state.
///
/// ```text
/// Created → Running → ShuttingDown → Stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubstrateState {
    /// Built, background tasks not started
    Created,
    /// Health monitor and retention scheduler running
    Running,
    ShuttingDown,
    /// Background tasks stopped and the pool closed
    Stopped,
}

impl std::fmt::Display for SubstrateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// External collaborators the substrate is wired to.
pub struct Collaborators {
    pub artifact_store: Arc<dyn ArtifactStore>,
    pub disk: Arc<dyn DiskSpace>,
    pub clock: Arc<dyn Clock>,
    pub shared_cache: Option<Arc<dyn SharedCacheClient>>,
}

impl Collaborators {
    /// Real disk probe and wall clock, no shared cache tier.
    pub fn new(artifact_store: Arc<dyn ArtifactStore>) -> Self {
        Self {
            artifact_store,
            disk: Arc::new(SysinfoDiskSpace),
            clock: Arc::new(SystemClock),
            shared_cache: None,
        }
    }

    #[must_use]
    pub fn with_disk(mut self, disk: Arc<dyn DiskSpace>) -> Self {
        self.disk = disk;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_shared_cache(mut self, client: Option<Arc<dyn SharedCacheClient>>) -> Self {
        self.shared_cache = client;
        self
    }
}

/// Point-in-time view across all four components.
#[derive(Debug, Clone, Serialize)]
pub struct SubstrateHealth {
    pub state: SubstrateState,
    /// Latest monitor observation, if one has run
    pub monitor: Option<MonitorReport>,
    pub pool: PoolStats,
    pub cache: CacheStats,
    pub retry: RetryStatsSnapshot,
    pub retention: SchedulerStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(format!("{}", SubstrateState::Created), "Created");
        assert_eq!(format!("{}", SubstrateState::ShuttingDown), "ShuttingDown");
    }
}
