// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Artifact retention: expiry rules, the artifact store seam, and the
//! scheduler that deletes expired exports and guards free disk space.
//!
//! # Artifact lifecycle
//!
//! ```text
//! active ──(within expiring window)──> expiring_soon ──(past expiry)──> deleted
//!    └───────────────(past expiry or storage emergency)─────────────────┘
//! ```
//!
//! Only the scheduler moves records between states, and a record reaches
//! `deleted` only after its file is gone.

pub mod artifact;
pub mod clock;
pub mod disk;
pub mod scheduler;
pub mod sql_store;
pub mod store;

pub use artifact::{ArtifactRecord, ArtifactStatus, RetentionRules, RuleSet};
pub use clock::{Clock, ManualClock, SystemClock};
pub use disk::{DiskSpace, SysinfoDiskSpace};
pub use scheduler::{
    CleanupReport, ReconcileReport, RetentionScheduler, SchedulerError, SchedulerHealth,
    SchedulerStatus, StorageLevel, TickReport,
};
pub use sql_store::SqlArtifactStore;
pub use store::{
    ArtifactCursor, ArtifactPage, ArtifactQuery, ArtifactStore, ArtifactStoreError,
    MemoryArtifactStore,
};
