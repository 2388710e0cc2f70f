// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Artifact store seam and an in-memory implementation.
//!
//! Listing is keyset-paginated on `(created_at, artifact_id)`, oldest first,
//! so callers can update records while paging without skipping or
//! repeating any.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::artifact::{ArtifactRecord, ArtifactStatus};
use crate::error::{Classify, ErrorKind};

#[derive(Error, Debug)]
pub enum ArtifactStoreError {
    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("artifact {id} is {actual}, expected {expected}")]
    Conflict {
        id: String,
        expected: ArtifactStatus,
        actual: ArtifactStatus,
    },

    #[error("file operation failed on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("artifact store backend error: {0}")]
    Backend(String),

    #[error("artifact store query failed: {0}")]
    Sql(#[from] sqlx::Error),
}

impl Classify for ArtifactStoreError {
    fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::NotFound(_) | Self::Conflict { .. } => Some(ErrorKind::Permanent),
            Self::Io { source, .. } => Classify::kind(source),
            Self::Backend(_) => None,
            Self::Sql(e) => Classify::kind(e),
        }
    }
}

/// Position after the last record of a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactCursor {
    pub created_at: DateTime<Utc>,
    pub artifact_id: String,
}

impl ArtifactCursor {
    fn of(record: &ArtifactRecord) -> Self {
        Self {
            created_at: record.created_at,
            artifact_id: record.artifact_id.clone(),
        }
    }
}

/// Filter for [`ArtifactStore::list`]. Empty `statuses` matches any status.
#[derive(Debug, Clone)]
pub struct ArtifactQuery {
    pub statuses: Vec<ArtifactStatus>,
    /// Only records whose `expires_at` is set and at or before this instant
    pub expires_before: Option<DateTime<Utc>>,
    /// Only records with no `expires_at`
    pub missing_expiry: bool,
    pub after: Option<ArtifactCursor>,
    pub limit: usize,
}

impl Default for ArtifactQuery {
    fn default() -> Self {
        Self {
            statuses: Vec::new(),
            expires_before: None,
            missing_expiry: false,
            after: None,
            limit: 50,
        }
    }
}

impl ArtifactQuery {
    /// Records the scheduler still manages: active or expiring soon.
    #[must_use]
    pub fn live() -> Self {
        Self {
            statuses: vec![ArtifactStatus::Active, ArtifactStatus::ExpiringSoon],
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_statuses(mut self, statuses: &[ArtifactStatus]) -> Self {
        self.statuses = statuses.to_vec();
        self
    }

    #[must_use]
    pub fn expires_before(mut self, at: DateTime<Utc>) -> Self {
        self.expires_before = Some(at);
        self
    }

    #[must_use]
    pub fn missing_expiry(mut self) -> Self {
        self.missing_expiry = true;
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    #[must_use]
    pub fn after(mut self, cursor: Option<ArtifactCursor>) -> Self {
        self.after = cursor;
        self
    }

    /// Whether `record` passes every filter except the cursor.
    #[must_use]
    pub fn matches(&self, record: &ArtifactRecord) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&record.status) {
            return false;
        }
        if let Some(before) = self.expires_before {
            if !record.expires_at.is_some_and(|t| t <= before) {
                return false;
            }
        }
        !(self.missing_expiry && record.expires_at.is_some())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ArtifactPage {
    pub records: Vec<ArtifactRecord>,
    /// Set when the page was full; pass it back as `ArtifactQuery::after`
    pub next: Option<ArtifactCursor>,
}

impl ArtifactPage {
    /// Build a page from at most `limit` records in cursor order.
    #[must_use]
    pub fn from_records(records: Vec<ArtifactRecord>, limit: usize) -> Self {
        let next = if records.len() >= limit {
            records.last().map(ArtifactCursor::of)
        } else {
            None
        };
        Self { records, next }
    }
}

/// Where artifact records live, plus the file primitives the scheduler uses.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn list(&self, query: &ArtifactQuery) -> Result<ArtifactPage, ArtifactStoreError>;

    async fn set_expiry(
        &self,
        id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), ArtifactStoreError>;

    /// Move `id` from `from` to `to`. Fails with `Conflict` if the record is
    /// no longer in `from`.
    async fn transition(
        &self,
        id: &str,
        from: ArtifactStatus,
        to: ArtifactStatus,
    ) -> Result<(), ArtifactStoreError>;

    /// Remove the artifact's file. A file that is already gone is not an error.
    async fn delete_file(&self, path: &Path) -> Result<(), ArtifactStoreError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ArtifactStoreError::Io {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    async fn file_exists(&self, path: &Path) -> Result<bool, ArtifactStoreError> {
        tokio::fs::try_exists(path)
            .await
            .map_err(|e| ArtifactStoreError::Io {
                path: path.to_path_buf(),
                source: e,
            })
    }
}

type RecordKey = (DateTime<Utc>, String);

/// In-memory artifact store. By default file operations hit the real
/// filesystem; [`MemoryArtifactStore::with_virtual_files`] tracks files in
/// memory instead.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    records: RwLock<BTreeMap<RecordKey, ArtifactRecord>>,
    virtual_files: Option<RwLock<HashSet<PathBuf>>>,
}

impl MemoryArtifactStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_virtual_files() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            virtual_files: Some(RwLock::new(HashSet::new())),
        }
    }

    /// Insert or replace a record. With virtual files, its file is created too.
    pub fn insert(&self, record: ArtifactRecord) {
        if let Some(files) = &self.virtual_files {
            if record.status != ArtifactStatus::Deleted {
                files.write().insert(record.file_path.clone());
            }
        }
        let mut records = self.records.write();
        records.retain(|_, r| r.artifact_id != record.artifact_id);
        records.insert(
            (record.created_at, record.artifact_id.clone()),
            record,
        );
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<ArtifactRecord> {
        self.records
            .read()
            .values()
            .find(|r| r.artifact_id == id)
            .cloned()
    }

    #[must_use]
    pub fn records(&self) -> Vec<ArtifactRecord> {
        self.records.read().values().cloned().collect()
    }

    /// Remove a virtual file without touching its record.
    pub fn remove_virtual_file(&self, path: &Path) -> bool {
        self.virtual_files
            .as_ref()
            .is_some_and(|files| files.write().remove(path))
    }

    fn with_record<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut ArtifactRecord) -> Result<T, ArtifactStoreError>,
    ) -> Result<T, ArtifactStoreError> {
        let mut records = self.records.write();
        let record = records
            .values_mut()
            .find(|r| r.artifact_id == id)
            .ok_or_else(|| ArtifactStoreError::NotFound(id.to_string()))?;
        f(record)
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn list(&self, query: &ArtifactQuery) -> Result<ArtifactPage, ArtifactStoreError> {
        use std::ops::Bound;

        let records = self.records.read();
        let lower = match &query.after {
            Some(c) => Bound::Excluded((c.created_at, c.artifact_id.clone())),
            None => Bound::Unbounded,
        };
        let page: Vec<ArtifactRecord> = records
            .range((lower, Bound::Unbounded))
            .map(|(_, r)| r)
            .filter(|r| query.matches(r))
            .take(query.limit)
            .cloned()
            .collect();
        Ok(ArtifactPage::from_records(page, query.limit))
    }

    async fn set_expiry(
        &self,
        id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), ArtifactStoreError> {
        self.with_record(id, |record| {
            record.expires_at = Some(expires_at);
            Ok(())
        })
    }

    async fn transition(
        &self,
        id: &str,
        from: ArtifactStatus,
        to: ArtifactStatus,
    ) -> Result<(), ArtifactStoreError> {
        self.with_record(id, |record| {
            if record.status != from {
                return Err(ArtifactStoreError::Conflict {
                    id: id.to_string(),
                    expected: from,
                    actual: record.status,
                });
            }
            record.status = to;
            Ok(())
        })
    }

    async fn delete_file(&self, path: &Path) -> Result<(), ArtifactStoreError> {
        match &self.virtual_files {
            Some(files) => {
                files.write().remove(path);
                Ok(())
            }
            None => match tokio::fs::remove_file(path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(ArtifactStoreError::Io {
                    path: path.to_path_buf(),
                    source: e,
                }),
            },
        }
    }

    async fn file_exists(&self, path: &Path) -> Result<bool, ArtifactStoreError> {
        match &self.virtual_files {
            Some(files) => Ok(files.read().contains(path)),
            None => tokio::fs::try_exists(path)
                .await
                .map_err(|e| ArtifactStoreError::Io {
                    path: path.to_path_buf(),
                    source: e,
                }),
        }
    }
}
