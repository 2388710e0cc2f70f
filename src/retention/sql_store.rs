// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL-backed artifact store.
//!
//! Schema (timestamps are Unix milliseconds):
//! ```sql
//! CREATE TABLE artifacts (
//!   artifact_id VARCHAR(255) PRIMARY KEY,
//!   file_path   TEXT NOT NULL,
//!   size_bytes  BIGINT NOT NULL,
//!   created_at  BIGINT NOT NULL,
//!   expires_at  BIGINT,          -- NULL until a rule is applied
//!   status      VARCHAR(16) NOT NULL,
//!   format_tag  VARCHAR(32) NOT NULL
//! )
//! ```
//!
//! The `Any` driver reads TEXT columns as BLOB on MySQL, so strings are
//! decoded as `String` first and `Vec<u8>` second.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use std::path::PathBuf;
use std::time::Duration;

use super::artifact::{ArtifactRecord, ArtifactStatus};
use super::store::{ArtifactPage, ArtifactQuery, ArtifactStore, ArtifactStoreError};
use crate::pool::sql::install_drivers;

const COLUMNS: &str = "artifact_id, file_path, size_bytes, created_at, expires_at, status, format_tag";

pub struct SqlArtifactStore {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlArtifactStore {
    /// Connect and create the table if needed.
    pub async fn connect(url: &str) -> Result<Self, ArtifactStoreError> {
        install_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await?;
        Self::from_pool(pool, url.starts_with("sqlite:")).await
    }

    /// Use an existing pool. Creates the table if needed.
    pub async fn from_pool(pool: AnyPool, is_sqlite: bool) -> Result<Self, ArtifactStoreError> {
        let store = Self { pool, is_sqlite };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), ArtifactStoreError> {
        if self.is_sqlite {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS artifacts (
                    artifact_id TEXT PRIMARY KEY,
                    file_path TEXT NOT NULL,
                    size_bytes INTEGER NOT NULL,
                    created_at INTEGER NOT NULL,
                    expires_at INTEGER,
                    status TEXT NOT NULL DEFAULT 'active',
                    format_tag TEXT NOT NULL
                )
                "#,
            )
            .execute(&self.pool)
            .await?;
            sqlx::query(
                "CREATE INDEX IF NOT EXISTS idx_artifacts_order ON artifacts (created_at, artifact_id)",
            )
            .execute(&self.pool)
            .await?;
            sqlx::query(
                "CREATE INDEX IF NOT EXISTS idx_artifacts_expiry ON artifacts (status, expires_at)",
            )
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS artifacts (
                    artifact_id VARCHAR(255) PRIMARY KEY,
                    file_path TEXT NOT NULL,
                    size_bytes BIGINT NOT NULL,
                    created_at BIGINT NOT NULL,
                    expires_at BIGINT,
                    status VARCHAR(16) NOT NULL DEFAULT 'active',
                    format_tag VARCHAR(32) NOT NULL,
                    INDEX idx_artifacts_order (created_at, artifact_id),
                    INDEX idx_artifacts_expiry (status, expires_at)
                )
                "#,
            )
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    /// Insert or replace a record.
    pub async fn upsert(&self, record: &ArtifactRecord) -> Result<(), ArtifactStoreError> {
        let sql = if self.is_sqlite {
            "INSERT INTO artifacts (artifact_id, file_path, size_bytes, created_at, expires_at, status, format_tag)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(artifact_id) DO UPDATE SET
                file_path = excluded.file_path,
                size_bytes = excluded.size_bytes,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at,
                status = excluded.status,
                format_tag = excluded.format_tag"
        } else {
            "INSERT INTO artifacts (artifact_id, file_path, size_bytes, created_at, expires_at, status, format_tag)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON DUPLICATE KEY UPDATE
                file_path = VALUES(file_path),
                size_bytes = VALUES(size_bytes),
                created_at = VALUES(created_at),
                expires_at = VALUES(expires_at),
                status = VALUES(status),
                format_tag = VALUES(format_tag)"
        };
        sqlx::query(sql)
            .bind(&record.artifact_id)
            .bind(record.file_path.to_string_lossy().into_owned())
            .bind(i64::try_from(record.size_bytes).unwrap_or(i64::MAX))
            .bind(record.created_at.timestamp_millis())
            .bind(record.expires_at.map(|t| t.timestamp_millis()))
            .bind(record.status.as_str())
            .bind(&record.format_tag)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<ArtifactRecord>, ArtifactStoreError> {
        let sql = format!("SELECT {COLUMNS} FROM artifacts WHERE artifact_id = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode_record).transpose()
    }

    async fn status_of(&self, id: &str) -> Result<Option<ArtifactStatus>, ArtifactStoreError> {
        let row = sqlx::query("SELECT status FROM artifacts WHERE artifact_id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| parse_status(&text(&r, "status")?)).transpose()
    }
}

#[async_trait]
impl ArtifactStore for SqlArtifactStore {
    async fn list(&self, query: &ArtifactQuery) -> Result<ArtifactPage, ArtifactStoreError> {
        let mut clauses: Vec<String> = Vec::new();
        if !query.statuses.is_empty() {
            let marks = vec!["?"; query.statuses.len()].join(", ");
            clauses.push(format!("status IN ({marks})"));
        }
        if query.expires_before.is_some() {
            clauses.push("expires_at IS NOT NULL AND expires_at <= ?".to_string());
        }
        if query.missing_expiry {
            clauses.push("expires_at IS NULL".to_string());
        }
        if query.after.is_some() {
            clauses.push("(created_at > ? OR (created_at = ? AND artifact_id > ?))".to_string());
        }
        let filter = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT {COLUMNS} FROM artifacts {filter} ORDER BY created_at, artifact_id LIMIT ?"
        );

        let mut q = sqlx::query(&sql);
        for status in &query.statuses {
            q = q.bind(status.as_str());
        }
        if let Some(before) = query.expires_before {
            q = q.bind(before.timestamp_millis());
        }
        if let Some(cursor) = &query.after {
            let ms = cursor.created_at.timestamp_millis();
            q = q.bind(ms).bind(ms).bind(cursor.artifact_id.clone());
        }
        q = q.bind(i64::try_from(query.limit).unwrap_or(i64::MAX));

        let rows = q.fetch_all(&self.pool).await?;
        let records = rows
            .iter()
            .map(decode_record)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ArtifactPage::from_records(records, query.limit))
    }

    async fn set_expiry(
        &self,
        id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), ArtifactStoreError> {
        let result = sqlx::query("UPDATE artifacts SET expires_at = ? WHERE artifact_id = ?")
            .bind(expires_at.timestamp_millis())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 && self.status_of(id).await?.is_none() {
            return Err(ArtifactStoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn transition(
        &self,
        id: &str,
        from: ArtifactStatus,
        to: ArtifactStatus,
    ) -> Result<(), ArtifactStoreError> {
        let result =
            sqlx::query("UPDATE artifacts SET status = ? WHERE artifact_id = ? AND status = ?")
                .bind(to.as_str())
                .bind(id)
                .bind(from.as_str())
                .execute(&self.pool)
                .await?;
        if result.rows_affected() > 0 {
            return Ok(());
        }
        match self.status_of(id).await? {
            None => Err(ArtifactStoreError::NotFound(id.to_string())),
            // MySQL reports zero affected rows when nothing changed
            Some(actual) if actual == to && from == to => Ok(()),
            Some(actual) => Err(ArtifactStoreError::Conflict {
                id: id.to_string(),
                expected: from,
                actual,
            }),
        }
    }
}

fn text(row: &AnyRow, column: &str) -> Result<String, ArtifactStoreError> {
    row.try_get::<String, _>(column).or_else(|e| {
        row.try_get::<Vec<u8>, _>(column)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .ok_or(ArtifactStoreError::Sql(e))
    })
}

fn parse_status(s: &str) -> Result<ArtifactStatus, ArtifactStoreError> {
    s.parse().map_err(ArtifactStoreError::Backend)
}

fn millis(ms: i64) -> Result<DateTime<Utc>, ArtifactStoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| ArtifactStoreError::Backend(format!("timestamp out of range: {ms}")))
}

fn decode_record(row: &AnyRow) -> Result<ArtifactRecord, ArtifactStoreError> {
    let size: i64 = row.try_get("size_bytes")?;
    let created: i64 = row.try_get("created_at")?;
    let expires: Option<i64> = row.try_get("expires_at")?;
    Ok(ArtifactRecord {
        artifact_id: text(row, "artifact_id")?,
        file_path: PathBuf::from(text(row, "file_path")?),
        size_bytes: u64::try_from(size).unwrap_or(0),
        created_at: millis(created)?,
        expires_at: expires.map(millis).transpose()?,
        status: parse_status(&text(row, "status")?)?,
        format_tag: text(row, "format_tag")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};

    async fn store() -> (tempfile::TempDir, SqlArtifactStore) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("artifacts.db").display());
        let store = SqlArtifactStore::connect(&url).await.unwrap();
        (dir, store)
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_round_trip_and_paging() {
        let (_dir, store) = store().await;
        for i in 0..5 {
            let mut record = ArtifactRecord::new(
                format!("r{i}"),
                format!("/exports/r{i}.csv"),
                "csv",
                1024,
                t0() + ChronoDuration::seconds(i),
            );
            if i % 2 == 0 {
                record = record.with_expiry(t0() + ChronoDuration::days(i));
            }
            store.upsert(&record).await.unwrap();
        }

        let loaded = store.get("r2").await.unwrap().unwrap();
        assert_eq!(loaded.expires_at, Some(t0() + ChronoDuration::days(2)));
        assert_eq!(loaded.file_path, PathBuf::from("/exports/r2.csv"));

        let first = store.list(&ArtifactQuery::live().limit(2)).await.unwrap();
        assert_eq!(first.records.len(), 2);
        let second = store
            .list(&ArtifactQuery::live().limit(2).after(first.next))
            .await
            .unwrap();
        assert_eq!(second.records[0].artifact_id, "r2");

        let missing = store.list(&ArtifactQuery::live().missing_expiry()).await.unwrap();
        assert_eq!(missing.records.len(), 2);

        let expired = store
            .list(&ArtifactQuery::live().expires_before(t0() + ChronoDuration::days(2)))
            .await
            .unwrap();
        assert_eq!(expired.records.len(), 2);
    }

    #[tokio::test]
    async fn test_transition_conflict_and_not_found() {
        let (_dir, store) = store().await;
        store
            .upsert(&ArtifactRecord::new("a", "/exports/a.pdf", "pdf", 1, t0()))
            .await
            .unwrap();

        store
            .transition("a", ArtifactStatus::Active, ArtifactStatus::Deleted)
            .await
            .unwrap();
        assert!(matches!(
            store.transition("a", ArtifactStatus::Active, ArtifactStatus::Deleted).await,
            Err(ArtifactStoreError::Conflict { actual: ArtifactStatus::Deleted, .. })
        ));
        assert!(matches!(
            store.transition("zz", ArtifactStatus::Active, ArtifactStatus::Deleted).await,
            Err(ArtifactStoreError::NotFound(_))
        ));
        assert!(matches!(
            store.set_expiry("zz", t0()).await,
            Err(ArtifactStoreError::NotFound(_))
        ));
    }
}
