// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Artifact records and retention rules.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::RetentionConfig;

/// Longest retention a rule can express (100 years).
const MAX_RETENTION_DAYS: u64 = 36_500;

/// Lifecycle of a produced file. The scheduler owns every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Active,
    ExpiringSoon,
    Deleted,
}

impl ArtifactStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::ExpiringSoon => "expiring_soon",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for ArtifactStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "expiring_soon" => Ok(Self::ExpiringSoon),
            "deleted" => Ok(Self::Deleted),
            other => Err(format!("unknown artifact status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub artifact_id: String,
    pub file_path: PathBuf,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    /// `None` until a retention rule has been applied
    pub expires_at: Option<DateTime<Utc>>,
    pub status: ArtifactStatus,
    /// Picks the retention rule (`csv`, `pdf`, ...)
    pub format_tag: String,
}

impl ArtifactRecord {
    /// A new active record with no expiry assigned yet.
    pub fn new(
        artifact_id: impl Into<String>,
        file_path: impl Into<PathBuf>,
        format_tag: impl Into<String>,
        size_bytes: u64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            artifact_id: artifact_id.into(),
            file_path: file_path.into(),
            size_bytes,
            created_at,
            expires_at: None,
            status: ArtifactStatus::Active,
            format_tag: format_tag.into(),
        }
    }

    #[must_use]
    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: ArtifactStatus) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }
}

/// One immutable version of the rule map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSet {
    rules: HashMap<String, ChronoDuration>,
    default: ChronoDuration,
}

fn days(n: u64) -> ChronoDuration {
    let n = i64::try_from(n.min(MAX_RETENTION_DAYS)).unwrap_or(0);
    ChronoDuration::days(n)
}

impl RuleSet {
    /// Rules in days per format tag. Tags match case-insensitively.
    #[must_use]
    pub fn from_days(rules: &HashMap<String, u64>, default_days: u64) -> Self {
        Self {
            rules: rules
                .iter()
                .map(|(tag, d)| (tag.to_lowercase(), days(*d)))
                .collect(),
            default: days(default_days),
        }
    }

    #[must_use]
    pub fn retention_for(&self, format_tag: &str) -> ChronoDuration {
        self.rules
            .get(&format_tag.to_lowercase())
            .copied()
            .unwrap_or(self.default)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Read-mostly rule map. Updates swap the whole map at once.
#[derive(Debug)]
pub struct RetentionRules {
    current: RwLock<Arc<RuleSet>>,
}

impl RetentionRules {
    #[must_use]
    pub fn new(rules: RuleSet) -> Self {
        Self {
            current: RwLock::new(Arc::new(rules)),
        }
    }

    #[must_use]
    pub fn from_config(config: &RetentionConfig) -> Self {
        Self::new(RuleSet::from_days(&config.rules, config.default_rule_days))
    }

    /// The rules in force. Holders keep a consistent view across a whole job.
    #[must_use]
    pub fn snapshot(&self) -> Arc<RuleSet> {
        Arc::clone(&self.current.read())
    }

    pub fn update(&self, rules: RuleSet) {
        *self.current.write() = Arc::new(rules);
    }
}
