// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::error::{Classify, ErrorKind};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
}

impl Classify for StorageError {
    fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Backend(_) => None,
            Self::Redis(e) => Classify::kind(e),
        }
    }
}

/// One command in a shared-cache pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOp {
    Get(String),
    Set { key: String, value: Vec<u8>, ttl: Duration },
    Delete(Vec<String>),
    Expire { key: String, ttl: Duration },
}

/// Result of one [`PipelineOp`], in submission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineResult {
    Value(Option<Vec<u8>>),
    Stored,
    Deleted(u64),
    Expired(bool),
}

/// Remote key/value store backing the shared cache tier.
///
/// Keys arrive fully namespaced; clients never add a prefix of their own.
#[async_trait]
pub trait SharedCacheClient: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store `value` with an absolute expiry `ttl` from now.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StorageError>;

    /// Delete keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64, StorageError>;

    /// Cursor-based keyspace scan. A returned cursor of 0 ends the iteration.
    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// Reset the expiry of an existing key. Returns false if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StorageError>;

    /// Run several commands in one round trip.
    /// Default implementation falls back to sequential calls.
    async fn pipeline(&self, ops: Vec<PipelineOp>) -> Result<Vec<PipelineResult>, StorageError> {
        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            let result = match op {
                PipelineOp::Get(key) => PipelineResult::Value(self.get(&key).await?),
                PipelineOp::Set { key, value, ttl } => {
                    self.set(&key, &value, ttl).await?;
                    PipelineResult::Stored
                }
                PipelineOp::Delete(keys) => PipelineResult::Deleted(self.delete(&keys).await?),
                PipelineOp::Expire { key, ttl } => {
                    PipelineResult::Expired(self.expire(&key, ttl).await?)
                }
            };
            results.push(result);
        }
        Ok(results)
    }
}
