// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis backend for the shared cache tier.
//!
//! Values are opaque byte strings written with `SET ... PX` so expiry is
//! absolute and millisecond-accurate. Pattern work goes through `SCAN`
//! (never `KEYS`) so a large co-tenanted instance is not blocked.
//!
//! Calls are not retried here: the tiered cache wraps every call in a circuit
//! breaker and treats failures as misses.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{cmd, pipe, Client, FromRedisValue, Value};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::traits::{PipelineOp, PipelineResult, SharedCacheClient, StorageError};
use crate::resilience::{RetryEngine, RetryPolicy};

pub struct RedisSharedCache {
    connection: ConnectionManager,
}

impl RedisSharedCache {
    /// Connect, retrying with the network policy so a cold Redis doesn't fail startup.
    pub async fn connect(
        connection_string: &str,
        retry: &RetryEngine,
    ) -> Result<Self, StorageError> {
        let client = Client::open(connection_string)?;

        let connection = retry
            .execute(
                "redis_connect",
                &RetryPolicy::network(),
                &CancellationToken::new(),
                || ConnectionManager::new(client.clone()),
            )
            .await
            .map_err(|e| match e.into_last_error() {
                Some(redis_err) => StorageError::Redis(redis_err),
                None => StorageError::Backend("redis connect cancelled".to_string()),
            })?;

        Ok(Self { connection })
    }

    /// Get a clone of the connection manager
    #[must_use]
    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl SharedCacheClient for RedisSharedCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let mut conn = self.connection.clone();
        let data: Option<Vec<u8>> = cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(data)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let _: () = cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, StorageError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection.clone();
        let removed: u64 = cmd("DEL").arg(keys).query_async(&mut conn).await?;
        Ok(removed)
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), StorageError> {
        let mut conn = self.connection.clone();
        let (next, keys): (u64, Vec<String>) = cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count.max(1))
            .query_async(&mut conn)
            .await?;
        Ok((next, keys))
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let mut conn = self.connection.clone();
        let exists: bool = cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(exists)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StorageError> {
        let mut conn = self.connection.clone();
        let updated: bool = cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(updated)
    }

    /// Pipelined batch; one round trip regardless of op count.
    async fn pipeline(&self, ops: Vec<PipelineOp>) -> Result<Vec<PipelineResult>, StorageError> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipeline = pipe();
        for op in &ops {
            match op {
                PipelineOp::Get(key) => {
                    pipeline.cmd("GET").arg(key);
                }
                PipelineOp::Set { key, value, ttl } => {
                    pipeline
                        .cmd("SET")
                        .arg(key)
                        .arg(value.as_slice())
                        .arg("PX")
                        .arg(ttl_millis(*ttl));
                }
                PipelineOp::Delete(keys) if keys.is_empty() => {
                    // DEL with no arguments is an error; keep reply positions aligned
                    pipeline.cmd("ECHO").arg(0);
                }
                PipelineOp::Delete(keys) => {
                    pipeline.cmd("DEL").arg(keys);
                }
                PipelineOp::Expire { key, ttl } => {
                    pipeline.cmd("PEXPIRE").arg(key).arg(ttl_millis(*ttl));
                }
            }
        }

        let mut conn = self.connection.clone();
        let raw: Vec<Value> = pipeline.query_async(&mut conn).await?;
        if raw.len() != ops.len() {
            return Err(StorageError::Backend(format!(
                "pipeline returned {} replies for {} commands",
                raw.len(),
                ops.len()
            )));
        }

        ops.iter()
            .zip(raw.iter())
            .map(|(op, value)| {
                Ok(match op {
                    PipelineOp::Get(_) => {
                        PipelineResult::Value(Option::<Vec<u8>>::from_redis_value(value)?)
                    }
                    PipelineOp::Set { .. } => PipelineResult::Stored,
                    PipelineOp::Delete(_) => PipelineResult::Deleted(u64::from_redis_value(value)?),
                    PipelineOp::Expire { .. } => {
                        PipelineResult::Expired(bool::from_redis_value(value)?)
                    }
                })
            })
            .collect()
    }
}
