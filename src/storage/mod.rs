// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared cache tier clients: the [`SharedCacheClient`] seam, an in-memory
//! implementation, and the Redis backend.

pub mod memory;
pub mod redis;
pub mod traits;

pub use memory::InMemorySharedCache;
pub use self::redis::RedisSharedCache;
pub use traits::{PipelineOp, PipelineResult, SharedCacheClient, StorageError};
