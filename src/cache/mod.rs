// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Two-tier cache: an in-process LRU fast tier in front of an optional shared
//! remote tier.
//!
//! ```text
//!   get ──► fast tier ──hit──► value
//!              │ miss
//!              ▼
//!         shared tier ──hit──► promote to fast (fast TTL) ──► value
//!              │ miss / error / breaker open
//!              ▼
//!            absent
//! ```
//!
//! Writes go fast tier first, then shared tier. Remote failures never reach
//! the caller; serialization failures do.

pub mod codec;
pub mod fast;
pub mod glob;
pub mod memoize;
pub mod query;
pub mod tiered;

use thiserror::Error;

use crate::error::{Classify, ErrorKind};
use crate::storage::StorageError;

pub use fast::EntryMetadata;
pub use memoize::{KeyBuilder, Memoized};
pub use query::{normalize_query, QueryKey, QueryTtlRules};
pub use tiered::{CacheStats, SetOptions, TieredCache};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("failed to serialize cache value: {0}")]
    Serialization(String),
    #[error("failed to deserialize cache value: {0}")]
    Deserialization(String),
    #[error("shared cache backend error: {0}")]
    Backend(#[from] StorageError),
}

impl Classify for CacheError {
    fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Serialization(_) | Self::Deserialization(_) => Some(ErrorKind::Permanent),
            Self::Backend(e) => e.kind(),
        }
    }
}
