// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error kinds shared by every component.
//!
//! Errors are classified into a small set of [`ErrorKind`]s that drive retry
//! decisions. A type opts in by implementing [`Classify`]; returning `None`
//! from [`Classify::kind`] defers the decision to the retry policy's
//! transient-message heuristic.
//!
//! # Example
//!
//! ```
//! use telemetry_substrate::{Classify, ErrorKind, SubstrateError};
//!
//! let err = SubstrateError::operation(ErrorKind::Integrity, "checksum mismatch on chunk 3");
//! assert_eq!(err.kind(), Some(ErrorKind::Integrity));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::cache::CacheError;
use crate::config::ConfigError;
use crate::pool::PoolError;
use crate::resilience::RetryError;
use crate::retention::{ArtifactStoreError, SchedulerError};

/// Error kinds understood by the retry engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection refused, timeout, temporary unavailability, locked resource, host not found
    Transient,
    /// Bad argument, wrong type, missing key, schema mismatch
    Permanent,
    /// No pooled connection became available before the acquire timeout
    PoolExhausted,
    /// Caller cancelled or the deadline passed
    Cancelled,
    /// Checksum mismatch, partial write detected
    Integrity,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::PoolExhausted => "pool_exhausted",
            Self::Cancelled => "cancelled",
            Self::Integrity => "integrity",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps an error value onto an [`ErrorKind`].
pub trait Classify: fmt::Display {
    /// The typed kind of this error, or `None` when the error is untyped.
    fn kind(&self) -> Option<ErrorKind>;
}

impl Classify for String {
    fn kind(&self) -> Option<ErrorKind> {
        None
    }
}

impl Classify for std::io::Error {
    fn kind(&self) -> Option<ErrorKind> {
        use std::io::ErrorKind as Io;
        match std::io::Error::kind(self) {
            Io::ConnectionRefused
            | Io::ConnectionReset
            | Io::ConnectionAborted
            | Io::NotConnected
            | Io::BrokenPipe
            | Io::AddrNotAvailable
            | Io::TimedOut
            | Io::Interrupted
            | Io::WouldBlock => Some(ErrorKind::Transient),
            Io::NotFound
            | Io::PermissionDenied
            | Io::AlreadyExists
            | Io::InvalidInput
            | Io::InvalidData
            | Io::Unsupported => Some(ErrorKind::Permanent),
            Io::UnexpectedEof | Io::WriteZero => Some(ErrorKind::Integrity),
            _ => None,
        }
    }
}

impl Classify for redis::RedisError {
    fn kind(&self) -> Option<ErrorKind> {
        if self.is_timeout()
            || self.is_connection_refusal()
            || self.is_connection_dropped()
            || self.is_io_error()
        {
            Some(ErrorKind::Transient)
        } else if matches!(redis::RedisError::kind(self), redis::ErrorKind::TypeError) {
            Some(ErrorKind::Permanent)
        } else {
            None
        }
    }
}

impl Classify for sqlx::Error {
    fn kind(&self) -> Option<ErrorKind> {
        match self {
            sqlx::Error::PoolTimedOut => Some(ErrorKind::PoolExhausted),
            sqlx::Error::Io(_) => Some(ErrorKind::Transient),
            sqlx::Error::PoolClosed
            | sqlx::Error::Configuration(_)
            | sqlx::Error::RowNotFound
            | sqlx::Error::TypeNotFound { .. }
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::ColumnIndexOutOfBounds { .. }
            | sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_) => Some(ErrorKind::Permanent),
            // "database is locked" and friends fall through to the message heuristic
            _ => None,
        }
    }
}

/// Crate-level error for operations routed through the composition root.
#[derive(Debug, Error)]
pub enum SubstrateError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Store(#[from] ArtifactStoreError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Driver error raised inside a caller's query or write
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("{kind} failure: {message}")]
    Operation { kind: ErrorKind, message: String },

    /// Terminal outcome of a retried operation
    #[error("operation '{operation}' failed ({kind}) after {attempts} attempt(s) in {elapsed:?}: {message}")]
    Exhausted {
        operation: String,
        kind: ErrorKind,
        attempts: u32,
        elapsed: Duration,
        message: String,
    },

    /// An error whose kind is unknown; retried only if its message looks transient
    #[error("{0}")]
    Untyped(String),
}

impl SubstrateError {
    pub fn operation(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Operation {
            kind,
            message: message.into(),
        }
    }

    pub fn untyped(message: impl Into<String>) -> Self {
        Self::Untyped(message.into())
    }
}

impl<E: fmt::Display> From<RetryError<E>> for SubstrateError {
    fn from(e: RetryError<E>) -> Self {
        Self::Exhausted {
            message: e.cause.to_string(),
            operation: e.operation,
            kind: e.kind,
            attempts: e.attempts,
            elapsed: e.elapsed,
        }
    }
}

impl Classify for SubstrateError {
    fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Cache(e) => e.kind(),
            Self::Pool(e) => e.kind(),
            Self::Store(e) => e.kind(),
            Self::Scheduler(e) => e.kind(),
            Self::Config(_) => Some(ErrorKind::Permanent),
            Self::Database(e) => Classify::kind(e),
            Self::Operation { kind, .. } | Self::Exhausted { kind, .. } => Some(*kind),
            Self::Untyped(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_display() {
        assert_eq!(ErrorKind::PoolExhausted.to_string(), "pool_exhausted");
        assert_eq!(ErrorKind::Transient.to_string(), "transient");
    }

    #[test]
    fn test_io_error_classification() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "nope");
        assert_eq!(Classify::kind(&refused), Some(ErrorKind::Transient));

        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(Classify::kind(&missing), Some(ErrorKind::Permanent));

        let eof = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read");
        assert_eq!(Classify::kind(&eof), Some(ErrorKind::Integrity));
    }

    #[test]
    fn test_sqlx_pool_timeout_is_pool_exhausted() {
        assert_eq!(Classify::kind(&sqlx::Error::PoolTimedOut), Some(ErrorKind::PoolExhausted));
        assert_eq!(Classify::kind(&sqlx::Error::RowNotFound), Some(ErrorKind::Permanent));
    }

    #[test]
    fn test_substrate_error_kinds() {
        assert_eq!(SubstrateError::untyped("timeout").kind(), None);
        assert_eq!(
            SubstrateError::operation(ErrorKind::Permanent, "bad argument").kind(),
            Some(ErrorKind::Permanent)
        );
        assert_eq!(
            SubstrateError::from(PoolError::Exhausted { waited_ms: 500 }).kind(),
            Some(ErrorKind::PoolExhausted)
        );
    }

    #[test]
    fn test_retry_error_flattens_with_context() {
        use crate::resilience::Cause;

        let err = SubstrateError::from(RetryError {
            operation: "read_power".to_string(),
            kind: ErrorKind::Transient,
            attempts: 3,
            elapsed: Duration::from_millis(30),
            cause: Cause::Operation("timeout".to_string()),
        });
        assert_eq!(err.kind(), Some(ErrorKind::Transient));
        let text = err.to_string();
        assert!(text.contains("read_power"));
        assert!(text.contains("3 attempt(s)"));
        assert!(text.ends_with("timeout"));
    }

    #[test]
    fn test_string_is_untyped() {
        assert_eq!(String::from("connection refused").kind(), None);
    }
}
