//! Error types for store operations.

use std::collections::BTreeMap;
use std::time::Duration;

use common::StorageError;

/// A put or patch lost its version check.
///
/// Carries every key of the failed write together with the version token the
/// caller supplied for it. For a batch, that is all put/patch keys in the
/// batch, since none of them were written.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VersionMismatch {
    pub keys: BTreeMap<String, i64>,
}

impl VersionMismatch {
    pub fn single(key: impl Into<String>, version: i64) -> Self {
        Self {
            keys: BTreeMap::from([(key.into(), version)]),
        }
    }
}

impl std::fmt::Display for VersionMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "key version mismatch: [")?;
        for (i, (key, version)) in self.keys.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, " {:?}: {}", key, version)?;
        }
        write!(f, " ]")
    }
}

/// Error type for store operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A write failed its version check. Re-read and retry.
    VersionMismatch(VersionMismatch),

    /// The SQL engine rejected or failed to run a statement.
    Storage(String),

    /// Caller misuse, rejected before anything was sent to the engine.
    InvalidInput(String),

    /// A stored value or timestamp could not be decoded.
    Encoding(String),

    /// Internal errors indicating bugs, schema corruption or invariant violations.
    Internal(String),

    /// The call was abandoned before all of its statements ran.
    Cancelled,

    /// The engine did not answer in time.
    Timeout(Duration),
}

impl Error {
    /// Wraps an engine error with the name of the operation that hit it.
    pub(crate) fn storage(op: &str, err: StorageError) -> Self {
        match err {
            StorageError::Storage(msg) => Error::Storage(format!("{}: {}", op, msg)),
            StorageError::Internal(msg) => Error::Internal(format!("{}: {}", op, msg)),
            StorageError::Precondition { .. } => Error::Internal(format!("{}: {}", op, err)),
            StorageError::Cancelled => Error::Cancelled,
            StorageError::Timeout(after) => Error::Timeout(after),
        }
    }

    /// True when the write lost an optimistic concurrency race.
    pub fn is_version_mismatch(&self) -> bool {
        matches!(self, Error::VersionMismatch(_))
    }

    /// True when repeating the call, after re-reading if needed, may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::VersionMismatch(_) | Error::Timeout(_))
    }
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::VersionMismatch(mismatch) => write!(f, "{}", mismatch),
            Error::Storage(msg) => write!(f, "Storage error: {}", msg),
            Error::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            Error::Encoding(msg) => write!(f, "Encoding error: {}", msg),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
            Error::Cancelled => write!(f, "Cancelled"),
            Error::Timeout(after) => write!(f, "Timed out after {:?}", after),
        }
    }
}

impl From<VersionMismatch> for Error {
    fn from(err: VersionMismatch) -> Self {
        Error::VersionMismatch(err)
    }
}

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;
