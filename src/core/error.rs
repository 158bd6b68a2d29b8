//! Error types for the entry engine.
//!
//! Only failures that genuinely abort an operation are errors. Business-rule
//! rejections (version checks, filters, interceptor vetoes, conflict
//! resolution) are outcome codes on the result types, never errors.

use thiserror::Error;

/// Failure conditions surfaced by entry operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The entry is already obsolete; the caller should retry against a
    /// fresh lookup.
    #[error("entry removed")]
    EntryRemoved,

    /// The external read-through/write-through store failed. The entry's
    /// in-memory state is unchanged.
    #[error("cache store failure: {message}")]
    Loader { message: String },

    /// WAL or row-store write failed. The row closure did not commit and
    /// the operation must be surfaced.
    #[error("storage failure: {message}")]
    Storage { message: String },

    /// The node is shutting down. Swallowed (logged) on expiration paths.
    #[error("node is stopping")]
    NodeStopping,

    /// A value carried a type tag that is not registered; the caller is
    /// expected to register the type and retry.
    #[error("unregistered value type: {type_tag}")]
    UnregisteredType { type_tag: u8 },
}

impl CacheError {
    /// Create a loader failure.
    pub fn loader(message: impl Into<String>) -> Self {
        Self::Loader {
            message: message.into(),
        }
    }

    /// Create a storage failure.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Check whether the caller should retry the operation on a fresh
    /// entry lookup.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::EntryRemoved | Self::UnregisteredType { .. })
    }

    /// Check whether this error indicates durable-state corruption and must
    /// always be surfaced.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Storage { .. })
    }
}

/// Result type using [`CacheError`].
pub type CacheResult<T> = Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_classification() {
        assert!(CacheError::EntryRemoved.is_retriable());
        assert!(CacheError::UnregisteredType { type_tag: 7 }.is_retriable());
        assert!(!CacheError::storage("wal append").is_retriable());
        assert!(CacheError::storage("wal append").is_fatal());
        assert!(!CacheError::loader("io").is_fatal());
    }
}
