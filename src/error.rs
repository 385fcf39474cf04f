// Copyright (c) 2025 SynaDB Contributors
// Licensed under the SynaDB License. See LICENSE file for details.

//! Error types for cluster index operations.
//!
//! This module provides:
//! - [`IvfError`] - The main error enum
//! - [`Result<T>`] - A type alias for `std::result::Result<T, IvfError>`
//!
//! Errors fall into two classes. `LockTimeout` and `RebalanceConflict` are
//! transient and may be retried by the caller (see [`IvfError::is_retryable`]).
//! Everything else is final for the operation that produced it.

use crate::types::ClusterId;

/// Result type alias for cluster index operations.
pub type Result<T> = std::result::Result<T, IvfError>;

/// Comprehensive error type for the cluster index.
///
/// # Examples
///
/// ```rust
/// use syna_ivf::{IvfError, ClusterId};
///
/// let err = IvfError::RebalanceConflict(ClusterId(7));
/// assert!(err.is_retryable());
///
/// let err = IvfError::NotFound("doc-1".to_string());
/// assert!(!err.is_retryable());
/// ```
#[derive(Debug, thiserror::Error)]
pub enum IvfError {
    /// I/O error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// A record in the vector store failed its length or checksum check.
    ///
    /// Fatal for that record only. Scans skip it and report it.
    #[error("Storage corruption at offset {offset}: {reason}")]
    StorageCorruption {
        /// Byte offset of the damaged record
        offset: u64,
        /// What failed to validate
        reason: String,
    },

    /// Vector id absent from every cluster.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A pin could not be acquired before the deadline.
    #[error("Lock timeout on cluster {cluster} after {waited_ms}ms")]
    LockTimeout {
        /// Cluster whose pin was contended
        cluster: ClusterId,
        /// How long the caller waited
        waited_ms: u64,
    },

    /// A cluster id became stale because a split or merge retired it.
    #[error("Cluster {0} was retired by a rebalance")]
    RebalanceConflict(ClusterId),

    /// The pinned set does not fit into the cache budget.
    #[error("Capacity exceeded: pinned set needs {required} bytes, budget is {budget} bytes")]
    CapacityExceeded {
        /// Bytes needed by the pinned clusters
        required: usize,
        /// Configured memory budget
        budget: usize,
    },

    /// Vector dimension mismatch.
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch {
        /// Expected number of dimensions
        expected: u16,
        /// Actual number of dimensions provided
        got: usize,
    },

    /// Invalid vector dimensions in a configuration.
    #[error("Invalid dimensions: {0} (must be at least 1)")]
    InvalidDimensions(u16),

    /// Empty vector ids are not allowed.
    #[error("Empty id is not allowed")]
    EmptyKey,

    /// Vector id exceeds maximum length (65535 bytes).
    #[error("Id too long: {0} bytes (max 65535)")]
    KeyTooLong(usize),

    /// A cluster file or manifest is unreadable or has the wrong format.
    #[error("Corrupted index: {0}")]
    CorruptedIndex(String),

    /// Configuration rejected by validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation needs at least one cluster.
    #[error("Index has no clusters; bootstrap it or insert a vector first")]
    NotBootstrapped,
}

impl IvfError {
    /// Returns `true` for transient conditions that a retry may resolve.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IvfError::LockTimeout { .. } | IvfError::RebalanceConflict(_)
        )
    }

    pub(crate) fn corruption(offset: u64, reason: impl Into<String>) -> Self {
        IvfError::StorageCorruption {
            offset,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(IvfError::LockTimeout {
            cluster: ClusterId(1),
            waited_ms: 10
        }
        .is_retryable());
        assert!(IvfError::RebalanceConflict(ClusterId(2)).is_retryable());
        assert!(!IvfError::corruption(0, "bad crc").is_retryable());
        assert!(!IvfError::CapacityExceeded {
            required: 10,
            budget: 5
        }
        .is_retryable());
        assert!(!IvfError::NotFound("x".into()).is_retryable());
    }

    #[test]
    fn test_display_messages() {
        let err = IvfError::corruption(128, "checksum mismatch");
        assert_eq!(
            err.to_string(),
            "Storage corruption at offset 128: checksum mismatch"
        );
        let err = IvfError::DimensionMismatch {
            expected: 3,
            got: 4,
        };
        assert!(err.to_string().contains("expected 3"));
    }
}
