// Copyright (c) 2025 SynaDB Contributors
// Licensed under the SynaDB License. See LICENSE file for details.

//! Core data types shared across the index.
//!
//! - [`ClusterId`] - Identity of a storage+index unit
//! - [`VectorRecord`] - Where a vector's payload lives in the [`VectorStore`](crate::store::VectorStore)
//! - [`StorageKind`] - Indexed 1-D vector vs opaque tensor, decided once at insert
//! - [`QueryHit`] - One ranked query result

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{IvfError, Result};

/// Attribute map attached to a vector id by the metadata collaborator.
pub type Metadata = HashMap<String, String>;

/// Identity of a cluster. Ids are never reused; splits and merges allocate
/// fresh ids so a stale id can always be detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterId(pub u64);

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Location of one vector payload.
///
/// Owned by the vector store; clusters and their local graphs refer to the
/// payload through this record instead of holding their own copy on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorRecord {
    /// Stable opaque key chosen by the caller.
    pub id: String,
    /// Number of f32 components in the payload.
    pub dims: u16,
    /// Byte offset of the record in the vector store.
    pub offset: u64,
    /// Payload length in bytes (excluding the record header).
    pub len: u32,
}

/// Storage path for an incoming value, resolved once at insert time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    /// A 1-D vector whose length equals the index dimensions; indexed.
    Indexed1D,
    /// Anything else; stored whole in the tensor blob store, never indexed.
    OpaqueTensor,
}

impl StorageKind {
    /// Classify a value by its declared shape.
    ///
    /// ```rust
    /// use syna_ivf::StorageKind;
    ///
    /// assert_eq!(StorageKind::classify(&[128], 128), StorageKind::Indexed1D);
    /// assert_eq!(StorageKind::classify(&[4, 32], 128), StorageKind::OpaqueTensor);
    /// assert_eq!(StorageKind::classify(&[64], 128), StorageKind::OpaqueTensor);
    /// ```
    pub fn classify(shape: &[usize], dimensions: u16) -> Self {
        match shape {
            [n] if *n == dimensions as usize => StorageKind::Indexed1D,
            _ => StorageKind::OpaqueTensor,
        }
    }
}

/// A ranked result from [`ClusterIndex::query`](crate::ClusterIndex::query).
#[derive(Debug, Clone, PartialEq)]
pub struct QueryHit {
    /// Vector id.
    pub id: String,
    /// Distance to the query (lower = more similar).
    pub distance: f32,
    /// Attributes held by the metadata collaborator, if any.
    pub metadata: Option<Metadata>,
}

/// Validates a caller-supplied vector id.
pub(crate) fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(IvfError::EmptyKey);
    }
    if id.len() > u16::MAX as usize {
        return Err(IvfError::KeyTooLong(id.len()));
    }
    Ok(())
}

/// Encodes a vector as little-endian f32 bytes.
pub(crate) fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decodes little-endian f32 bytes. Trailing bytes that do not form a full
/// f32 are ignored; callers validate the length first.
pub(crate) fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_id() {
        assert!(validate_id("doc").is_ok());
        assert!(matches!(validate_id(""), Err(IvfError::EmptyKey)));
        let long = "x".repeat(70_000);
        assert!(matches!(validate_id(&long), Err(IvfError::KeyTooLong(70_000))));
    }

    #[test]
    fn test_vector_bytes_preserve_bits() {
        let v = vec![0.1f32, -0.0, f32::MAX, 1e-38];
        let decoded = decode_vector(&encode_vector(&v));
        for (a, b) in v.iter().zip(decoded.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn test_cluster_id_display() {
        assert_eq!(ClusterId(42).to_string(), "c42");
    }
}
