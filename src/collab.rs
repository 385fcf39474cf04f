// Copyright (c) 2025 SynaDB Contributors
// Licensed under the SynaDB License. See LICENSE file for details.

//! External collaborators consumed by the index.
//!
//! - [`MetadataIndex`] - attributes per vector id, filter evaluation, tensor links
//! - [`TensorBlobStore`] - raw storage for full tensors that are not indexed
//!
//! Both are trait objects so callers can plug in their own stores. In-memory
//! implementations are provided for embedding and tests.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{IvfError, Result};
use crate::types::Metadata;

/// Metadata attribute that links a vector id to a tensor in the blob store.
pub const TENSOR_LINK_ATTR: &str = "tensor_id";

/// Predicate over a vector's attributes, evaluated after the graph search.
///
/// ```rust
/// use std::collections::HashMap;
/// use syna_ivf::Filter;
///
/// let attrs: HashMap<String, String> =
///     [("lang".to_string(), "en".to_string())].into_iter().collect();
/// let filter = Filter::eq("lang", "en").and(Filter::exists("title").not());
/// assert!(filter.matches(Some(&attrs)));
/// assert!(!Filter::eq("lang", "de").matches(Some(&attrs)));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// Attribute equals value.
    Eq(String, String),
    /// Attribute is absent or differs from value.
    Ne(String, String),
    /// Attribute is present.
    Exists(String),
    /// All sub-filters match.
    And(Vec<Filter>),
    /// Any sub-filter matches.
    Or(Vec<Filter>),
    /// Sub-filter does not match.
    Not(Box<Filter>),
}

impl Filter {
    /// `key == value`
    pub fn eq(key: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::Eq(key.into(), value.into())
    }

    /// `key != value`
    pub fn ne(key: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::Ne(key.into(), value.into())
    }

    /// `key` is set
    pub fn exists(key: impl Into<String>) -> Self {
        Filter::Exists(key.into())
    }

    /// Conjunction with `other`.
    pub fn and(self, other: Filter) -> Self {
        match self {
            Filter::And(mut all) => {
                all.push(other);
                Filter::And(all)
            }
            first => Filter::And(vec![first, other]),
        }
    }

    /// Disjunction with `other`.
    pub fn or(self, other: Filter) -> Self {
        match self {
            Filter::Or(mut any) => {
                any.push(other);
                Filter::Or(any)
            }
            first => Filter::Or(vec![first, other]),
        }
    }

    /// Negation.
    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Filter::Not(Box::new(self))
    }

    /// Evaluates against an attribute map. `None` behaves like an empty map.
    pub fn matches(&self, attrs: Option<&Metadata>) -> bool {
        let get = |key: &str| attrs.and_then(|a| a.get(key));
        match self {
            Filter::Eq(k, v) => get(k) == Some(v),
            Filter::Ne(k, v) => get(k) != Some(v),
            Filter::Exists(k) => get(k).is_some(),
            Filter::And(all) => all.iter().all(|f| f.matches(attrs)),
            Filter::Or(any) => any.iter().any(|f| f.matches(attrs)),
            Filter::Not(inner) => !inner.matches(attrs),
        }
    }
}

/// Attribute store keyed by vector id.
pub trait MetadataIndex: Send + Sync {
    /// Attributes of `id`, if any were set.
    fn get_attributes(&self, id: &str) -> Result<Option<Metadata>>;

    /// Replaces the attributes of `id`.
    fn set_attributes(&self, id: &str, attrs: Metadata) -> Result<()>;

    /// Drops the attributes of `id`.
    fn remove(&self, id: &str) -> Result<()>;

    /// Returns true if `id` passes `filter`.
    fn evaluate(&self, filter: &Filter, id: &str) -> Result<bool> {
        Ok(filter.matches(self.get_attributes(id)?.as_ref()))
    }

    /// Tensor id linked to vector `id` through [`TENSOR_LINK_ATTR`].
    fn linked_tensor(&self, id: &str) -> Result<Option<String>> {
        Ok(self
            .get_attributes(id)?
            .and_then(|attrs| attrs.get(TENSOR_LINK_ATTR).cloned()))
    }
}

/// Raw byte store for full tensors.
pub trait TensorBlobStore: Send + Sync {
    /// Bytes stored under `id`.
    ///
    /// # Errors
    ///
    /// * `IvfError::NotFound` - If nothing is stored under `id`
    fn get(&self, id: &str) -> Result<Vec<u8>>;

    /// Stores `bytes` and returns the id to fetch them by.
    fn put(&self, id: &str, bytes: Vec<u8>) -> Result<String>;
}

/// A full tensor as stored in the blob store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    /// Dimensions, outermost first.
    pub shape: Vec<usize>,
    /// Row-major elements.
    pub data: Vec<f32>,
}

impl Tensor {
    /// Creates a tensor, checking that `data` fills `shape`.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(IvfError::InvalidConfig(format!(
                "tensor shape {shape:?} needs {expected} elements, got {}",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// [`MetadataIndex`] backed by a `HashMap`.
#[derive(Debug, Default)]
pub struct InMemoryMetadata {
    attrs: RwLock<HashMap<String, Metadata>>,
}

impl InMemoryMetadata {
    /// Creates an empty attribute store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ids with attributes.
    pub fn len(&self) -> usize {
        self.attrs.read().len()
    }

    /// Returns true if no attributes are stored.
    pub fn is_empty(&self) -> bool {
        self.attrs.read().is_empty()
    }
}

impl MetadataIndex for InMemoryMetadata {
    fn get_attributes(&self, id: &str) -> Result<Option<Metadata>> {
        Ok(self.attrs.read().get(id).cloned())
    }

    fn set_attributes(&self, id: &str, attrs: Metadata) -> Result<()> {
        self.attrs.write().insert(id.to_string(), attrs);
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<()> {
        self.attrs.write().remove(id);
        Ok(())
    }
}

/// [`TensorBlobStore`] backed by a `HashMap`.
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryBlobStore {
    /// Creates an empty blob store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl TensorBlobStore for InMemoryBlobStore {
    fn get(&self, id: &str) -> Result<Vec<u8>> {
        self.blobs
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| IvfError::NotFound(id.to_string()))
    }

    fn put(&self, id: &str, bytes: Vec<u8>) -> Result<String> {
        self.blobs.write().insert(id.to_string(), bytes);
        Ok(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> Metadata {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_filter_combinators() {
        let a = attrs(&[("kind", "doc"), ("lang", "en")]);
        assert!(Filter::eq("kind", "doc").matches(Some(&a)));
        assert!(Filter::ne("kind", "img").matches(Some(&a)));
        assert!(Filter::ne("missing", "x").matches(Some(&a)));
        assert!(Filter::eq("kind", "img").or(Filter::exists("lang")).matches(Some(&a)));
        assert!(!Filter::eq("kind", "doc").and(Filter::eq("lang", "de")).matches(Some(&a)));
        assert!(!Filter::exists("kind").matches(None));
        assert!(Filter::exists("kind").not().matches(None));
    }

    #[test]
    fn test_and_flattens() {
        let f = Filter::exists("a").and(Filter::exists("b")).and(Filter::exists("c"));
        match f {
            Filter::And(all) => assert_eq!(all.len(), 3),
            other => panic!("unexpected filter {other:?}"),
        }
    }

    #[test]
    fn test_in_memory_metadata() {
        let index = InMemoryMetadata::new();
        index
            .set_attributes("v1", attrs(&[(TENSOR_LINK_ATTR, "t1"), ("kind", "doc")]))
            .unwrap();
        assert_eq!(index.len(), 1);
        assert!(index.evaluate(&Filter::eq("kind", "doc"), "v1").unwrap());
        assert!(!index.evaluate(&Filter::eq("kind", "doc"), "v2").unwrap());
        assert_eq!(index.linked_tensor("v1").unwrap().as_deref(), Some("t1"));
        index.remove("v1").unwrap();
        assert!(index.is_empty());
        assert_eq!(index.linked_tensor("v1").unwrap(), None);
    }

    #[test]
    fn test_blob_store_and_tensor_bytes() {
        let blobs = InMemoryBlobStore::new();
        let tensor = Tensor::new(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let id = blobs.put("t1", tensor.to_bytes().unwrap()).unwrap();
        let back = Tensor::from_bytes(&blobs.get(&id).unwrap()).unwrap();
        assert_eq!(back, tensor);
        assert!(matches!(blobs.get("nope"), Err(IvfError::NotFound(_))));
        assert!(Tensor::new(vec![2, 2], vec![1.0]).is_err());
    }
}
