// Copyright (c) 2025 SynaDB Contributors
// Licensed under the SynaDB License. See LICENSE file for details.

//! # syna-ivf
//!
//! A persistent, cluster-partitioned approximate nearest neighbor index.
//!
//! Vectors are split into clusters of nearby points. Each cluster carries its
//! own navigable small-world graph and is loaded, cached and written back as a
//! unit, so the index can hold far more vectors than fit in memory. A second
//! graph over the cluster centroids picks which clusters a query visits.
//!
//! ## Features
//!
//! - **Append-only payload log** - Every vector lives once in an mmap'd
//!   [`store::VectorStore`] with per-record length and CRC32 checks
//! - **LRU cluster cache** - [`cache::CacheManager`] keeps resident memory under
//!   a budget; pinned clusters are never evicted
//! - **Layered proximity graphs** - [`graph::ProximityGraph`] with
//!   diversity-aware neighbor pruning, used per cluster and over centroids
//! - **Online rebalancing** - clusters split above a high-water mark and merge
//!   below a low-water mark while the index stays available
//! - **Crash safety** - cluster files and the manifest are checksummed and
//!   replaced atomically; interrupted rebalances are cleaned up on open
//! - **Metadata filters and tensors** - post-filtering through a pluggable
//!   [`MetadataIndex`], full tensors through a [`TensorBlobStore`]
//!
//! ## Architecture
//!
//! | Component | Purpose |
//! |-----------|---------|
//! | [`ClusterIndex`] | Public operations: put, get, delete, query |
//! | [`store::VectorStore`] | Vector payloads |
//! | [`cache::CacheManager`] | Cluster residency, pins, write-back |
//! | [`cluster::Cluster`] | Members plus local graph, persisted as one file |
//! | [`global::GlobalGraph`] | Centroid graph and the manifest |
//! | [`partition::Partitioner`] | Bootstrap k-means, routing, 2-means splits |
//! | [`rebalance::Rebalancer`] | Split, merge, tombstone compaction |
//! | [`query::QueryCoordinator`] | Shortlist, parallel search, k-way merge |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use syna_ivf::{ClusterIndex, DistanceMetric, IndexConfig, Result};
//!
//! fn main() -> Result<()> {
//!     let config = IndexConfig::new(4, DistanceMetric::Euclidean)
//!         .initial_clusters(8)
//!         .nprobe(4);
//!     let index = ClusterIndex::open("embeddings", config)?;
//!
//!     let batch = (0..1000)
//!         .map(|i| {
//!             let x = i as f32;
//!             (format!("v{i}"), vec![x, x * 0.5, -x, 1.0], None)
//!         })
//!         .collect();
//!     index.put_all(batch)?;
//!
//!     for hit in index.search(&[10.0, 5.0, -10.0, 1.0], 3)? {
//!         println!("{} at {}", hit.id, hit.distance);
//!     }
//!     index.flush()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Logging
//!
//! The crate logs through [`tracing`] and never installs a subscriber.

pub mod cache;
pub mod cluster;
pub mod collab;
pub mod config;
pub mod distance;
pub mod error;
pub mod global;
pub mod graph;
pub mod index;
pub mod partition;
mod persist;
pub mod query;
pub mod rebalance;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use error::{IvfError, Result};
pub use types::{ClusterId, Metadata, QueryHit, StorageKind, VectorRecord};

// Re-export configuration
pub use config::{CacheConfig, GraphConfig, IndexConfig, RebalanceConfig};

// Re-export the index facade
pub use index::{ClusterIndex, IndexStats};

// Re-export collaborator interfaces
pub use collab::{
    Filter, InMemoryBlobStore, InMemoryMetadata, MetadataIndex, Tensor, TensorBlobStore,
};

// Re-export distance metrics
pub use distance::DistanceMetric;
