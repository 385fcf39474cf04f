// Copyright (c) 2025 SynaDB Contributors
// Licensed under the SynaDB License. See LICENSE file for details.

//! Configuration for the cluster index.
//!
//! [`IndexConfig`] groups everything an index needs:
//!
//! - [`GraphConfig`] for the per-cluster local graphs and for the centroid graph
//! - [`CacheConfig`] for the resident set budget and pin deadlines
//! - [`RebalanceConfig`] for bootstrap, split and merge thresholds
//!
//! The defining parts (dimensions, metric, graph parameters) are persisted in
//! the index manifest and checked again on open.
//!
//! ```rust
//! use syna_ivf::config::{GraphConfig, IndexConfig};
//! use syna_ivf::DistanceMetric;
//!
//! let config = IndexConfig::new(128, DistanceMetric::Euclidean)
//!     .local_graph(GraphConfig::with_m(12).ef_construction(64).ef_search(128))
//!     .nprobe(8);
//! assert!(config.validate().is_ok());
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::distance::DistanceMetric;
use crate::error::{IvfError, Result};

/// Navigable small-world graph parameters.
///
/// The defaults are tuned for a good balance of recall and build time:
/// - `m = 16` neighbors on upper layers
/// - `m_max0 = 32` (2·M) neighbors on layer 0
/// - `ef_construction = 200`
/// - `ef_search = 100`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Max connections per node on layers above 0.
    pub m: usize,

    /// Max connections per node on layer 0. Usually 2·M.
    pub m_max0: usize,

    /// Beam width used while inserting.
    pub ef_construction: usize,

    /// Default beam width for layer-0 search.
    pub ef_search: usize,

    /// Level normalization factor. Default: 1/ln(M).
    pub ml: f64,

    /// Seed for level sampling. `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            m: 16,
            m_max0: 32,
            ef_construction: 200,
            ef_search: 100,
            ml: 1.0 / (16.0_f64).ln(),
            seed: None,
        }
    }
}

impl GraphConfig {
    /// Create a configuration with a custom M; `m_max0` and `ml` are derived.
    pub fn with_m(m: usize) -> Self {
        Self {
            m,
            m_max0: 2 * m,
            ml: 1.0 / (m.max(2) as f64).ln(),
            ..Default::default()
        }
    }

    /// Set ef_construction (build quality).
    pub fn ef_construction(mut self, ef: usize) -> Self {
        self.ef_construction = ef;
        self
    }

    /// Set ef_search (search quality).
    pub fn ef_search(mut self, ef: usize) -> Self {
        self.ef_search = ef;
        self
    }

    /// Fix the level-sampling seed.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    fn validate(&self, which: &str) -> Result<()> {
        if self.m < 2 {
            return Err(IvfError::InvalidConfig(format!("{which}: m must be >= 2")));
        }
        if self.m_max0 < self.m {
            return Err(IvfError::InvalidConfig(format!(
                "{which}: m_max0 must be >= m"
            )));
        }
        if self.ef_construction == 0 || self.ef_search == 0 {
            return Err(IvfError::InvalidConfig(format!(
                "{which}: beam widths must be positive"
            )));
        }
        Ok(())
    }
}

/// Resident-set cache parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Eviction starts when resident clusters exceed this many bytes.
    pub memory_budget_bytes: usize,

    /// How long `sync_lock` waits for a contended pin.
    pub lock_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_budget_bytes: 256 * 1024 * 1024,
            lock_timeout: Duration::from_secs(5),
        }
    }
}

/// Partitioning and rebalancing parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceConfig {
    /// Number of clusters produced by bootstrap k-means.
    pub initial_clusters: usize,

    /// High-water mark: a cluster with more live members is split.
    pub split_threshold: usize,

    /// Low-water mark: a cluster with fewer live members is merged.
    pub merge_threshold: usize,

    /// Lloyd iterations for bootstrap and split clustering.
    pub kmeans_iterations: usize,

    /// Maximum vectors sampled from a batch for bootstrap.
    pub bootstrap_sample: usize,

    /// Rebuild a cluster in place once this fraction of its members are tombstones.
    pub tombstone_compact_ratio: f32,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            initial_clusters: 16,
            split_threshold: 2048,
            merge_threshold: 64,
            kmeans_iterations: 10,
            bootstrap_sample: 10_000,
            tombstone_compact_ratio: 0.3,
        }
    }
}

/// Top-level index configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Number of dimensions of indexed vectors.
    pub dimensions: u16,

    /// Distance metric, fixed for the lifetime of the index.
    pub metric: DistanceMetric,

    /// Per-cluster graph parameters.
    pub local: GraphConfig,

    /// Centroid graph parameters.
    pub global: GraphConfig,

    /// Cache parameters.
    pub cache: CacheConfig,

    /// Split/merge parameters.
    pub rebalance: RebalanceConfig,

    /// Clusters probed when the caller does not specify nProbe.
    pub default_nprobe: usize,

    /// Internal retries for lock contention and stale cluster references.
    pub max_retries: usize,

    /// Candidate multiplier applied per cluster when a filter is present.
    pub filter_overfetch: usize,

    /// fsync the vector store and cluster files when pins are released.
    pub sync_on_write: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dimensions: 768,
            metric: DistanceMetric::Cosine,
            local: GraphConfig::default(),
            global: GraphConfig::with_m(8).ef_construction(100).ef_search(64),
            cache: CacheConfig::default(),
            rebalance: RebalanceConfig::default(),
            default_nprobe: 8,
            max_retries: 3,
            filter_overfetch: 4,
            sync_on_write: true,
        }
    }
}

impl IndexConfig {
    /// Configuration with the given dimensions and metric, defaults elsewhere.
    pub fn new(dimensions: u16, metric: DistanceMetric) -> Self {
        Self {
            dimensions,
            metric,
            ..Default::default()
        }
    }

    /// Set the local graph parameters.
    pub fn local_graph(mut self, graph: GraphConfig) -> Self {
        self.local = graph;
        self
    }

    /// Set the centroid graph parameters.
    pub fn global_graph(mut self, graph: GraphConfig) -> Self {
        self.global = graph;
        self
    }

    /// Set the cache memory budget in bytes.
    pub fn memory_budget(mut self, bytes: usize) -> Self {
        self.cache.memory_budget_bytes = bytes;
        self
    }

    /// Set the pin acquisition deadline.
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.cache.lock_timeout = timeout;
        self
    }

    /// Set the bootstrap cluster count.
    pub fn initial_clusters(mut self, n: usize) -> Self {
        self.rebalance.initial_clusters = n;
        self
    }

    /// Set the split (high-water) and merge (low-water) marks.
    pub fn thresholds(mut self, split: usize, merge: usize) -> Self {
        self.rebalance.split_threshold = split;
        self.rebalance.merge_threshold = merge;
        self
    }

    /// Set the default nProbe.
    pub fn nprobe(mut self, nprobe: usize) -> Self {
        self.default_nprobe = nprobe;
        self
    }

    /// Enable or disable fsync on pin release.
    pub fn sync_on_write(mut self, enabled: bool) -> Self {
        self.sync_on_write = enabled;
        self
    }

    /// Checks the configuration for values the index cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.dimensions == 0 {
            return Err(IvfError::InvalidDimensions(self.dimensions));
        }
        self.local.validate("local graph")?;
        self.global.validate("global graph")?;
        let r = &self.rebalance;
        if r.initial_clusters == 0 {
            return Err(IvfError::InvalidConfig(
                "initial_clusters must be positive".to_string(),
            ));
        }
        if r.split_threshold < 2 {
            return Err(IvfError::InvalidConfig(
                "split_threshold must be >= 2".to_string(),
            ));
        }
        if r.merge_threshold >= r.split_threshold / 2 {
            return Err(IvfError::InvalidConfig(format!(
                "merge_threshold ({}) must be below half of split_threshold ({})",
                r.merge_threshold, r.split_threshold
            )));
        }
        if !(0.0..=1.0).contains(&r.tombstone_compact_ratio) {
            return Err(IvfError::InvalidConfig(
                "tombstone_compact_ratio must be within [0, 1]".to_string(),
            ));
        }
        if self.cache.memory_budget_bytes == 0 {
            return Err(IvfError::InvalidConfig(
                "memory_budget_bytes must be positive".to_string(),
            ));
        }
        if self.default_nprobe == 0 || self.filter_overfetch == 0 {
            return Err(IvfError::InvalidConfig(
                "default_nprobe and filter_overfetch must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
