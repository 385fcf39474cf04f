// Copyright (c) 2025 SynaDB Contributors
// Licensed under the SynaDB License. See LICENSE file for details.

//! Graph of cluster centroids used for coarse cluster selection.
//!
//! Nodes are whole clusters keyed by [`ClusterId`], positioned at their
//! centroid. Every split or merge goes through [`GlobalGraph::update_graph`],
//! which bumps the generation counter so readers holding a shortlist from an
//! older generation know to refresh it.
//!
//! The graph is persisted in the index manifest (`global.idx`), which is the
//! source of truth for which clusters are live.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::IndexConfig;
use crate::distance::DistanceMetric;
use crate::error::{IvfError, Result};
use crate::graph::ProximityGraph;
use crate::persist;
use crate::types::ClusterId;

/// File name of the index manifest.
pub const MANIFEST_FILE: &str = "global.idx";

const MANIFEST_MAGIC: &[u8; 4] = b"SIVG";
const MANIFEST_VERSION: u16 = 1;

#[derive(Serialize)]
struct ManifestRef<'a> {
    config: &'a IndexConfig,
    generation: u64,
    next_cluster_id: u64,
    centroids: &'a BTreeMap<ClusterId, Vec<f32>>,
    graph: &'a ProximityGraph<ClusterId>,
}

#[derive(Deserialize)]
struct Manifest {
    config: IndexConfig,
    generation: u64,
    next_cluster_id: u64,
    centroids: BTreeMap<ClusterId, Vec<f32>>,
    graph: ProximityGraph<ClusterId>,
}

/// Centroid graph plus cluster id allocation.
#[derive(Debug, Clone)]
pub struct GlobalGraph {
    metric: DistanceMetric,
    graph: ProximityGraph<ClusterId>,
    centroids: BTreeMap<ClusterId, Vec<f32>>,
    generation: u64,
    next_cluster_id: u64,
}

impl GlobalGraph {
    /// Creates an empty centroid graph for `config`.
    pub fn new(config: &IndexConfig) -> Self {
        Self {
            metric: config.metric,
            graph: ProximityGraph::new(config.dimensions, config.metric, config.global.clone()),
            centroids: BTreeMap::new(),
            generation: 0,
            next_cluster_id: 1,
        }
    }

    /// Number of live clusters.
    pub fn len(&self) -> usize {
        self.centroids.len()
    }

    /// Returns true if there are no clusters.
    pub fn is_empty(&self) -> bool {
        self.centroids.is_empty()
    }

    /// Incremented on every topology change.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns true if `id` is a live cluster.
    pub fn contains(&self, id: ClusterId) -> bool {
        self.centroids.contains_key(&id)
    }

    /// Centroid of a live cluster.
    pub fn centroid(&self, id: ClusterId) -> Option<&[f32]> {
        self.centroids.get(&id).map(Vec::as_slice)
    }

    /// Live cluster ids, ascending.
    pub fn ids(&self) -> Vec<ClusterId> {
        self.centroids.keys().copied().collect()
    }

    /// Allocates a fresh cluster id. Ids are never reused.
    pub fn allocate_id(&mut self) -> ClusterId {
        let id = ClusterId(self.next_cluster_id);
        self.next_cluster_id += 1;
        id
    }

    /// The `nprobe` clusters whose centroids are nearest to `query`, nearest first.
    ///
    /// When `nprobe` covers every cluster the ranking is exact.
    pub fn shortlist(&self, query: &[f32], nprobe: usize) -> Vec<ClusterId> {
        if nprobe == 0 {
            return Vec::new();
        }
        if nprobe >= self.centroids.len() {
            let mut ranked: Vec<(ClusterId, f32)> = self
                .centroids
                .iter()
                .map(|(id, c)| (*id, self.metric.distance(query, c)))
                .collect();
            ranked.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
            return ranked.into_iter().map(|(id, _)| id).collect();
        }
        let ef = self.graph.config().ef_search.max(nprobe);
        self.graph
            .search(query, nprobe, ef)
            .into_iter()
            .map(|(id, _)| id)
            .collect()
    }

    /// The cluster a new vector should be routed to.
    pub fn nearest(&self, query: &[f32]) -> Option<ClusterId> {
        self.shortlist(query, 1).into_iter().next()
    }

    /// Nearest other cluster to `id`, by centroid.
    pub fn nearest_sibling(&self, id: ClusterId) -> Option<ClusterId> {
        let centroid = self.centroids.get(&id)?;
        self.shortlist(centroid, 2.min(self.len()))
            .into_iter()
            .find(|other| *other != id)
    }

    /// Applies a topology change: removes stale centroids, inserts new ones.
    ///
    /// Neighbor lists that referenced a removed cluster are repaired.
    pub fn update_graph(
        &mut self,
        add: Vec<(ClusterId, Vec<f32>)>,
        remove: &[ClusterId],
    ) -> Result<()> {
        for id in remove {
            self.graph.remove(id);
            self.centroids.remove(id);
        }
        for (id, centroid) in add {
            self.graph.insert(id, centroid.clone())?;
            self.centroids.insert(id, centroid);
        }
        self.generation += 1;
        debug!(
            generation = self.generation,
            clusters = self.centroids.len(),
            "centroid graph updated"
        );
        Ok(())
    }

    /// Writes the manifest atomically.
    pub fn save(&self, dir: &Path, config: &IndexConfig) -> Result<()> {
        let manifest = ManifestRef {
            config,
            generation: self.generation,
            next_cluster_id: self.next_cluster_id,
            centroids: &self.centroids,
            graph: &self.graph,
        };
        persist::write_atomic(
            &dir.join(MANIFEST_FILE),
            MANIFEST_MAGIC,
            MANIFEST_VERSION,
            &manifest,
            config.sync_on_write,
        )
    }

    /// Loads the manifest and the configuration it was written with.
    pub fn load(dir: &Path) -> Result<(IndexConfig, Self)> {
        let Manifest {
            config,
            generation,
            next_cluster_id,
            centroids,
            mut graph,
        } = persist::read_checked(&dir.join(MANIFEST_FILE), MANIFEST_MAGIC, MANIFEST_VERSION)?;

        graph.restore(|id| {
            centroids
                .get(id)
                .cloned()
                .ok_or_else(|| IvfError::CorruptedIndex(format!("centroid graph node {id} has no centroid")))
        })?;
        if graph.len() != centroids.len() {
            return Err(IvfError::CorruptedIndex(format!(
                "manifest lists {} centroids but the graph holds {}",
                centroids.len(),
                graph.len()
            )));
        }

        let global = Self {
            metric: config.metric,
            graph,
            centroids,
            generation,
            next_cluster_id,
        };
        Ok((config, global))
    }

    /// Loads the manifest and checks it matches the expected dimensions and metric.
    pub fn load_validated(
        dir: &Path,
        expected_dims: u16,
        expected_metric: DistanceMetric,
    ) -> Result<(IndexConfig, Self)> {
        let (config, global) = Self::load(dir)?;
        if config.dimensions != expected_dims {
            return Err(IvfError::DimensionMismatch {
                expected: expected_dims,
                got: config.dimensions as usize,
            });
        }
        if config.metric != expected_metric {
            return Err(IvfError::InvalidConfig(format!(
                "Metric mismatch: expected {:?}, got {:?}",
                expected_metric, config.metric
            )));
        }
        Ok((config, global))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config() -> IndexConfig {
        IndexConfig::new(2, DistanceMetric::Euclidean)
    }

    fn grid(n: usize) -> GlobalGraph {
        let mut global = GlobalGraph::new(&config());
        let add: Vec<_> = (0..n)
            .map(|i| {
                let id = global.allocate_id();
                (id, vec![i as f32, (i % 3) as f32])
            })
            .collect();
        global.update_graph(add, &[]).unwrap();
        global
    }

    #[test]
    fn test_shortlist_orders_by_distance() {
        let global = grid(5);
        let ids = global.shortlist(&[0.1, 0.0], 5);
        assert_eq!(ids.len(), 5);
        assert_eq!(ids[0], ClusterId(1));
        assert_eq!(ids[1], ClusterId(2));
        assert_eq!(global.nearest(&[3.9, 0.9]), Some(ClusterId(5)));
    }

    #[test]
    fn test_shortlist_via_graph() {
        let global = grid(60);
        let ids = global.shortlist(&[30.0, 0.0], 3);
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[0], ClusterId(31));
    }

    #[test]
    fn test_update_graph_replaces_nodes() {
        let mut global = grid(10);
        let gen = global.generation();
        let a = global.allocate_id();
        let b = global.allocate_id();
        global
            .update_graph(
                vec![(a, vec![4.0, 5.0]), (b, vec![6.0, 5.0])],
                &[ClusterId(5)],
            )
            .unwrap();
        assert!(global.generation() > gen);
        assert!(!global.contains(ClusterId(5)));
        assert_eq!(global.len(), 11);
        assert_eq!(global.nearest(&[4.0, 5.0]), Some(a));
        assert!(global.shortlist(&[4.0, 1.0], 11).iter().all(|id| *id != ClusterId(5)));
    }

    #[test]
    fn test_nearest_sibling() {
        let global = grid(4);
        assert_eq!(global.nearest_sibling(ClusterId(1)), Some(ClusterId(2)));
        let single = grid(1);
        assert_eq!(single.nearest_sibling(ClusterId(1)), None);
    }

    #[test]
    fn test_manifest_roundtrip_and_validation() {
        let dir = tempdir().unwrap();
        let mut global = grid(8);
        let next = global.allocate_id();
        global.save(dir.path(), &config()).unwrap();

        let (loaded_config, mut loaded) = GlobalGraph::load(dir.path()).unwrap();
        assert_eq!(loaded_config, config());
        assert_eq!(loaded.ids(), global.ids());
        assert_eq!(loaded.generation(), global.generation());
        assert!(loaded.allocate_id() > next);
        assert_eq!(loaded.shortlist(&[2.0, 2.0], 3), global.shortlist(&[2.0, 2.0], 3));

        assert!(matches!(
            GlobalGraph::load_validated(dir.path(), 3, DistanceMetric::Euclidean),
            Err(IvfError::DimensionMismatch { expected: 3, got: 2 })
        ));
        assert!(matches!(
            GlobalGraph::load_validated(dir.path(), 2, DistanceMetric::Cosine),
            Err(IvfError::InvalidConfig(_))
        ));
    }
}
