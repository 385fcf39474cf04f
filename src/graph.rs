// Copyright (c) 2025 SynaDB Contributors
// Licensed under the SynaDB License. See LICENSE file for details.

//! Layered navigable small-world graph over an integer-indexed node arena.
//!
//! One implementation backs both graph levels of the index:
//! - each cluster's local graph, keyed by vector id (`ProximityGraph<String>`)
//! - the centroid graph, keyed by [`ClusterId`](crate::ClusterId)
//!
//! # Algorithm Overview
//!
//! - Layer 0 contains all nodes with up to `m_max0` connections each
//! - Higher layers contain exponentially fewer nodes with up to `m` connections
//! - Search starts at the top layer and greedily descends
//! - Neighbor lists are pruned with a diversity heuristic: a candidate is kept
//!   only if it is closer to the base node than to every neighbor kept so far
//!
//! Nodes never hold references to each other. Neighbor lists store arena slots
//! plus the cached distance to that neighbor.
//!
//! Vectors are not serialized with the graph. After deserializing, callers
//! reattach them with [`ProximityGraph::restore`].

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::hash::Hash;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::GraphConfig;
use crate::distance::DistanceMetric;
use crate::error::{IvfError, Result};

/// Upper bound on sampled levels.
const MAX_LEVEL: usize = 16;

// =============================================================================
// Node Structure
// =============================================================================

/// A node in the graph arena.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode<K> {
    /// Subject id (vector id or cluster id).
    pub key: K,
    /// Neighbor lists per layer: `(slot, distance)`.
    pub neighbors: Vec<Vec<(usize, f32)>>,
    /// Tombstoned nodes stay navigable but never appear in results.
    pub deleted: bool,
    #[serde(skip, default = "Vec::new")]
    vector: Vec<f32>,
}

impl<K> GraphNode<K> {
    /// Highest layer this node lives on.
    pub fn level(&self) -> usize {
        self.neighbors.len().saturating_sub(1)
    }
}

/// Statistics about a graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphStats {
    /// Nodes in the arena, tombstones included
    pub num_nodes: usize,
    /// Tombstoned nodes
    pub tombstones: usize,
    /// Maximum level in the graph
    pub max_level: usize,
    /// Total number of directed edges
    pub total_edges: usize,
}

// =============================================================================
// Heap Helpers
// =============================================================================

/// Min-heap entry (closest first). Ties are broken by slot.
struct MinHeapEntry(f32, usize);

impl PartialEq for MinHeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MinHeapEntry {}

impl PartialOrd for MinHeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MinHeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .0
            .total_cmp(&self.0)
            .then_with(|| other.1.cmp(&self.1))
    }
}

/// Max-heap entry (farthest first).
struct MaxHeapEntry(f32, usize);

impl PartialEq for MaxHeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MaxHeapEntry {}

impl PartialOrd for MaxHeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MaxHeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0).then_with(|| self.1.cmp(&other.1))
    }
}

fn by_distance(a: &(usize, f32), b: &(usize, f32)) -> Ordering {
    a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0))
}

fn fresh_rng() -> StdRng {
    StdRng::from_entropy()
}

// =============================================================================
// Graph
// =============================================================================

/// Arena-backed layered proximity graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProximityGraph<K> {
    config: GraphConfig,
    metric: DistanceMetric,
    dimensions: u16,
    nodes: Vec<Option<GraphNode<K>>>,
    free: Vec<usize>,
    entry_point: Option<usize>,
    max_level: usize,
    tombstones: usize,
    #[serde(skip, default = "HashMap::new")]
    key_to_slot: HashMap<K, usize>,
    #[serde(skip, default = "fresh_rng")]
    rng: StdRng,
}

impl<K> ProximityGraph<K>
where
    K: Clone + Eq + Hash,
{
    /// Creates an empty graph.
    pub fn new(dimensions: u16, metric: DistanceMetric, config: GraphConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => fresh_rng(),
        };
        Self {
            config,
            metric,
            dimensions,
            nodes: Vec::new(),
            free: Vec::new(),
            entry_point: None,
            max_level: 0,
            tombstones: 0,
            key_to_slot: HashMap::new(),
            rng,
        }
    }

    /// Reattaches vectors and rebuilds lookup state after deserialization.
    ///
    /// `lookup` is called once per node, tombstones included.
    pub fn restore<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&K) -> Result<Vec<f32>>,
    {
        self.key_to_slot.clear();
        let dims = self.dimensions as usize;
        for (slot, node) in self.nodes.iter_mut().enumerate() {
            if let Some(node) = node {
                let vector = lookup(&node.key)?;
                if vector.len() != dims {
                    return Err(IvfError::DimensionMismatch {
                        expected: self.dimensions,
                        got: vector.len(),
                    });
                }
                node.vector = vector;
                self.key_to_slot.insert(node.key.clone(), slot);
            }
        }
        self.rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(self.nodes.len() as u64)),
            None => fresh_rng(),
        };
        Ok(())
    }

    /// Number of live (non-tombstoned) nodes.
    pub fn len(&self) -> usize {
        self.key_to_slot.len() - self.tombstones
    }

    /// Returns true if no live nodes remain.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of tombstoned nodes.
    pub fn tombstones(&self) -> usize {
        self.tombstones
    }

    /// Graph parameters.
    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// Returns true if `key` is a live node.
    pub fn contains(&self, key: &K) -> bool {
        self.node_for(key).map(|n| !n.deleted).unwrap_or(false)
    }

    /// Returns true if `key` has a node, live or tombstoned.
    pub fn has_node(&self, key: &K) -> bool {
        self.key_to_slot.contains_key(key)
    }

    /// The stored vector for `key`, tombstones included.
    pub fn vector(&self, key: &K) -> Option<&[f32]> {
        self.node_for(key).map(|n| n.vector.as_slice())
    }

    /// Keys of live nodes, in arena order.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.nodes
            .iter()
            .flatten()
            .filter(|n| !n.deleted)
            .map(|n| &n.key)
    }

    /// Key of the current entry point.
    pub fn entry_key(&self) -> Option<&K> {
        self.entry_point.and_then(|s| self.nodes[s].as_ref()).map(|n| &n.key)
    }

    /// Keys adjacent to `key` on `level`.
    pub fn neighbors(&self, key: &K, level: usize) -> Vec<K> {
        match self.node_for(key) {
            Some(node) if level < node.neighbors.len() => node.neighbors[level]
                .iter()
                .filter_map(|(s, _)| self.nodes[*s].as_ref().map(|n| n.key.clone()))
                .collect(),
            _ => Vec::new(),
        }
    }

    fn node_for(&self, key: &K) -> Option<&GraphNode<K>> {
        self.key_to_slot
            .get(key)
            .and_then(|s| self.nodes[*s].as_ref())
    }

    fn vec_at(&self, slot: usize) -> &[f32] {
        self.nodes[slot]
            .as_ref()
            .map(|n| n.vector.as_slice())
            .unwrap_or(&[])
    }

    fn max_links(&self, level: usize) -> usize {
        if level == 0 {
            self.config.m_max0
        } else {
            self.config.m
        }
    }

    /// Generate a random level for a new node.
    ///
    /// Uses floor(-ln(uniform(0,1]) * ml), so most nodes land on level 0.
    fn random_level(&mut self) -> usize {
        let uniform: f64 = 1.0 - self.rng.gen::<f64>();
        let level = (-uniform.ln() * self.config.ml).floor() as usize;
        level.min(MAX_LEVEL)
    }

    /// Inserts `key` at `vector`. Re-inserting an existing key replaces its node.
    pub fn insert(&mut self, key: K, vector: Vec<f32>) -> Result<()> {
        if vector.len() != self.dimensions as usize {
            return Err(IvfError::DimensionMismatch {
                expected: self.dimensions,
                got: vector.len(),
            });
        }
        if self.key_to_slot.contains_key(&key) {
            self.remove(&key);
        }

        let level = self.random_level();
        let node = GraphNode {
            key: key.clone(),
            neighbors: vec![Vec::new(); level + 1],
            deleted: false,
            vector,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                slot
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        self.key_to_slot.insert(key, slot);

        let Some(mut ep) = self.entry_point else {
            self.entry_point = Some(slot);
            self.max_level = level;
            return Ok(());
        };

        let query = self.vec_at(slot).to_vec();

        for lc in (level + 1..=self.max_level).rev() {
            if let Some(&(closest, _)) = self.search_layer(&query, ep, 1, lc).first() {
                ep = closest;
            }
        }

        for lc in (0..=level.min(self.max_level)).rev() {
            let candidates = self.search_layer(&query, ep, self.config.ef_construction, lc);
            let selected = self.select_neighbors(&candidates, self.config.m);
            for &(neighbor, dist) in &selected {
                self.connect(neighbor, slot, dist, lc);
            }
            if let Some(node) = self.nodes[slot].as_mut() {
                node.neighbors[lc] = selected;
            }
            if let Some(&(closest, _)) = candidates.first() {
                ep = closest;
            }
        }

        if level > self.max_level {
            self.max_level = level;
            self.entry_point = Some(slot);
        }
        Ok(())
    }

    /// Adds `to` to the neighbor list of `from` on `level`, pruning if full.
    fn connect(&mut self, from: usize, to: usize, dist: f32, level: usize) {
        let cap = self.max_links(level);
        let mut list = match self.nodes[from].as_ref() {
            Some(node) if level < node.neighbors.len() => node.neighbors[level].clone(),
            _ => return,
        };
        if list.iter().any(|(s, _)| *s == to) {
            return;
        }
        list.push((to, dist));
        if list.len() > cap {
            list.sort_by(by_distance);
            list = self.select_neighbors(&list, cap);
        }
        if let Some(node) = self.nodes[from].as_mut() {
            node.neighbors[level] = list;
        }
    }

    /// Diversity-aware neighbor selection.
    ///
    /// `candidates` must be sorted by distance to the base node. A candidate is
    /// kept when it is closer to the base than to any already-kept neighbor;
    /// if fewer than `m` survive, the closest discarded ones fill the gap.
    fn select_neighbors(&self, candidates: &[(usize, f32)], m: usize) -> Vec<(usize, f32)> {
        let mut selected: Vec<(usize, f32)> = Vec::with_capacity(m);
        let mut discarded = Vec::new();

        for &(cand, dist) in candidates {
            if selected.len() >= m {
                break;
            }
            let cand_vec = self.vec_at(cand);
            let diverse = selected
                .iter()
                .all(|&(kept, _)| self.metric.distance(cand_vec, self.vec_at(kept)) > dist);
            if diverse {
                selected.push((cand, dist));
            } else {
                discarded.push((cand, dist));
            }
        }

        for entry in discarded {
            if selected.len() >= m {
                break;
            }
            selected.push(entry);
        }
        selected
    }

    /// Beam search within one layer. Returns `(slot, distance)` closest first.
    fn search_layer(
        &self,
        query: &[f32],
        entry_point: usize,
        ef: usize,
        level: usize,
    ) -> Vec<(usize, f32)> {
        let mut visited = HashSet::new();
        let mut candidates = BinaryHeap::new();
        let mut results = BinaryHeap::new();

        let ep_dist = self.metric.distance(query, self.vec_at(entry_point));
        visited.insert(entry_point);
        candidates.push(MinHeapEntry(ep_dist, entry_point));
        results.push(MaxHeapEntry(ep_dist, entry_point));

        while let Some(MinHeapEntry(c_dist, c_slot)) = candidates.pop() {
            let worst = results.peek().map(|e| e.0).unwrap_or(f32::MAX);
            if c_dist > worst {
                break;
            }

            let Some(node) = self.nodes[c_slot].as_ref() else {
                continue;
            };
            if level >= node.neighbors.len() {
                continue;
            }
            for &(neighbor, _) in &node.neighbors[level] {
                if !visited.insert(neighbor) || self.nodes[neighbor].is_none() {
                    continue;
                }
                let dist = self.metric.distance(query, self.vec_at(neighbor));
                let worst = results.peek().map(|e| e.0).unwrap_or(f32::MAX);
                if results.len() < ef || dist < worst {
                    candidates.push(MinHeapEntry(dist, neighbor));
                    results.push(MaxHeapEntry(dist, neighbor));
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut out: Vec<(usize, f32)> = results
            .into_iter()
            .map(|MaxHeapEntry(d, s)| (s, d))
            .collect();
        out.sort_by(by_distance);
        out
    }

    /// Returns up to `k` live nodes nearest to `query`, closest first.
    ///
    /// `ef` is the layer-0 beam width; it is raised to at least `k`.
    pub fn search(&self, query: &[f32], k: usize, ef: usize) -> Vec<(K, f32)> {
        let Some(mut ep) = self.entry_point else {
            return Vec::new();
        };
        if k == 0 || query.len() != self.dimensions as usize {
            return Vec::new();
        }

        for lc in (1..=self.max_level).rev() {
            if let Some(&(closest, _)) = self.search_layer(query, ep, 1, lc).first() {
                ep = closest;
            }
        }

        let ef = ef.max(k);
        let ef = ef.saturating_add(self.tombstones.min(ef));
        self.search_layer(query, ep, ef, 0)
            .into_iter()
            .filter_map(|(slot, dist)| {
                self.nodes[slot]
                    .as_ref()
                    .filter(|n| !n.deleted)
                    .map(|n| (n.key.clone(), dist))
            })
            .take(k)
            .collect()
    }

    /// Tombstones `key`. Edges are kept until the graph is rebuilt.
    ///
    /// Returns `false` if the key is absent or already deleted.
    pub fn delete(&mut self, key: &K) -> bool {
        let Some(&slot) = self.key_to_slot.get(key) else {
            return false;
        };
        match self.nodes[slot].as_mut() {
            Some(node) if !node.deleted => {
                node.deleted = true;
                self.tombstones += 1;
                true
            }
            _ => false,
        }
    }

    /// Removes `key` from the arena and repairs the neighborhoods that
    /// referenced it. Returns `false` if the key is absent.
    pub fn remove(&mut self, key: &K) -> bool {
        let Some(slot) = self.key_to_slot.remove(key) else {
            return false;
        };
        let Some(removed) = self.nodes[slot].take() else {
            return false;
        };
        if removed.deleted {
            self.tombstones -= 1;
        }
        self.free.push(slot);

        for (level, removed_links) in removed.neighbors.iter().enumerate() {
            let pool: Vec<usize> = removed_links
                .iter()
                .map(|(s, _)| *s)
                .filter(|s| self.nodes[*s].is_some())
                .collect();

            let mut affected: Vec<usize> = pool.clone();
            for (other, node) in self.nodes.iter().enumerate() {
                if let Some(node) = node {
                    if level < node.neighbors.len()
                        && node.neighbors[level].iter().any(|(s, _)| *s == slot)
                    {
                        affected.push(other);
                    }
                }
            }
            affected.sort_unstable();
            affected.dedup();

            for a in affected {
                self.repair(a, slot, &pool, level);
            }
        }

        if self.entry_point == Some(slot) {
            self.reselect_entry_point();
        }
        true
    }

    /// Drops links to `gone` from `a` and reconnects `a` within `pool`.
    fn repair(&mut self, a: usize, gone: usize, pool: &[usize], level: usize) {
        let cap = self.max_links(level);
        let (mut list, a_vec) = match self.nodes[a].as_ref() {
            Some(node) if level < node.neighbors.len() => {
                (node.neighbors[level].clone(), node.vector.clone())
            }
            _ => return,
        };
        list.retain(|(s, _)| *s != gone);
        let before: HashSet<usize> = list.iter().map(|(s, _)| *s).collect();

        for &p in pool {
            if p == a || before.contains(&p) {
                continue;
            }
            let on_level = self.nodes[p]
                .as_ref()
                .map(|n| level < n.neighbors.len())
                .unwrap_or(false);
            if on_level {
                list.push((p, self.metric.distance(&a_vec, self.vec_at(p))));
            }
        }
        list.sort_by(by_distance);
        let list = self.select_neighbors(&list, cap);

        let added: Vec<(usize, f32)> = list
            .iter()
            .filter(|(s, _)| !before.contains(s))
            .copied()
            .collect();
        if let Some(node) = self.nodes[a].as_mut() {
            node.neighbors[level] = list;
        }
        for (b, dist) in added {
            self.connect(b, a, dist, level);
        }
    }

    fn reselect_entry_point(&mut self) {
        let best = self
            .nodes
            .iter()
            .enumerate()
            .filter_map(|(slot, n)| n.as_ref().map(|n| (slot, n.level())))
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)));
        match best {
            Some((slot, level)) => {
                self.entry_point = Some(slot);
                self.max_level = level;
            }
            None => {
                self.entry_point = None;
                self.max_level = 0;
            }
        }
    }

    /// Get statistics about the graph.
    pub fn stats(&self) -> GraphStats {
        let total_edges = self
            .nodes
            .iter()
            .flatten()
            .map(|n| n.neighbors.iter().map(Vec::len).sum::<usize>())
            .sum();
        GraphStats {
            num_nodes: self.key_to_slot.len(),
            tombstones: self.tombstones,
            max_level: self.max_level,
            total_edges,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn random_vectors(n: usize, dims: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| (0..dims).map(|_| rng.gen::<f32>()).collect())
            .collect()
    }

    fn build(n: usize, dims: usize) -> (ProximityGraph<String>, Vec<Vec<f32>>) {
        let vectors = random_vectors(n, dims, 42);
        let mut graph = ProximityGraph::new(
            dims as u16,
            DistanceMetric::Euclidean,
            GraphConfig::with_m(8).ef_construction(64).seed(1),
        );
        for (i, v) in vectors.iter().enumerate() {
            graph.insert(format!("v{i}"), v.clone()).unwrap();
        }
        (graph, vectors)
    }

    #[test]
    fn test_empty_graph_search() {
        let graph: ProximityGraph<String> =
            ProximityGraph::new(4, DistanceMetric::Euclidean, GraphConfig::default());
        assert!(graph.search(&[0.0; 4], 5, 10).is_empty());
        assert!(graph.is_empty());
    }

    #[test]
    fn test_exact_match_is_first() {
        let (graph, vectors) = build(300, 16);
        for i in [0usize, 17, 150, 299] {
            let results = graph.search(&vectors[i], 5, 50);
            assert_eq!(results[0].0, format!("v{i}"));
            assert!(results[0].1.abs() < 1e-6);
        }
    }

    #[test]
    fn test_results_sorted_and_bounded() {
        let (graph, _) = build(200, 8);
        let results = graph.search(&[0.5; 8], 10, 40);
        assert_eq!(results.len(), 10);
        for pair in results.windows(2) {
            assert!(pair[0].1 <= pair[1].1);
        }
    }

    #[test]
    fn test_neighbor_lists_respect_caps() {
        let (graph, _) = build(400, 8);
        for node in graph.nodes.iter().flatten() {
            for (level, links) in node.neighbors.iter().enumerate() {
                assert!(links.len() <= graph.max_links(level));
            }
        }
    }

    #[test]
    fn test_delete_hides_from_results() {
        let (mut graph, vectors) = build(100, 8);
        assert!(graph.delete(&"v5".to_string()));
        assert!(!graph.delete(&"v5".to_string()));
        let results = graph.search(&vectors[5], 10, 50);
        assert!(results.iter().all(|(k, _)| k != "v5"));
        assert_eq!(graph.len(), 99);
        assert_eq!(graph.tombstones(), 1);
    }

    #[test]
    fn test_search_with_unbounded_k_and_ef() {
        let (mut graph, _) = build(50, 8);
        graph.delete(&"v3".to_string());
        let results = graph.search(&[0.5; 8], usize::MAX, usize::MAX);
        assert!(results.len() > 40 && results.len() <= 49);
        assert!(results.iter().all(|(k, _)| k != "v3"));
        for pair in results.windows(2) {
            assert!(pair[0].1 <= pair[1].1);
        }
    }

    #[test]
    fn test_remove_repairs_references() {
        let (mut graph, vectors) = build(150, 8);
        let entry = graph.entry_key().cloned().unwrap();
        assert!(graph.remove(&entry));
        assert!(!graph.has_node(&entry));
        for node in graph.nodes.iter().flatten() {
            for links in &node.neighbors {
                assert!(links.iter().all(|(s, _)| graph.nodes[*s].is_some()));
            }
        }
        assert_ne!(graph.entry_key(), Some(&entry));
        let results = graph.search(&vectors[10], 1, 50);
        assert_eq!(results[0].0, "v10".to_string());
    }

    #[test]
    fn test_reinsert_replaces_node() {
        let (mut graph, _) = build(50, 4);
        graph.insert("v3".to_string(), vec![9.0; 4]).unwrap();
        assert_eq!(graph.len(), 50);
        assert_eq!(graph.vector(&"v3".to_string()), Some(&[9.0f32; 4][..]));
        let results = graph.search(&[9.0; 4], 1, 20);
        assert_eq!(results[0].0, "v3");
    }

    #[test]
    fn test_remove_all_then_insert() {
        let mut graph = ProximityGraph::new(2, DistanceMetric::Euclidean, GraphConfig::default());
        graph.insert(1u64, vec![0.0, 0.0]).unwrap();
        graph.insert(2u64, vec![1.0, 0.0]).unwrap();
        assert!(graph.remove(&1));
        assert!(graph.remove(&2));
        assert!(graph.search(&[0.0, 0.0], 1, 10).is_empty());
        graph.insert(3u64, vec![0.5, 0.5]).unwrap();
        assert_eq!(graph.search(&[0.0, 0.0], 1, 10)[0].0, 3);
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut graph: ProximityGraph<u64> =
            ProximityGraph::new(3, DistanceMetric::Cosine, GraphConfig::default());
        assert!(matches!(
            graph.insert(1, vec![1.0, 2.0]),
            Err(IvfError::DimensionMismatch { expected: 3, got: 2 })
        ));
    }

    #[test]
    fn test_serialize_and_restore() {
        let (graph, vectors) = build(80, 8);
        let bytes = bincode::serialize(&graph).unwrap();
        let mut loaded: ProximityGraph<String> = bincode::deserialize(&bytes).unwrap();
        loaded
            .restore(|key| {
                let i: usize = key[1..].parse().unwrap();
                Ok(vectors[i].clone())
            })
            .unwrap();
        assert_eq!(loaded.len(), 80);
        assert_eq!(
            loaded.search(&vectors[7], 3, 30),
            graph.search(&vectors[7], 3, 30)
        );
    }
}
