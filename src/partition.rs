// Copyright (c) 2025 SynaDB Contributors
// Licensed under the SynaDB License. See LICENSE file for details.

//! Vector-to-cluster assignment.
//!
//! - Bootstrap: k-means over a sample seeds the first generation of centroids
//! - Routing: a new vector goes to the cluster with the nearest centroid
//! - Split clustering: 2-means over one cluster's live members
//!
//! Assignment steps run on the rayon pool.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::config::RebalanceConfig;
use crate::distance::{self, DistanceMetric};
use crate::error::{IvfError, Result};
use crate::global::GlobalGraph;
use crate::types::ClusterId;

/// Assigns each vector to the index of its nearest centroid.
pub fn assign(vectors: &[&[f32]], centroids: &[Vec<f32>], metric: DistanceMetric) -> Vec<usize> {
    vectors
        .par_iter()
        .map(|v| nearest_centroid(v, centroids, metric))
        .collect()
}

fn nearest_centroid(vector: &[f32], centroids: &[Vec<f32>], metric: DistanceMetric) -> usize {
    let mut best = 0;
    let mut best_dist = f32::MAX;
    for (i, c) in centroids.iter().enumerate() {
        let d = metric.distance(vector, c);
        if d < best_dist {
            best_dist = d;
            best = i;
        }
    }
    best
}

/// Lloyd's k-means from `initial` centroids.
///
/// A centroid that loses all its members keeps its previous position.
pub fn lloyd(
    vectors: &[&[f32]],
    mut centroids: Vec<Vec<f32>>,
    iterations: usize,
    metric: DistanceMetric,
) -> (Vec<Vec<f32>>, Vec<usize>) {
    let dims = centroids.first().map(Vec::len).unwrap_or(0);
    let mut labels = assign(vectors, &centroids, metric);

    for _ in 0..iterations {
        let mut sums = vec![vec![0.0f32; dims]; centroids.len()];
        let mut counts = vec![0usize; centroids.len()];
        for (v, &label) in vectors.iter().zip(labels.iter()) {
            for (s, x) in sums[label].iter_mut().zip(v.iter()) {
                *s += x;
            }
            counts[label] += 1;
        }
        for (i, (sum, count)) in sums.into_iter().zip(counts).enumerate() {
            if count > 0 {
                let n = count as f32;
                centroids[i] = sum.into_iter().map(|s| s / n).collect();
            }
        }

        let next = assign(vectors, &centroids, metric);
        let converged = next == labels;
        labels = next;
        if converged {
            break;
        }
    }
    (centroids, labels)
}

/// k-means with k-means++ seeding. Returns at most `k` centroids; with
/// fewer than `k` vectors, each vector becomes its own centroid.
pub fn kmeans<R: Rng>(
    vectors: &[&[f32]],
    k: usize,
    iterations: usize,
    metric: DistanceMetric,
    rng: &mut R,
) -> Vec<Vec<f32>> {
    if vectors.is_empty() || k == 0 {
        return Vec::new();
    }
    if vectors.len() <= k {
        return vectors.iter().map(|v| v.to_vec()).collect();
    }
    let initial = seed_plus_plus(vectors, k, metric, rng);
    lloyd(vectors, initial, iterations, metric).0
}

/// k-means++ seeding: each next seed is drawn with probability proportional
/// to its squared distance from the nearest seed so far.
fn seed_plus_plus<R: Rng>(
    vectors: &[&[f32]],
    k: usize,
    metric: DistanceMetric,
    rng: &mut R,
) -> Vec<Vec<f32>> {
    let n = vectors.len();
    let first = rng.gen_range(0..n);
    let mut seeds = vec![vectors[first].to_vec()];
    let weight = |d: f32| {
        let d = d.max(0.0);
        d * d
    };
    let mut nearest: Vec<f32> = vectors
        .par_iter()
        .map(|v| weight(metric.distance(v, vectors[first])))
        .collect();

    while seeds.len() < k {
        let total: f32 = nearest.iter().sum();
        let pick = if total > 0.0 && total.is_finite() {
            let mut target = rng.gen::<f32>() * total;
            let mut chosen = n - 1;
            for (i, w) in nearest.iter().enumerate() {
                if target < *w {
                    chosen = i;
                    break;
                }
                target -= w;
            }
            chosen
        } else {
            rng.gen_range(0..n)
        };
        let seed = vectors[pick];
        seeds.push(seed.to_vec());
        nearest
            .par_iter_mut()
            .zip(vectors.par_iter())
            .for_each(|(w, v)| *w = w.min(weight(metric.distance(v, seed))));
    }
    seeds
}

/// Splits `vectors` into two non-empty groups; returns a 0/1 label per vector.
///
/// Seeds are the member farthest from the mean and the member farthest from
/// that one. If 2-means still leaves a side empty (all members identical),
/// the members are split by position.
pub fn two_means(vectors: &[&[f32]], iterations: usize, metric: DistanceMetric) -> Vec<usize> {
    let n = vectors.len();
    if n < 2 {
        return vec![0; n];
    }
    let dims = vectors[0].len();
    let mean = distance::centroid(vectors.iter().copied(), dims);
    let farthest_from = |anchor: &[f32]| {
        let mut best = 0;
        let mut best_dist = f32::MIN;
        for (i, v) in vectors.iter().enumerate() {
            let d = metric.distance(v, anchor);
            if d > best_dist {
                best_dist = d;
                best = i;
            }
        }
        best
    };
    let a = farthest_from(&mean[..]);
    let b = farthest_from(vectors[a]);

    let (_, mut labels) = lloyd(
        vectors,
        vec![vectors[a].to_vec(), vectors[b].to_vec()],
        iterations,
        metric,
    );

    let ones = labels.iter().filter(|&&l| l == 1).count();
    if ones == 0 || ones == n {
        for (i, label) in labels.iter_mut().enumerate() {
            *label = usize::from(i >= n / 2);
        }
    }
    labels
}

/// Bootstrap, routing and split clustering for one index.
pub struct Partitioner {
    metric: DistanceMetric,
    config: RebalanceConfig,
    rng: Mutex<StdRng>,
}

impl Partitioner {
    /// Creates a partitioner. `seed` fixes bootstrap sampling.
    pub fn new(metric: DistanceMetric, config: RebalanceConfig, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            metric,
            config,
            rng: Mutex::new(rng),
        }
    }

    /// Rebalance thresholds.
    pub fn config(&self) -> &RebalanceConfig {
        &self.config
    }

    /// Initial centroids from a representative sample.
    ///
    /// At most `bootstrap_sample` vectors are used, drawn uniformly.
    pub fn bootstrap_centroids(&self, sample: &[&[f32]]) -> Vec<Vec<f32>> {
        let mut rng = self.rng.lock();
        let limit = self.config.bootstrap_sample.max(self.config.initial_clusters);
        let drawn: Vec<&[f32]> = if sample.len() > limit {
            index::sample(&mut *rng, sample.len(), limit)
                .into_iter()
                .map(|i| sample[i])
                .collect()
        } else {
            sample.to_vec()
        };
        kmeans(
            &drawn,
            self.config.initial_clusters,
            self.config.kmeans_iterations,
            self.metric,
            &mut *rng,
        )
    }

    /// The cluster a new vector belongs to.
    ///
    /// # Errors
    ///
    /// * `IvfError::NotBootstrapped` - If there are no clusters yet
    pub fn route(&self, global: &GlobalGraph, vector: &[f32]) -> Result<ClusterId> {
        global.nearest(vector).ok_or(IvfError::NotBootstrapped)
    }

    /// 0/1 labels splitting one cluster's members.
    pub fn split_labels(&self, vectors: &[&[f32]]) -> Vec<usize> {
        two_means(vectors, self.config.kmeans_iterations, self.metric)
    }

    /// Returns true if a cluster with `live` members is above the high-water mark.
    pub fn needs_split(&self, live: usize) -> bool {
        live > self.config.split_threshold
    }

    /// Returns true if a cluster with `live` members is below the low-water mark.
    pub fn needs_merge(&self, live: usize) -> bool {
        live < self.config.merge_threshold
    }

    /// Returns true if a cluster's tombstones warrant an in-place rebuild.
    pub fn needs_compaction(&self, live: usize, tombstones: usize) -> bool {
        let total = live + tombstones;
        total > 0 && tombstones as f32 / total as f32 > self.config.tombstone_compact_ratio
    }
}
