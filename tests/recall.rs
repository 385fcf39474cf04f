//! Recall of the clustered index against brute force.
//!
//! 10,000 uniform vectors of dimension 128, 100 random queries, top-10 with
//! nProbe 8. On average at least 9 of the true top-10 must be returned.
//!
//! A second scenario keeps many more clusters than nProbe, so the shortlist
//! comes from the centroid graph rather than an exhaustive centroid scan.

use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use syna_ivf::{ClusterIndex, DistanceMetric, GraphConfig, IndexConfig};
use tempfile::tempdir;

const DIMS: usize = 128;
const VECTORS: usize = 10_000;
const QUERIES: usize = 100;
const K: usize = 10;

fn random_vector(rng: &mut StdRng) -> Vec<f32> {
    random_vector_of(rng, DIMS)
}

fn random_vector_of(rng: &mut StdRng, dims: usize) -> Vec<f32> {
    (0..dims).map(|_| rng.gen::<f32>()).collect()
}

/// Ground truth by exhaustive scan.
fn brute_force(vectors: &[(String, Vec<f32>)], query: &[f32], k: usize) -> Vec<String> {
    let mut distances: Vec<(&String, f32)> = vectors
        .iter()
        .map(|(id, v)| (id, DistanceMetric::Euclidean.distance(query, v)))
        .collect();
    distances.sort_by(|a, b| a.1.total_cmp(&b.1));
    distances.into_iter().take(k).map(|(id, _)| id.clone()).collect()
}

#[test]
fn test_recall_at_10_with_nprobe_8() {
    let dir = tempdir().expect("failed to create temp dir");
    let config = IndexConfig::new(DIMS as u16, DistanceMetric::Euclidean)
        .initial_clusters(8)
        .thresholds(VECTORS * 2, 16)
        .local_graph(GraphConfig::with_m(12).ef_construction(64).ef_search(256).seed(11))
        .nprobe(8)
        .sync_on_write(false);
    let index = ClusterIndex::open(dir.path(), config).expect("failed to open index");

    let mut rng = StdRng::seed_from_u64(42);
    let vectors: Vec<(String, Vec<f32>)> = (0..VECTORS)
        .map(|i| (format!("v{i}"), random_vector(&mut rng)))
        .collect();

    for chunk in vectors.chunks(1_000) {
        let batch = chunk
            .iter()
            .map(|(id, v)| (id.clone(), v.clone(), None))
            .collect();
        index.put_all(batch).expect("put_all should succeed");
    }
    assert_eq!(index.len(), VECTORS);
    index.check_invariants().expect("invariants should hold");

    let mut total_recall = 0.0;
    for _ in 0..QUERIES {
        let query = random_vector(&mut rng);
        let hits = index.query(&query, K, 8, None).expect("query should succeed");
        assert!(hits.len() <= K);
        for pair in hits.windows(2) {
            assert!(pair[0].distance <= pair[1].distance);
        }

        let truth: HashSet<String> = brute_force(&vectors, &query, K).into_iter().collect();
        let found = hits.iter().filter(|h| truth.contains(&h.id)).count();
        total_recall += found as f64 / K as f64;
    }

    let average = total_recall / QUERIES as f64;
    assert!(average >= 0.9, "average recall@10 was {average:.3}");
}

#[test]
fn test_recall_grows_with_nprobe() {
    const DIMS: usize = 8;
    const VECTORS: usize = 4_000;
    const CLUSTERS: usize = 32;

    let dir = tempdir().expect("failed to create temp dir");
    let config = IndexConfig::new(DIMS as u16, DistanceMetric::Euclidean)
        .initial_clusters(CLUSTERS)
        .thresholds(VECTORS * 2, 4)
        .local_graph(GraphConfig::with_m(12).ef_construction(64).ef_search(256).seed(5))
        .sync_on_write(false);
    let index = ClusterIndex::open(dir.path(), config).expect("failed to open index");

    let mut rng = StdRng::seed_from_u64(7);
    let vectors: Vec<(String, Vec<f32>)> = (0..VECTORS)
        .map(|i| (format!("v{i}"), random_vector_of(&mut rng, DIMS)))
        .collect();
    let batch = vectors
        .iter()
        .map(|(id, v)| (id.clone(), v.clone(), None))
        .collect();
    index.put_all(batch).expect("put_all should succeed");
    assert!(index.clusters().len() > 8, "only {} clusters", index.clusters().len());

    let queries: Vec<Vec<f32>> = (0..QUERIES).map(|_| random_vector_of(&mut rng, DIMS)).collect();
    let truths: Vec<HashSet<String>> = queries
        .iter()
        .map(|q| brute_force(&vectors, q, K).into_iter().collect())
        .collect();

    let recall_at = |nprobe: usize| -> f64 {
        let mut total = 0.0;
        for (query, truth) in queries.iter().zip(&truths) {
            let hits = index.query(query, K, nprobe, None).expect("query should succeed");
            let found = hits.iter().filter(|h| truth.contains(&h.id)).count();
            total += found as f64 / K as f64;
        }
        total / QUERIES as f64
    };

    let (r2, r4, r8) = (recall_at(2), recall_at(4), recall_at(8));
    assert!(r2 <= r4 && r4 <= r8, "recall fell as nprobe grew: {r2:.3} {r4:.3} {r8:.3}");
    assert!(r8 > r2, "no recall gain from nprobe 2 to 8: {r2:.3} -> {r8:.3}");
    assert!(r8 >= 0.8, "recall@10 at nprobe 8 was {r8:.3}");
}
