//! Query behaviour on small, hand-checked data sets.

use std::collections::HashMap;
use std::sync::Arc;

use proptest::prelude::*;
use syna_ivf::{ClusterIndex, DistanceMetric, Filter, InMemoryMetadata, IndexConfig, IvfError};
use tempfile::tempdir;

fn small_config(dims: u16, clusters: usize) -> IndexConfig {
    IndexConfig::new(dims, DistanceMetric::Euclidean)
        .initial_clusters(clusters)
        .thresholds(64, 0)
        .sync_on_write(false)
}

#[test]
fn test_nearest_two_of_four() {
    let dir = tempdir().expect("failed to create temp dir");
    let index = ClusterIndex::open(dir.path(), small_config(3, 3)).expect("failed to open index");

    let items = vec![
        ("a".to_string(), vec![1.0, 0.0, 0.0], None),
        ("b".to_string(), vec![0.0, 1.0, 0.0], None),
        ("c".to_string(), vec![0.0, 0.0, 1.0], None),
        ("d".to_string(), vec![1.0, 1.0, 0.0], None),
    ];
    index.put_all(items).expect("put_all should succeed");
    assert_eq!(index.clusters().len(), 3);

    let hits = index.query(&[1.0, 0.1, 0.0], 2, 3, None).expect("query should succeed");
    let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "d"]);
    assert!(hits[0].distance < hits[1].distance);
}

#[test]
fn test_round_trip_is_exact() {
    let dir = tempdir().expect("failed to create temp dir");
    let index = ClusterIndex::open(dir.path(), small_config(4, 2)).expect("failed to open index");
    let awkward = vec![f32::MIN_POSITIVE, -0.0, 1e30, -123.456];
    index.put("awkward", &awkward, None).expect("put should succeed");
    let back = index.get("awkward").expect("get should succeed");
    assert_eq!(
        back.iter().map(|x| x.to_bits()).collect::<Vec<_>>(),
        awkward.iter().map(|x| x.to_bits()).collect::<Vec<_>>()
    );
    assert!(matches!(index.get("missing"), Err(IvfError::NotFound(_))));
}

#[test]
fn test_query_on_empty_index() {
    let dir = tempdir().expect("failed to create temp dir");
    let index = ClusterIndex::open(dir.path(), small_config(2, 2)).expect("failed to open index");
    assert!(index.query(&[0.0, 0.0], 5, 4, None).unwrap().is_empty());
    assert!(matches!(
        index.query(&[0.0, 0.0, 0.0], 5, 4, None),
        Err(IvfError::DimensionMismatch { expected: 2, got: 3 })
    ));
}

#[test]
fn test_unbounded_k_returns_everything() {
    let dir = tempdir().expect("failed to create temp dir");
    let index = ClusterIndex::open(dir.path(), small_config(3, 2))
        .expect("failed to open index")
        .with_metadata(Arc::new(InMemoryMetadata::new()));
    let tagged = |kind: &str| Some(HashMap::from([("kind".to_string(), kind.to_string())]));
    index.put("near", &[1.0, 0.0, 0.0], tagged("doc")).expect("put should succeed");
    index.put("far", &[0.0, 9.0, 0.0], tagged("img")).expect("put should succeed");

    let hits = index.query(&[1.0, 0.0, 0.0], usize::MAX, 2, None).expect("query should succeed");
    let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
    assert_eq!(ids, vec!["near", "far"]);

    let filter = Filter::eq("kind", "img");
    let hits = index
        .query(&[1.0, 0.0, 0.0], usize::MAX, usize::MAX, Some(&filter))
        .expect("filtered query should succeed");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, "far");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Results never exceed `k` and come back sorted by distance.
    #[test]
    fn prop_results_bounded_and_sorted(
        points in prop::collection::vec(prop::collection::vec(-50.0f32..50.0, 3), 1..120),
        query in prop::collection::vec(-50.0f32..50.0, 3),
        k in 1usize..20,
        nprobe in 1usize..6,
    ) {
        let dir = tempdir().expect("failed to create temp dir");
        let index = ClusterIndex::open(dir.path(), small_config(3, 4)).expect("failed to open index");
        let items = points
            .iter()
            .enumerate()
            .map(|(i, p)| (format!("p{i}"), p.clone(), None))
            .collect();
        index.put_all(items).expect("put_all should succeed");

        let hits = index.query(&query, k, nprobe, None).expect("query should succeed");
        prop_assert!(hits.len() <= k);
        for pair in hits.windows(2) {
            prop_assert!(pair[0].distance <= pair[1].distance);
        }
        for hit in &hits {
            let stored = index.get(&hit.id).expect("hit should be retrievable");
            let expected = DistanceMetric::Euclidean.distance(&query, &stored);
            prop_assert!((expected - hit.distance).abs() < 1e-3);
        }
    }
}
