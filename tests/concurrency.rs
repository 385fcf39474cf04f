//! Concurrent writers, movers and readers over a shared index.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use syna_ivf::{ClusterIndex, DistanceMetric, IndexConfig};
use tempfile::tempdir;

const DIMS: usize = 8;

fn vector(seed: usize) -> Vec<f32> {
    (0..DIMS)
        .map(|j| ((seed * DIMS + j) as f32 * 0.37).sin() * 10.0)
        .collect()
}

#[test]
fn test_parallel_puts_queries_and_moves() {
    let dir = tempdir().expect("failed to create temp dir");
    let mut config = IndexConfig::new(DIMS as u16, DistanceMetric::Euclidean)
        .initial_clusters(4)
        .thresholds(60, 5)
        .sync_on_write(false);
    config.max_retries = 16;
    let index = ClusterIndex::open(dir.path(), config).expect("failed to open index");
    let sample: Vec<Vec<f32>> = (0..64).map(|i| vector(10_000 + i)).collect();
    index.bootstrap(&sample).expect("bootstrap should succeed");

    let writers = 4;
    let per_writer = 150;
    let moves = 200;

    thread::scope(|s| {
        for w in 0..writers {
            let index = &index;
            s.spawn(move || {
                for i in 0..per_writer {
                    let n = w * per_writer + i;
                    index
                        .put(&format!("w{n}"), &vector(n), None)
                        .expect("put should succeed");
                }
            });
        }

        // Re-puts the same ids so they move between clusters under load.
        let index = &index;
        s.spawn(move || {
            for round in 0..moves {
                index
                    .put(&format!("m{}", round % 10), &vector(50_000 + round), None)
                    .expect("move should succeed");
            }
        });

        let readers: Vec<_> = (0..2)
            .map(|r| {
                s.spawn(move || {
                    let mut answered = 0;
                    for q in 0..100 {
                        match index.query(&vector(r * 1000 + q), 5, 3, None) {
                            Ok(hits) => {
                                assert!(hits.len() <= 5);
                                for pair in hits.windows(2) {
                                    assert!(pair[0].distance <= pair[1].distance);
                                }
                                answered += 1;
                            }
                            Err(e) => assert!(e.is_retryable(), "unexpected error {e}"),
                        }
                    }
                    answered
                })
            })
            .collect();

        for reader in readers {
            let answered = reader.join().expect("reader panicked");
            assert!(answered > 0);
        }
    });

    assert_eq!(index.len(), writers * per_writer + 10);
    for n in 0..writers * per_writer {
        assert_eq!(index.get(&format!("w{n}")).unwrap(), vector(n));
    }
    index.check_invariants().expect("invariants should hold");
    assert!(index.stats().rebalance.splits > 0);
    for m in 0..10 {
        let last_round = moves - 10 + m;
        assert_eq!(index.get(&format!("m{m}")).unwrap(), vector(50_000 + last_round));
    }
}

#[test]
fn test_get_sees_moving_vector() {
    let dir = tempdir().expect("failed to create temp dir");
    let mut config = IndexConfig::new(2, DistanceMetric::Euclidean)
        .initial_clusters(2)
        .thresholds(1_000, 0)
        .sync_on_write(false);
    config.max_retries = 64;
    let index = ClusterIndex::open(dir.path(), config).expect("failed to open index");
    let left = [-100.0f32, 0.0];
    let right = [100.0f32, 0.0];
    index
        .bootstrap(&[left.to_vec(), right.to_vec()])
        .expect("bootstrap should succeed");
    index.put("x", &left, None).expect("put should succeed");
    let left_cluster = index.cluster_of("x").expect("x should be indexed");

    let moves = 1_000;
    let done = AtomicBool::new(false);
    thread::scope(|s| {
        let readers: Vec<_> = (0..3)
            .map(|_| {
                s.spawn(|| {
                    let mut reads = 0;
                    while !done.load(Ordering::Acquire) {
                        let v = index.get("x").expect("a moving vector stays readable");
                        assert!(v == left || v == right, "unexpected payload {v:?}");
                        reads += 1;
                    }
                    reads
                })
            })
            .collect();

        for round in 0..moves {
            let target = if round % 2 == 0 { &right } else { &left };
            index.put("x", target, None).expect("move should succeed");
        }
        done.store(true, Ordering::Release);

        for reader in readers {
            reader.join().expect("reader panicked");
        }
    });

    assert_eq!(index.get("x").unwrap(), left.to_vec());
    assert_eq!(index.cluster_of("x"), Some(left_cluster));
    assert_eq!(index.clusters().len(), 2);
    index.check_invariants().expect("invariants should hold");
}
