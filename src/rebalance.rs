// Copyright (c) 2025 SynaDB Contributors
// Licensed under the SynaDB License. See LICENSE file for details.

//! Online split, merge and compaction of clusters.
//!
//! Every operation pins all clusters it touches before reading them, builds
//! the replacement clusters from scratch out of live members, and commits in
//! this order:
//!
//! 1. new cluster files are written
//! 2. the manifest is rewritten with the new topology
//! 3. the vector directory is repointed
//! 4. the old clusters are retired and their files deleted
//!
//! A crash before step 2 leaves orphan files for the new clusters; a crash
//! after it leaves orphan files for the old ones. Both are removed on open.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info, warn};

use crate::cache::PinnedSet;
use crate::cluster::Cluster;
use crate::error::{IvfError, Result};
use crate::index::Core;
use crate::types::{ClusterId, VectorRecord};

/// Rebalance counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebalanceStats {
    /// Clusters split in two.
    pub splits: u64,
    /// Cluster pairs merged.
    pub merges: u64,
    /// Clusters rebuilt to drop tombstones.
    pub compactions: u64,
}

/// Keeps cluster sizes between the low- and high-water marks.
#[derive(Debug, Default)]
pub struct Rebalancer {
    splits: AtomicU64,
    merges: AtomicU64,
    compactions: AtomicU64,
}

impl Rebalancer {
    /// Creates a rebalancer with zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters since open.
    pub fn stats(&self) -> RebalanceStats {
        RebalanceStats {
            splits: self.splits.load(Ordering::Relaxed),
            merges: self.merges.load(Ordering::Relaxed),
            compactions: self.compactions.load(Ordering::Relaxed),
        }
    }

    /// Checks `touched` clusters and splits, merges or compacts them as needed.
    ///
    /// Clusters produced by a split or merge are checked again. Contention is
    /// not an error here: a cluster that cannot be pinned is left for the next
    /// write that touches it.
    pub(crate) fn maintain(&self, core: &Core, touched: &[ClusterId]) -> Result<()> {
        let mut work: Vec<ClusterId> = touched.to_vec();
        work.sort_unstable();
        work.dedup();

        while let Some(id) = work.pop() {
            let (live, tombstones) = match core.cache.read(id, |c| (c.len(), c.tombstones())) {
                Ok(sizes) => sizes,
                Err(IvfError::RebalanceConflict(_)) => continue,
                Err(e) => return Err(e),
            };

            let outcome = if core.partitioner.needs_split(live) {
                self.split(core, id)
            } else if core.partitioner.needs_merge(live) {
                self.merge(core, id)
            } else if core.partitioner.needs_compaction(live, tombstones) {
                self.compact(core, id).map(|_| Vec::new())
            } else {
                continue;
            };

            match outcome {
                Ok(produced) => work.extend(produced),
                Err(e) if e.is_retryable() => {
                    debug!(cluster = %id, error = %e, "deferring maintenance");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Splits `id` in two with 2-means over its live members.
    ///
    /// Returns the new cluster ids, or nothing if the cluster no longer
    /// exceeds the high-water mark.
    pub(crate) fn split(&self, core: &Core, id: ClusterId) -> Result<Vec<ClusterId>> {
        let pins = core.cache.sync_lock(&[id])?;
        let entries = pins.read(id, |c| {
            core.partitioner
                .needs_split(c.len())
                .then(|| c.live_entries())
        })?;
        let Some(entries) = entries else {
            pins.unlock()?;
            return Ok(Vec::new());
        };

        let labels = {
            let vectors: Vec<&[f32]> = entries.iter().map(|(_, v)| v.as_slice()).collect();
            core.partitioner.split_labels(&vectors)
        };
        let before = entries.len();
        let (mut left, mut right) = (Vec::new(), Vec::new());
        for (entry, label) in entries.into_iter().zip(labels) {
            if label == 0 {
                left.push(entry);
            } else {
                right.push(entry);
            }
        }

        let (a_id, b_id) = {
            let mut global = core.global.write();
            (global.allocate_id(), global.allocate_id())
        };
        let (left_len, right_len) = (left.len(), right.len());
        let a = build(core, a_id, left)?;
        let b = build(core, b_id, right)?;

        let produced = publish(core, pins, vec![a, b], &[id])?;
        self.splits.fetch_add(1, Ordering::Relaxed);
        info!(
            cluster = %id,
            members = before,
            left = %a_id,
            left_members = left_len,
            right = %b_id,
            right_members = right_len,
            "split cluster"
        );
        Ok(produced)
    }

    /// Merges `id` with its nearest sibling by centroid.
    ///
    /// Skipped when there is no sibling, when `id` is no longer below the
    /// low-water mark, or when the merged cluster would exceed the high-water mark.
    pub(crate) fn merge(&self, core: &Core, id: ClusterId) -> Result<Vec<ClusterId>> {
        let Some(sibling) = core.global.read().nearest_sibling(id) else {
            return Ok(Vec::new());
        };
        let pins = core.cache.sync_lock(&[id, sibling])?;
        let small = pins.read(id, Cluster::len)?;
        let other = pins.read(sibling, Cluster::len)?;
        if !core.partitioner.needs_merge(small)
            || small + other > core.partitioner.config().split_threshold
        {
            pins.unlock()?;
            return Ok(Vec::new());
        }

        let mut entries = pins.read(id, Cluster::live_entries)?;
        entries.extend(pins.read(sibling, Cluster::live_entries)?);
        let merged_id = core.global.write().allocate_id();
        let merged = build(core, merged_id, entries)?;

        let produced = publish(core, pins, vec![merged], &[id, sibling])?;
        self.merges.fetch_add(1, Ordering::Relaxed);
        info!(
            cluster = %id,
            sibling = %sibling,
            merged = %merged_id,
            members = small + other,
            "merged clusters"
        );
        Ok(produced)
    }

    /// Rebuilds `id`'s local graph in place to reclaim tombstones.
    pub(crate) fn compact(&self, core: &Core, id: ClusterId) -> Result<usize> {
        let pins = core.cache.sync_lock(&[id])?;
        let metric = core.config.metric;
        let reclaimed = pins.write(id, |c| {
            if core.partitioner.needs_compaction(c.len(), c.tombstones()) {
                c.compact(metric)
            } else {
                Ok(0)
            }
        })??;
        pins.unlock()?;
        if reclaimed > 0 {
            self.compactions.fetch_add(1, Ordering::Relaxed);
            debug!(cluster = %id, reclaimed, "compacted cluster");
        }
        Ok(reclaimed)
    }
}

fn build(core: &Core, id: ClusterId, entries: Vec<(VectorRecord, Vec<f32>)>) -> Result<Cluster> {
    Cluster::from_entries(
        id,
        entries,
        core.config.dimensions,
        core.config.metric,
        core.config.local.clone(),
    )
}

/// Publishes `built` in place of `retired` and releases `pins`.
///
/// On failure before the manifest is written, the new clusters are discarded
/// and the old ones stay live. With nothing retired this just adds clusters.
pub(crate) fn publish(
    core: &Core,
    mut pins: PinnedSet<'_>,
    built: Vec<Cluster>,
    retired: &[ClusterId],
) -> Result<Vec<ClusterId>> {
    let new_ids: Vec<ClusterId> = built.iter().map(Cluster::id).collect();
    let add: Vec<(ClusterId, Vec<f32>)> = built
        .iter()
        .map(|c| (c.id(), c.centroid().to_vec()))
        .collect();
    let moved: Vec<(String, ClusterId)> = built
        .iter()
        .flat_map(|c| c.records().map(move |r| (r.id.clone(), c.id())))
        .collect();
    let mut lost = Vec::new();
    for &id in retired {
        lost.extend(pins.read(id, |c| c.quarantined().cloned().collect::<Vec<_>>())?);
    }

    for cluster in built {
        pins.adopt(cluster);
    }

    let published = pins.flush().and_then(|_| {
        let mut global = core.global.write();
        let mut next = global.clone();
        next.update_graph(add, retired)?;
        next.save(&core.dir, &core.config)?;
        *global = next;
        Ok(())
    });
    if let Err(e) = published {
        for id in &new_ids {
            if let Err(cleanup) = pins.retire(*id) {
                warn!(cluster = %id, error = %cleanup, "failed to discard unpublished cluster");
            }
        }
        return Err(e);
    }

    {
        let mut directory = core.directory.write();
        for (vector_id, cluster) in moved {
            directory.insert(vector_id, cluster);
        }
        for vector_id in lost {
            if directory.get(&vector_id).is_some_and(|c| retired.contains(c)) {
                directory.remove(&vector_id);
            }
        }
    }

    for id in retired {
        if let Err(e) = pins.retire(*id) {
            warn!(cluster = %id, error = %e, "retired cluster file left behind");
        }
    }
    pins.unlock()?;
    Ok(new_ids)
}
