// Copyright (c) 2025 SynaDB Contributors
// Licensed under the SynaDB License. See LICENSE file for details.

//! Query coordination across clusters.
//!
//! A query runs in four steps:
//!
//! 1. shortlist the `nprobe` nearest centroids from the global graph
//! 2. search each shortlisted cluster's local graph, in parallel
//! 3. drop candidates rejected by the metadata filter
//! 4. k-way merge the per-cluster lists into the final top-k
//!
//! If a shortlisted cluster is retired by a concurrent split or merge, the
//! whole query restarts against the refreshed global graph.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use rayon::prelude::*;
use tracing::{debug, instrument};

use crate::collab::Filter;
use crate::error::{IvfError, Result};
use crate::index::Core;
use crate::types::QueryHit;

/// Query counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryStats {
    /// Queries answered.
    pub queries: u64,
    /// Restarts caused by stale cluster ids or pin contention.
    pub retries: u64,
}

/// Fans a query out over the shortlisted clusters and merges the results.
#[derive(Debug)]
pub struct QueryCoordinator {
    max_retries: usize,
    filter_overfetch: usize,
    queries: AtomicU64,
    retries: AtomicU64,
}

impl QueryCoordinator {
    /// Creates a coordinator.
    ///
    /// `filter_overfetch` multiplies the per-cluster candidate count when a
    /// filter is present, so post-filtering still leaves `k` results.
    pub fn new(max_retries: usize, filter_overfetch: usize) -> Self {
        Self {
            max_retries,
            filter_overfetch: filter_overfetch.max(1),
            queries: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        }
    }

    /// Counters since open.
    pub fn stats(&self) -> QueryStats {
        QueryStats {
            queries: self.queries.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }

    /// Top-`k` hits for `vector` across the `nprobe` nearest clusters,
    /// sorted by distance with ties broken by id.
    #[instrument(level = "debug", skip(self, core, vector, filter))]
    pub(crate) fn query(
        &self,
        core: &Core,
        vector: &[f32],
        k: usize,
        nprobe: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<QueryHit>> {
        if vector.len() != core.config.dimensions as usize {
            return Err(IvfError::DimensionMismatch {
                expected: core.config.dimensions,
                got: vector.len(),
            });
        }
        if k == 0 || nprobe == 0 {
            return Ok(Vec::new());
        }

        let mut attempt = 0;
        loop {
            match self.attempt(core, vector, k, nprobe, filter) {
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    debug!(attempt, error = %e, "retrying query against refreshed centroid graph");
                }
                Err(e) => return Err(e),
                Ok(hits) => {
                    self.queries.fetch_add(1, Ordering::Relaxed);
                    return Ok(hits);
                }
            }
        }
    }

    fn attempt(
        &self,
        core: &Core,
        vector: &[f32],
        k: usize,
        nprobe: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<QueryHit>> {
        let shortlist = core.global.read().shortlist(vector, nprobe);
        if shortlist.is_empty() {
            return Ok(Vec::new());
        }

        let fetch = match filter {
            Some(_) => k.saturating_mul(self.filter_overfetch),
            None => k,
        };
        let lists: Vec<Vec<(String, f32)>> = shortlist
            .par_iter()
            .map(|&id| {
                core.cache
                    .read(id, |c| c.search(vector, fetch, c.ef_search().max(fetch)))
            })
            .collect::<Result<_>>()?;

        let lists = match filter {
            Some(filter) => lists
                .into_iter()
                .map(|list| retain_matching(core, filter, list))
                .collect::<Result<Vec<_>>>()?,
            None => lists,
        };

        merge_ranked(lists, k)
            .into_iter()
            .map(|(id, distance)| {
                let metadata = match &core.metadata {
                    Some(index) => index.get_attributes(&id)?,
                    None => None,
                };
                Ok(QueryHit {
                    id,
                    distance,
                    metadata,
                })
            })
            .collect()
    }
}

fn retain_matching(
    core: &Core,
    filter: &Filter,
    list: Vec<(String, f32)>,
) -> Result<Vec<(String, f32)>> {
    let mut kept = Vec::with_capacity(list.len());
    for (id, distance) in list {
        let pass = match &core.metadata {
            Some(index) => index.evaluate(filter, &id)?,
            None => filter.matches(None),
        };
        if pass {
            kept.push((id, distance));
        }
    }
    Ok(kept)
}

struct Head {
    distance: f32,
    id: String,
    list: usize,
    pos: usize,
}

impl PartialEq for Head {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Head {}

impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Head {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed for a min-heap on (distance, id)
        other
            .distance
            .total_cmp(&self.distance)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// Merges lists already sorted by distance into the `k` nearest, ties broken
/// by id. An id present in several lists is kept once, at its best distance.
pub fn merge_ranked(lists: Vec<Vec<(String, f32)>>, k: usize) -> Vec<(String, f32)> {
    let mut lists: Vec<Vec<(String, f32)>> = lists
        .into_iter()
        .map(|mut list| {
            list.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
            list
        })
        .collect();

    let mut heap = BinaryHeap::with_capacity(lists.len());
    for (i, list) in lists.iter_mut().enumerate() {
        if let Some((id, distance)) = list.first_mut() {
            heap.push(Head {
                distance: *distance,
                id: std::mem::take(id),
                list: i,
                pos: 0,
            });
        }
    }

    let total: usize = lists.iter().map(Vec::len).sum();
    let mut seen = HashSet::new();
    let mut merged = Vec::with_capacity(k.min(total));
    while let Some(head) = heap.pop() {
        if merged.len() >= k {
            break;
        }
        let next = head.pos + 1;
        if let Some((id, distance)) = lists[head.list].get_mut(next) {
            heap.push(Head {
                distance: *distance,
                id: std::mem::take(id),
                list: head.list,
                pos: next,
            });
        }
        if seen.insert(head.id.clone()) {
            merged.push((head.id, head.distance));
        }
    }
    merged
}
