// Copyright (c) 2025 SynaDB Contributors
// Licensed under the SynaDB License. See LICENSE file for details.

//! Persistent cluster-partitioned vector index.
//!
//! [`ClusterIndex`] ties the components together:
//!
//! - a [`VectorStore`] holding every payload, append-only
//! - a [`CacheManager`] owning which clusters are in memory
//! - a [`GlobalGraph`] over cluster centroids, persisted as the manifest
//! - a directory mapping each vector id to the one cluster holding it
//!
//! # Example
//!
//! ```rust,no_run
//! use syna_ivf::{ClusterIndex, DistanceMetric, IndexConfig};
//!
//! let config = IndexConfig::new(3, DistanceMetric::Euclidean).initial_clusters(2);
//! let index = ClusterIndex::open("my_index", config).unwrap();
//!
//! index.put("a", &[1.0, 0.0, 0.0], None).unwrap();
//! index.put("b", &[0.0, 1.0, 0.0], None).unwrap();
//!
//! let hits = index.query(&[0.9, 0.1, 0.0], 1, 2, None).unwrap();
//! assert_eq!(hits[0].id, "a");
//! ```
//!
//! # Directory discipline
//!
//! A vector id's directory entry only changes while the writer holds the pin
//! of the cluster the entry points to. A first insert claims the entry before
//! touching the cluster, so two concurrent inserts of a new id cannot land in
//! two clusters.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::cache::{CacheManager, CacheStats, PinnedSet};
use crate::cluster::{parse_cluster_file_name, Cluster};
use crate::collab::{Filter, MetadataIndex, Tensor, TensorBlobStore, TENSOR_LINK_ATTR};
use crate::config::IndexConfig;
use crate::error::{IvfError, Result};
use crate::global::{GlobalGraph, MANIFEST_FILE};
use crate::partition::Partitioner;
use crate::query::{QueryCoordinator, QueryStats};
use crate::rebalance::{self, RebalanceStats, Rebalancer};
use crate::store::{StoreStats, VectorStore};
use crate::types::{
    decode_vector, encode_vector, validate_id, ClusterId, Metadata, QueryHit, StorageKind,
    VectorRecord,
};

/// File name of the vector payload log.
pub const VECTOR_FILE: &str = "vectors.dat";

/// Index-wide counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    /// Live vectors.
    pub vectors: usize,
    /// Live clusters.
    pub clusters: usize,
    /// Topology generation of the centroid graph.
    pub generation: u64,
    /// Residency and I/O counters.
    pub cache: CacheStats,
    /// Split, merge and compaction counts.
    pub rebalance: RebalanceStats,
    /// Query and retry counts.
    pub queries: QueryStats,
    /// Vector store counters.
    pub store: StoreStats,
}

/// Shared state of one open index.
pub(crate) struct Core {
    pub(crate) dir: PathBuf,
    pub(crate) config: IndexConfig,
    pub(crate) store: Arc<VectorStore>,
    pub(crate) cache: CacheManager,
    pub(crate) global: RwLock<GlobalGraph>,
    pub(crate) directory: RwLock<HashMap<String, ClusterId>>,
    pub(crate) partitioner: Partitioner,
    pub(crate) rebalancer: Rebalancer,
    pub(crate) coordinator: QueryCoordinator,
    pub(crate) metadata: Option<Arc<dyn MetadataIndex>>,
    pub(crate) blobs: Option<Arc<dyn TensorBlobStore>>,
    seeding: Mutex<()>,
}

/// One item of a write batch.
struct PutItem<'a> {
    id: &'a str,
    vector: &'a [f32],
}

/// Result of writing one batch into one target cluster.
struct BatchOutcome {
    touched: Vec<ClusterId>,
    /// Batch positions that raced another writer, with the cluster the id
    /// was found in instead.
    conflicts: Vec<(usize, ClusterId)>,
}

impl Core {
    fn check_dims(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.config.dimensions as usize {
            return Err(IvfError::DimensionMismatch {
                expected: self.config.dimensions,
                got: vector.len(),
            });
        }
        Ok(())
    }

    /// Runs `op` until it succeeds, fails for good, or runs out of retries.
    fn with_retries<T>(&self, what: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempt = 0;
        loop {
            match op() {
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    debug!(op = what, attempt, error = %e, "retrying");
                }
                other => return other,
            }
        }
    }

    fn new_cluster(&self, id: ClusterId, centroid: Vec<f32>) -> Cluster {
        Cluster::new(id, centroid, self.config.metric, self.config.local.clone())
    }

    /// Creates empty clusters at `centroids` if the index has none.
    ///
    /// Returns the number of clusters created.
    fn seed_clusters(&self, centroids: Vec<Vec<f32>>) -> Result<usize> {
        let _seeding = self.seeding.lock();
        if !self.global.read().is_empty() || centroids.is_empty() {
            return Ok(0);
        }
        let built: Vec<Cluster> = {
            let mut global = self.global.write();
            centroids
                .into_iter()
                .map(|c| self.new_cluster(global.allocate_id(), c))
                .collect()
        };
        let pins: PinnedSet<'_> = self.cache.sync_lock(&[])?;
        let created = rebalance::publish(self, pins, built, &[])?.len();
        info!(clusters = created, "seeded clusters");
        Ok(created)
    }

    /// Nearest cluster for `vector`, seeding one at the vector on an empty index.
    fn route_or_seed(&self, vector: &[f32]) -> Result<ClusterId> {
        loop {
            let routed = self.partitioner.route(&self.global.read(), vector);
            match routed {
                Err(IvfError::NotBootstrapped) => {
                    self.seed_clusters(vec![vector.to_vec()])?;
                }
                other => return other,
            }
        }
    }

    /// Writes `items` into `target` under one pin bracket.
    ///
    /// Items whose directory entry changed since it was read are returned as
    /// conflicts for the caller to re-route.
    fn write_batch(&self, target: ClusterId, items: &[PutItem<'_>]) -> Result<BatchOutcome> {
        let previous: Vec<Option<ClusterId>> = {
            let directory = self.directory.read();
            items.iter().map(|item| directory.get(item.id).copied()).collect()
        };
        let mut ids: Vec<ClusterId> = previous.iter().flatten().copied().collect();
        ids.push(target);
        let pins = self.cache.sync_lock(&ids)?;

        let mut conflicts = Vec::new();
        for (i, (item, prev)) in items.iter().zip(previous.iter().copied()).enumerate() {
            {
                let mut directory = self.directory.write();
                let current = directory.get(item.id).copied();
                if current != prev {
                    conflicts.push((i, current.or(prev).unwrap_or(target)));
                    continue;
                }
                if prev.is_none() {
                    directory.insert(item.id.to_string(), target);
                }
            }

            let applied = self.apply_put(&pins, target, item, prev);
            if let Err(e) = applied {
                if prev.is_none() {
                    self.directory.write().remove(item.id);
                }
                return Err(e);
            }
        }

        pins.unlock()?;
        ids.sort_unstable();
        ids.dedup();
        Ok(BatchOutcome {
            touched: ids,
            conflicts,
        })
    }

    fn apply_put(
        &self,
        pins: &PinnedSet<'_>,
        target: ClusterId,
        item: &PutItem<'_>,
        previous: Option<ClusterId>,
    ) -> Result<()> {
        let payload = encode_vector(item.vector);
        let offset = self.store.append(&payload)?;
        let record = VectorRecord {
            id: item.id.to_string(),
            dims: self.config.dimensions,
            offset,
            len: payload.len() as u32,
        };
        pins.write(target, |c| c.insert(record, item.vector.to_vec()))??;

        if let Some(prev) = previous {
            self.directory.write().insert(item.id.to_string(), target);
            if prev != target {
                pins.write(prev, |c| c.delete(item.id))?;
            }
        }
        Ok(())
    }

    /// Routes and writes `items`, retrying conflicts and contention.
    fn put_items(&self, items: &[PutItem<'_>]) -> Result<Vec<ClusterId>> {
        let mut pending: Vec<usize> = (0..items.len()).collect();
        let mut touched = Vec::new();
        let mut attempt = 0;

        while !pending.is_empty() {
            if let Some(first) = pending.first() {
                self.route_or_seed(items[*first].vector)?;
            }
            let mut groups: HashMap<ClusterId, Vec<usize>> = HashMap::new();
            {
                let global = self.global.read();
                for &i in &pending {
                    let target = self.partitioner.route(&global, items[i].vector)?;
                    groups.entry(target).or_default().push(i);
                }
            }

            let mut retry = Vec::new();
            let mut last_err = None;
            let mut groups: Vec<(ClusterId, Vec<usize>)> = groups.into_iter().collect();
            groups.sort_unstable_by_key(|(id, _)| *id);
            for (target, indices) in groups {
                let batch: Vec<PutItem<'_>> = indices
                    .iter()
                    .map(|&i| PutItem {
                        id: items[i].id,
                        vector: items[i].vector,
                    })
                    .collect();
                match self.write_batch(target, &batch) {
                    Ok(outcome) => {
                        touched.extend(outcome.touched);
                        for (j, cluster) in outcome.conflicts {
                            retry.push(indices[j]);
                            last_err = Some(IvfError::RebalanceConflict(cluster));
                        }
                    }
                    Err(e) if e.is_retryable() => {
                        debug!(cluster = %target, error = %e, "batch deferred");
                        retry.extend(indices);
                        last_err = Some(e);
                    }
                    Err(e) => return Err(e),
                }
            }

            if let Some(err) = last_err.filter(|_| !retry.is_empty()) {
                attempt += 1;
                if attempt > self.config.max_retries {
                    return Err(err);
                }
            }
            pending = retry;
        }

        touched.sort_unstable();
        touched.dedup();
        Ok(touched)
    }

    fn attach_metadata(&self, id: &str, metadata: Option<Metadata>) -> Result<()> {
        match (metadata, &self.metadata) {
            (Some(attrs), Some(index)) => index.set_attributes(id, attrs),
            (Some(_), None) => {
                debug!(id, "no metadata index attached; attributes dropped");
                Ok(())
            }
            (None, _) => Ok(()),
        }
    }

    fn get(&self, id: &str) -> Result<Vec<f32>> {
        let record = self.with_retries("get", || {
            let cluster = self
                .directory
                .read()
                .get(id)
                .copied()
                .ok_or_else(|| IvfError::NotFound(id.to_string()))?;
            let found = self.cache.read(cluster, |c| match c.record(id) {
                Some(record) => Some(Ok(record.clone())),
                None => c.quarantined_record(id).map(|record| {
                    Err(IvfError::corruption(
                        record.offset,
                        format!("payload of {id} failed its checksum when {cluster} was loaded"),
                    ))
                }),
            })?;
            match found {
                Some(found) => found,
                // A concurrent replace repoints the directory before it
                // tombstones the old copy.
                None => match self.directory.read().get(id).copied() {
                    Some(now) if now != cluster => Err(IvfError::RebalanceConflict(now)),
                    _ => Err(IvfError::NotFound(id.to_string())),
                },
            }
        })?;
        let bytes = self.store.read(record.offset, record.len)?;
        Ok(decode_vector(&bytes))
    }

    fn delete(&self, id: &str) -> Result<ClusterId> {
        self.with_retries("delete", || {
            let cluster = self
                .directory
                .read()
                .get(id)
                .copied()
                .ok_or_else(|| IvfError::NotFound(id.to_string()))?;
            let pins = self.cache.sync_lock(&[cluster])?;
            if self.directory.read().get(id).copied() != Some(cluster) {
                return Err(IvfError::RebalanceConflict(cluster));
            }
            pins.write(cluster, |c| c.delete(id))?;
            self.directory.write().remove(id);
            pins.unlock()?;
            Ok(cluster)
        })
    }
}

/// A persistent, cluster-partitioned approximate nearest neighbor index.
///
/// All operations take `&self`; share the index across threads with `Arc`.
pub struct ClusterIndex {
    core: Core,
}

impl ClusterIndex {
    /// Opens the index in `dir`, creating it if the directory holds none.
    ///
    /// For an existing index the dimensions and metric must match `config`.
    /// Graph and rebalance parameters come from the manifest; cache, retry and
    /// query settings come from `config`.
    ///
    /// Cluster files not listed in the manifest are leftovers of an interrupted
    /// rebalance and are deleted.
    ///
    /// # Errors
    ///
    /// * `IvfError::InvalidConfig` - If `config` fails validation or the metric differs
    /// * `IvfError::DimensionMismatch` - If the stored index has other dimensions
    /// * `IvfError::CorruptedIndex` - If the manifest or a cluster file is damaged
    #[instrument(skip(dir, config), fields(dir = %dir.as_ref().display()))]
    pub fn open(dir: impl AsRef<Path>, config: IndexConfig) -> Result<Self> {
        config.validate()?;
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let (config, global) = if dir.join(MANIFEST_FILE).exists() {
            let (persisted, global) =
                GlobalGraph::load_validated(&dir, config.dimensions, config.metric)?;
            (with_runtime_settings(persisted, &config), global)
        } else {
            let global = GlobalGraph::new(&config);
            global.save(&dir, &config)?;
            (config, global)
        };

        let store = Arc::new(VectorStore::open(dir.join(VECTOR_FILE))?);
        let cache = CacheManager::new(
            &dir,
            Arc::clone(&store),
            config.dimensions,
            config.cache.clone(),
            config.sync_on_write,
        );

        let live: HashSet<ClusterId> = global.ids().into_iter().collect();
        remove_orphans(&dir, &live)?;

        let mut directory: HashMap<String, ClusterId> = HashMap::new();
        let mut duplicates = Vec::new();
        for id in global.ids() {
            let file = Cluster::read_file(&dir, id)?;
            let live = file.members.into_iter().filter(|m| !m.deleted);
            let quarantined = file.quarantined.into_iter().map(|r| r.id);
            for member_id in live.map(|m| m.record.id).chain(quarantined) {
                if let Some(other) = directory.insert(member_id.clone(), id) {
                    duplicates.push((member_id, other, id));
                }
            }
            cache.register_existing(id);
        }

        let partitioner = Partitioner::new(config.metric, config.rebalance.clone(), config.local.seed);
        let coordinator = QueryCoordinator::new(config.max_retries, config.filter_overfetch);
        let core = Core {
            dir,
            store,
            cache,
            global: RwLock::new(global),
            directory: RwLock::new(directory),
            partitioner,
            rebalancer: Rebalancer::new(),
            coordinator,
            metadata: None,
            blobs: None,
            seeding: Mutex::new(()),
            config,
        };

        resolve_duplicates(&core, duplicates)?;

        info!(
            vectors = core.directory.read().len(),
            clusters = core.global.read().len(),
            "opened cluster index"
        );
        Ok(Self { core })
    }

    /// Attaches a metadata index used for filters, query hit attributes and
    /// tensor links.
    pub fn with_metadata(mut self, metadata: Arc<dyn MetadataIndex>) -> Self {
        self.core.metadata = Some(metadata);
        self
    }

    /// Attaches a blob store for tensors that are not indexed.
    pub fn with_blob_store(mut self, blobs: Arc<dyn TensorBlobStore>) -> Self {
        self.core.blobs = Some(blobs);
        self
    }

    /// Effective configuration.
    pub fn config(&self) -> &IndexConfig {
        &self.core.config
    }

    /// Index directory.
    pub fn path(&self) -> &Path {
        &self.core.dir
    }

    /// Number of live vectors.
    pub fn len(&self) -> usize {
        self.core.directory.read().len()
    }

    /// Returns true if the index holds no vectors.
    pub fn is_empty(&self) -> bool {
        self.core.directory.read().is_empty()
    }

    /// Returns true if `id` is a live vector.
    pub fn contains(&self, id: &str) -> bool {
        self.core.directory.read().contains_key(id)
    }

    /// Live cluster ids, ascending.
    pub fn clusters(&self) -> Vec<ClusterId> {
        self.core.global.read().ids()
    }

    /// Cluster currently holding `id`.
    pub fn cluster_of(&self, id: &str) -> Option<ClusterId> {
        self.core.directory.read().get(id).copied()
    }

    /// Live member ids of a cluster, in insertion order.
    ///
    /// # Errors
    ///
    /// * `IvfError::RebalanceConflict` - If the cluster was retired
    pub fn members(&self, cluster: ClusterId) -> Result<Vec<String>> {
        self.core
            .cache
            .read(cluster, |c| c.records().map(|r| r.id.clone()).collect())
    }

    /// The cache owning cluster residency.
    pub fn cache(&self) -> &CacheManager {
        &self.core.cache
    }

    /// Seeds the first generation of clusters by k-means over `sample`.
    ///
    /// Returns the number of clusters created.
    ///
    /// # Errors
    ///
    /// * `IvfError::InvalidConfig` - If the index already has clusters
    /// * `IvfError::DimensionMismatch` - If a sample vector has the wrong length
    pub fn bootstrap(&self, sample: &[Vec<f32>]) -> Result<usize> {
        if !self.core.global.read().is_empty() {
            return Err(IvfError::InvalidConfig(
                "index is already bootstrapped".to_string(),
            ));
        }
        self.bootstrap_from(sample.iter().map(Vec::as_slice).collect())
    }

    fn bootstrap_from(&self, sample: Vec<&[f32]>) -> Result<usize> {
        for v in &sample {
            self.core.check_dims(v)?;
        }
        let centroids = self.core.partitioner.bootstrap_centroids(&sample);
        self.core.seed_clusters(centroids)
    }

    /// Inserts or replaces one vector.
    ///
    /// A replaced vector moves to the cluster nearest its new value. On an
    /// empty index the first vector seeds a cluster of its own.
    ///
    /// # Errors
    ///
    /// * `IvfError::EmptyKey` / `IvfError::KeyTooLong` - If `id` is invalid
    /// * `IvfError::DimensionMismatch` - If `vector` has the wrong length
    /// * `IvfError::LockTimeout` - If the target cluster stayed pinned past all retries
    pub fn put(&self, id: &str, vector: &[f32], metadata: Option<Metadata>) -> Result<String> {
        validate_id(id)?;
        self.core.check_dims(vector)?;
        let touched = self.core.put_items(&[PutItem { id, vector }])?;
        self.core.attach_metadata(id, metadata)?;
        self.core.rebalancer.maintain(&self.core, &touched)?;
        Ok(id.to_string())
    }

    /// Inserts or replaces a batch of vectors.
    ///
    /// Items are grouped by target cluster and each group is written under a
    /// single pin bracket. An empty index is bootstrapped from the batch first.
    pub fn put_all(&self, items: Vec<(String, Vec<f32>, Option<Metadata>)>) -> Result<Vec<String>> {
        for (id, vector, _) in &items {
            validate_id(id)?;
            self.core.check_dims(vector)?;
        }
        if items.is_empty() {
            return Ok(Vec::new());
        }
        if self.core.global.read().is_empty() {
            let created = self.bootstrap_from(items.iter().map(|(_, v, _)| v.as_slice()).collect())?;
            debug!(clusters = created, batch = items.len(), "bootstrapped from batch");
        }

        // Last write wins for ids repeated within the batch
        let mut last: HashMap<&str, usize> = HashMap::new();
        for (i, (id, _, _)) in items.iter().enumerate() {
            last.insert(id.as_str(), i);
        }
        let mut order: Vec<usize> = last.into_values().collect();
        order.sort_unstable();
        let batch: Vec<PutItem<'_>> = order
            .iter()
            .map(|&i| PutItem {
                id: items[i].0.as_str(),
                vector: items[i].1.as_slice(),
            })
            .collect();

        let touched = self.core.put_items(&batch)?;

        let mut ids = Vec::with_capacity(items.len());
        for (id, _, metadata) in items {
            self.core.attach_metadata(&id, metadata)?;
            ids.push(id);
        }
        self.core.rebalancer.maintain(&self.core, &touched)?;
        Ok(ids)
    }

    /// Stores a value by shape: a 1-D vector of the index dimensions is
    /// indexed; anything else goes to the blob store and is linked from the
    /// metadata index through the `tensor_id` attribute.
    ///
    /// # Errors
    ///
    /// * `IvfError::InvalidConfig` - If `data` does not fill `shape`, or an
    ///   opaque tensor arrives without a blob store and metadata index attached
    pub fn put_tensor(
        &self,
        id: &str,
        shape: &[usize],
        data: &[f32],
        metadata: Option<Metadata>,
    ) -> Result<StorageKind> {
        validate_id(id)?;
        let kind = StorageKind::classify(shape, self.core.config.dimensions);
        match kind {
            StorageKind::Indexed1D => {
                self.put(id, data, metadata)?;
            }
            StorageKind::OpaqueTensor => {
                let tensor = Tensor::new(shape.to_vec(), data.to_vec())?;
                let (Some(blobs), Some(index)) = (&self.core.blobs, &self.core.metadata) else {
                    return Err(IvfError::InvalidConfig(
                        "opaque tensors need a blob store and a metadata index".to_string(),
                    ));
                };
                let blob_id = blobs.put(id, tensor.to_bytes()?)?;
                let mut attrs = metadata.unwrap_or_default();
                attrs.insert(TENSOR_LINK_ATTR.to_string(), blob_id);
                index.set_attributes(id, attrs)?;
            }
        }
        debug!(id, ?kind, "stored tensor");
        Ok(kind)
    }

    /// Exact payload of a vector.
    ///
    /// # Errors
    ///
    /// * `IvfError::NotFound` - If `id` is not a live vector
    /// * `IvfError::StorageCorruption` - If the payload fails its checksum
    pub fn get(&self, id: &str) -> Result<Vec<f32>> {
        self.core.get(id)
    }

    /// Full tensor for `id`: the linked blob if the metadata names one,
    /// otherwise the indexed vector as a 1-D tensor.
    pub fn fetch_tensor(&self, id: &str) -> Result<Tensor> {
        if let Some(index) = &self.core.metadata {
            if let Some(link) = index.linked_tensor(id)? {
                let blobs = self.core.blobs.as_ref().ok_or_else(|| {
                    IvfError::InvalidConfig("no blob store attached".to_string())
                })?;
                return Tensor::from_bytes(&blobs.get(&link)?);
            }
        }
        let data = self.core.get(id)?;
        Ok(Tensor {
            shape: vec![data.len()],
            data,
        })
    }

    /// Removes a vector. Its cluster may be merged afterwards.
    ///
    /// # Errors
    ///
    /// * `IvfError::NotFound` - If `id` is not a live vector
    pub fn delete(&self, id: &str) -> Result<()> {
        let cluster = self.core.delete(id)?;
        if let Some(index) = &self.core.metadata {
            index.remove(id)?;
        }
        self.core.rebalancer.maintain(&self.core, &[cluster])
    }

    /// Top-`k` vectors nearest to `vector` among the `nprobe` nearest clusters.
    ///
    /// Hits are sorted by non-decreasing distance, ties broken by id. With a
    /// filter, candidates are checked against the metadata index after the
    /// graph search, so fewer than `k` hits may come back.
    pub fn query(
        &self,
        vector: &[f32],
        k: usize,
        nprobe: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<QueryHit>> {
        self.core
            .coordinator
            .query(&self.core, vector, k, nprobe, filter)
    }

    /// [`query`](Self::query) with the configured default nProbe and no filter.
    pub fn search(&self, vector: &[f32], k: usize) -> Result<Vec<QueryHit>> {
        self.query(vector, k, self.core.config.default_nprobe, None)
    }

    /// Writes every dirty cluster, the vector store and the manifest to disk.
    pub fn flush(&self) -> Result<()> {
        self.core.cache.flush_all()?;
        self.core.store.flush()?;
        self.core
            .global
            .read()
            .save(&self.core.dir, &self.core.config)
    }

    /// Counters across all components.
    pub fn stats(&self) -> IndexStats {
        let (clusters, generation) = {
            let global = self.core.global.read();
            (global.len(), global.generation())
        };
        IndexStats {
            vectors: self.len(),
            clusters,
            generation,
            cache: self.core.cache.stats(),
            rebalance: self.core.rebalancer.stats(),
            queries: self.core.coordinator.stats(),
            store: self.core.store.stats(),
        }
    }

    /// Verifies that the centroid graph, the cache and the directory agree and
    /// that every live vector belongs to exactly one cluster.
    ///
    /// Quarantined ids count as owned by the cluster that quarantined them.
    ///
    /// Faults every cluster in; meant for tests and offline checks.
    pub fn check_invariants(&self) -> Result<()> {
        let clusters = self.clusters();
        let cached = self.core.cache.cluster_ids();
        if clusters != cached {
            return Err(IvfError::CorruptedIndex(format!(
                "centroid graph lists {clusters:?} but the cache holds {cached:?}"
            )));
        }

        let mut owner: HashMap<String, ClusterId> = HashMap::new();
        for &id in &clusters {
            let members = self.core.cache.read(id, |c| {
                c.records()
                    .map(|r| &r.id)
                    .chain(c.quarantined())
                    .cloned()
                    .collect::<Vec<_>>()
            })?;
            for member in members {
                if let Some(other) = owner.insert(member.clone(), id) {
                    return Err(IvfError::CorruptedIndex(format!(
                        "vector {member} is live in both {other} and {id}"
                    )));
                }
            }
        }

        let directory = self.core.directory.read();
        if directory.len() != owner.len() {
            return Err(IvfError::CorruptedIndex(format!(
                "directory holds {} ids but clusters hold {}",
                directory.len(),
                owner.len()
            )));
        }
        for (id, cluster) in directory.iter() {
            if owner.get(id) != Some(cluster) {
                return Err(IvfError::CorruptedIndex(format!(
                    "directory maps {id} to {cluster} but it lives in {:?}",
                    owner.get(id)
                )));
            }
        }
        Ok(())
    }
}

impl Drop for ClusterIndex {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(error = %e, "flush on close failed");
        }
    }
}

fn with_runtime_settings(persisted: IndexConfig, caller: &IndexConfig) -> IndexConfig {
    IndexConfig {
        cache: caller.cache.clone(),
        default_nprobe: caller.default_nprobe,
        max_retries: caller.max_retries,
        filter_overfetch: caller.filter_overfetch,
        sync_on_write: caller.sync_on_write,
        ..persisted
    }
}

/// Deletes cluster files and temp files the manifest does not reference.
fn remove_orphans(dir: &Path, live: &HashSet<ClusterId>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let orphan = match parse_cluster_file_name(name) {
            Some(id) => !live.contains(&id),
            None => name.starts_with("cluster-") && name.ends_with(".tmp"),
        };
        if orphan {
            warn!(file = name, "removing orphan cluster file");
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

/// Tombstones stale copies of ids found live in two clusters.
///
/// This happens when a move was interrupted between writing the target and
/// the source cluster. The copy with the newer payload wins.
fn resolve_duplicates(core: &Core, duplicates: Vec<(String, ClusterId, ClusterId)>) -> Result<()> {
    for (id, first, second) in duplicates {
        let pins = core.cache.sync_lock(&[first, second])?;
        let offset_in = |cluster| pins.read(cluster, |c| c.record(&id).map(|r| r.offset));
        let (keep, drop_from) = match (offset_in(first)?, offset_in(second)?) {
            (Some(a), Some(b)) if a > b => (first, second),
            (Some(_), None) => (first, second),
            _ => (second, first),
        };
        pins.write(drop_from, |c| c.delete(&id))?;
        core.directory.write().insert(id.clone(), keep);
        pins.unlock()?;
        warn!(id = %id, kept = %keep, dropped = %drop_from, "resolved vector live in two clusters");
    }
    Ok(())
}
