// Copyright (c) 2025 SynaDB Contributors
// Licensed under the SynaDB License. See LICENSE file for details.

//! LRU resident set of clusters with pinning and write-back.
//!
//! # Concurrency Design
//!
//! The bookkeeping map (residency, recency, pins, byte accounting) sits behind
//! one `Mutex`. Each cluster lives in its own `RwLock` slot, so different
//! clusters are loaded and mutated concurrently and readers of a resident
//! cluster share its lock.
//!
//! The bookkeeping mutex is never held across disk I/O or while waiting on a
//! slot. Eviction picks its victims under the mutex and marks them
//! `evicting`, then writes each one back holding only that victim's slot
//! (taken with `try_write`). It re-takes the mutex briefly to clear residency
//! before releasing the slot. A fault-in of a cluster that is being evicted
//! waits on the slot and reloads from the file just written.
//!
//! A pin is exclusive: it marks the single writer of a cluster and keeps the
//! cluster out of the eviction candidates. Pins are taken in ascending id
//! order, so two multi-cluster operations cannot wait on each other in a cycle.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, instrument, warn};

use crate::cluster::{cluster_path, Cluster};
use crate::config::CacheConfig;
use crate::error::{IvfError, Result};
use crate::store::VectorStore;
use crate::types::ClusterId;

/// Attempts made by [`CacheManager::read`] when a cluster is evicted between
/// fault-in and lock acquisition.
const MAX_FAULT_ATTEMPTS: usize = 4;

type Slot = Arc<RwLock<Option<Cluster>>>;

struct CacheEntry {
    last_access: u64,
    pinned: bool,
    resident: bool,
    /// Chosen for eviction; treated as not resident until the evictor is done.
    evicting: bool,
    bytes: usize,
    slot: Slot,
}

struct CacheState {
    entries: HashMap<ClusterId, CacheEntry>,
    clock: u64,
    resident_bytes: usize,
}

impl CacheState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Clusters known to the cache, resident or not.
    pub clusters: usize,
    /// Clusters currently in memory.
    pub resident_clusters: usize,
    /// Estimated bytes held by resident clusters.
    pub resident_bytes: usize,
    /// Clusters currently pinned.
    pub pinned: usize,
    /// Cluster files read from disk.
    pub loads: u64,
    /// Cluster files written to disk.
    pub writebacks: u64,
    /// Clusters dropped from memory.
    pub evictions: u64,
    /// `sync` calls that found the cluster resident.
    pub hits: u64,
}

/// Owner of cluster residency.
pub struct CacheManager {
    dir: PathBuf,
    store: Arc<VectorStore>,
    dimensions: u16,
    config: CacheConfig,
    sync_files: bool,
    state: Mutex<CacheState>,
    pin_released: Condvar,
    loads: AtomicU64,
    writebacks: AtomicU64,
    evictions: AtomicU64,
    hits: AtomicU64,
}

impl CacheManager {
    /// Creates a cache over the cluster files in `dir`.
    pub fn new(
        dir: impl Into<PathBuf>,
        store: Arc<VectorStore>,
        dimensions: u16,
        config: CacheConfig,
        sync_files: bool,
    ) -> Self {
        Self {
            dir: dir.into(),
            store,
            dimensions,
            config,
            sync_files,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                clock: 0,
                resident_bytes: 0,
            }),
            pin_released: Condvar::new(),
            loads: AtomicU64::new(0),
            writebacks: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            hits: AtomicU64::new(0),
        }
    }

    /// The shared vector store.
    pub fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    /// Makes an on-disk cluster known to the cache without loading it.
    pub fn register_existing(&self, id: ClusterId) {
        let mut state = self.state.lock();
        state.entries.entry(id).or_insert_with(|| CacheEntry {
            last_access: 0,
            pinned: false,
            resident: false,
            evicting: false,
            bytes: 0,
            slot: Arc::new(RwLock::new(None)),
        });
    }

    /// Returns true if `id` names a live cluster.
    pub fn contains(&self, id: ClusterId) -> bool {
        self.state.lock().entries.contains_key(&id)
    }

    /// Ids of all live clusters, ascending.
    pub fn cluster_ids(&self) -> Vec<ClusterId> {
        let mut ids: Vec<ClusterId> = self.state.lock().entries.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Returns true if `id` is in memory.
    pub fn is_resident(&self, id: ClusterId) -> bool {
        self.state
            .lock()
            .entries
            .get(&id)
            .map(|e| e.resident)
            .unwrap_or(false)
    }

    /// Returns true if `id` is pinned.
    pub fn is_pinned(&self, id: ClusterId) -> bool {
        self.state
            .lock()
            .entries
            .get(&id)
            .map(|e| e.pinned)
            .unwrap_or(false)
    }

    /// Ensures `id` is resident and consistent with disk.
    ///
    /// Loads the cluster if it was evicted. A resident dirty cluster that no
    /// writer holds is written back first. Otherwise this is a no-op.
    ///
    /// # Errors
    ///
    /// * `IvfError::RebalanceConflict` - If `id` is not a live cluster
    pub fn sync(&self, id: ClusterId) -> Result<()> {
        self.fault_in(id).map(|_| ())
    }

    fn fault_in(&self, id: ClusterId) -> Result<Slot> {
        let (slot, resident, pinned) = {
            let mut state = self.state.lock();
            let now = state.tick();
            let entry = state
                .entries
                .get_mut(&id)
                .ok_or(IvfError::RebalanceConflict(id))?;
            entry.last_access = now;
            (entry.slot.clone(), entry.resident && !entry.evicting, entry.pinned)
        };

        if resident {
            self.hits.fetch_add(1, Ordering::Relaxed);
            let dirty = slot.read().as_ref().map(Cluster::is_dirty).unwrap_or(false);
            if dirty && !pinned {
                let mut guard = slot.write();
                if let Some(cluster) = guard.as_mut() {
                    self.write_back(cluster)?;
                }
            }
            return Ok(slot);
        }

        let loaded = {
            let mut guard = slot.write();
            match guard.as_ref() {
                Some(_) => None,
                None => {
                    let cluster = Cluster::load(&self.dir, id, &self.store, self.dimensions)?;
                    self.loads.fetch_add(1, Ordering::Relaxed);
                    let bytes = cluster.byte_size();
                    debug!(cluster = %id, bytes, "faulted in cluster");
                    *guard = Some(cluster);
                    Some(bytes)
                }
            }
        };

        if let Some(bytes) = loaded {
            let live = {
                let mut state = self.state.lock();
                match state.entries.get_mut(&id) {
                    Some(entry) => {
                        entry.resident = true;
                        entry.bytes = bytes;
                        state.resident_bytes += bytes;
                        true
                    }
                    None => false,
                }
            };
            if !live {
                *slot.write() = None;
                return Err(IvfError::RebalanceConflict(id));
            }
            self.evict_over_budget(Some(id));
        }
        Ok(slot)
    }

    /// Runs `f` against a resident snapshot of cluster `id`.
    ///
    /// No pin is needed; the slot's read lock keeps the cluster from being
    /// evicted or mutated while `f` runs.
    pub fn read<R>(&self, id: ClusterId, f: impl FnOnce(&Cluster) -> R) -> Result<R> {
        for _ in 0..MAX_FAULT_ATTEMPTS {
            let slot = self.fault_in(id)?;
            let guard = slot.read();
            if let Some(cluster) = guard.as_ref() {
                return Ok(f(cluster));
            }
            debug!(cluster = %id, "cluster evicted before read; faulting in again");
        }
        Err(IvfError::RebalanceConflict(id))
    }

    /// Pins `ids` for exclusive mutation, loading any that are not resident.
    ///
    /// Waits at most the configured lock timeout for contended pins.
    pub fn sync_lock(&self, ids: &[ClusterId]) -> Result<PinnedSet<'_>> {
        self.sync_lock_until(ids, Instant::now() + self.config.lock_timeout)
    }

    /// [`sync_lock`](Self::sync_lock) with an explicit deadline.
    ///
    /// # Errors
    ///
    /// * `IvfError::LockTimeout` - If a pin is still held by another writer at the deadline
    /// * `IvfError::RebalanceConflict` - If an id was retired
    /// * `IvfError::CapacityExceeded` - If the pinned clusters do not fit the budget
    #[instrument(level = "trace", skip(self))]
    pub fn sync_lock_until(&self, ids: &[ClusterId], deadline: Instant) -> Result<PinnedSet<'_>> {
        let mut sorted = ids.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let started = Instant::now();
        let mut pins = PinnedSet {
            cache: self,
            ids: Vec::with_capacity(sorted.len()),
            released: false,
        };

        for id in sorted {
            {
                let mut state = self.state.lock();
                loop {
                    let entry = state
                        .entries
                        .get_mut(&id)
                        .ok_or(IvfError::RebalanceConflict(id))?;
                    if !entry.pinned {
                        entry.pinned = true;
                        break;
                    }
                    if self
                        .pin_released
                        .wait_until(&mut state, deadline)
                        .timed_out()
                    {
                        let still_pinned = state.entries.get(&id).map(|e| e.pinned);
                        if still_pinned == Some(true) {
                            return Err(IvfError::LockTimeout {
                                cluster: id,
                                waited_ms: started.elapsed().as_millis() as u64,
                            });
                        }
                    }
                }
            }
            pins.ids.push(id);
            self.fault_in(id)?;
        }

        let required: usize = {
            let state = self.state.lock();
            state
                .entries
                .values()
                .filter(|e| e.pinned)
                .map(|e| e.bytes)
                .sum()
        };
        if required > self.config.memory_budget_bytes {
            return Err(IvfError::CapacityExceeded {
                required,
                budget: self.config.memory_budget_bytes,
            });
        }
        Ok(pins)
    }

    /// Flushes dirty clusters among `ids` and removes their pins.
    ///
    /// Pins are released even if a write-back fails; the first error is returned.
    pub fn sync_unlock(&self, ids: &[ClusterId]) -> Result<()> {
        let mut first_err = None;
        if self.sync_files {
            if let Err(e) = self.store.flush() {
                first_err = Some(e);
            }
        }
        for &id in ids {
            let slot = self.state.lock().entries.get(&id).map(|e| e.slot.clone());
            let Some(slot) = slot else { continue };
            let mut guard = slot.write();
            if let Some(cluster) = guard.as_mut() {
                if cluster.is_dirty() {
                    if let Err(e) = self.write_back(cluster) {
                        warn!(cluster = %id, error = %e, "write-back failed on unlock");
                        first_err.get_or_insert(e);
                    }
                }
            }
        }
        self.release(ids);
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn release(&self, ids: &[ClusterId]) {
        {
            let mut state = self.state.lock();
            for id in ids {
                if let Some(entry) = state.entries.get_mut(id) {
                    entry.pinned = false;
                }
            }
        }
        self.pin_released.notify_all();
        self.evict_over_budget(None);
    }

    /// Writes back every dirty cluster that no writer holds.
    pub fn flush_all(&self) -> Result<()> {
        if self.sync_files {
            self.store.flush()?;
        }
        let slots: Vec<Slot> = {
            let state = self.state.lock();
            state
                .entries
                .values()
                .filter(|e| e.resident && !e.pinned)
                .map(|e| e.slot.clone())
                .collect()
        };
        for slot in slots {
            let mut guard = slot.write();
            if let Some(cluster) = guard.as_mut() {
                if cluster.is_dirty() {
                    self.write_back(cluster)?;
                }
            }
        }
        Ok(())
    }

    fn write_back(&self, cluster: &mut Cluster) -> Result<()> {
        cluster.save(&self.dir, self.sync_files)?;
        self.writebacks.fetch_add(1, Ordering::Relaxed);
        debug!(cluster = %cluster.id(), "wrote back cluster");
        Ok(())
    }

    /// Evicts least-recently-used unpinned clusters until under budget.
    ///
    /// `protect` is the cluster just faulted in by the caller. Victims are
    /// chosen under the state lock and marked `evicting`; their write-back
    /// runs with only the victim's slot held.
    fn evict_over_budget(&self, protect: Option<ClusterId>) {
        let victims: Vec<(ClusterId, Slot)> = {
            let mut state = self.state.lock();
            let in_flight: usize = state
                .entries
                .values()
                .filter(|e| e.evicting)
                .map(|e| e.bytes)
                .sum();
            let mut projected = state.resident_bytes.saturating_sub(in_flight);
            if projected <= self.config.memory_budget_bytes {
                return;
            }
            let mut candidates: Vec<(u64, ClusterId)> = state
                .entries
                .iter()
                .filter(|(id, e)| e.resident && !e.pinned && !e.evicting && Some(**id) != protect)
                .map(|(id, e)| (e.last_access, *id))
                .collect();
            candidates.sort_unstable();

            let mut victims = Vec::new();
            for (_, id) in candidates {
                if projected <= self.config.memory_budget_bytes {
                    break;
                }
                if let Some(entry) = state.entries.get_mut(&id) {
                    entry.evicting = true;
                    projected = projected.saturating_sub(entry.bytes);
                    victims.push((id, entry.slot.clone()));
                }
            }
            victims
        };

        for (id, slot) in victims {
            self.evict(id, &slot);
        }
    }

    fn evict(&self, id: ClusterId, slot: &Slot) {
        let abandon = || {
            if let Some(entry) = self.state.lock().entries.get_mut(&id) {
                entry.evicting = false;
            }
        };
        let Some(mut guard) = slot.try_write() else {
            abandon();
            return;
        };
        if self.state.lock().entries.get(&id).map_or(true, |e| e.pinned) {
            abandon();
            return;
        }
        if let Some(cluster) = guard.as_mut() {
            if cluster.is_dirty() {
                if let Err(e) = self.write_back(cluster) {
                    warn!(cluster = %id, error = %e, "write-back failed; keeping cluster resident");
                    abandon();
                    return;
                }
            }
        }
        *guard = None;

        // Residency is cleared before the slot is released, so a concurrent
        // fault-in waiting on the slot reloads from the file just written.
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get_mut(&id) else {
            return;
        };
        entry.evicting = false;
        entry.resident = false;
        let bytes = std::mem::take(&mut entry.bytes);
        state.resident_bytes = state.resident_bytes.saturating_sub(bytes);
        drop(state);
        drop(guard);
        self.evictions.fetch_add(1, Ordering::Relaxed);
        debug!(cluster = %id, bytes, "evicted cluster");
    }

    /// Counters and residency snapshot.
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            clusters: state.entries.len(),
            resident_clusters: state.entries.values().filter(|e| e.resident).count(),
            resident_bytes: state.resident_bytes,
            pinned: state.entries.values().filter(|e| e.pinned).count(),
            loads: self.loads.load(Ordering::Relaxed),
            writebacks: self.writebacks.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
        }
    }

    /// Configured lock timeout.
    pub fn lock_timeout(&self) -> Duration {
        self.config.lock_timeout
    }
}

/// Exclusive pins on a set of clusters.
///
/// Call [`unlock`](PinnedSet::unlock) to flush and release. Dropping the set
/// releases the pins without flushing; dirty clusters are then written back by
/// the next `sync` or eviction.
pub struct PinnedSet<'a> {
    cache: &'a CacheManager,
    ids: Vec<ClusterId>,
    released: bool,
}

impl<'a> PinnedSet<'a> {
    /// Pinned cluster ids, ascending.
    pub fn ids(&self) -> &[ClusterId] {
        &self.ids
    }

    /// Returns true if `id` is held by this set.
    pub fn holds(&self, id: ClusterId) -> bool {
        self.ids.contains(&id)
    }

    fn slot(&self, id: ClusterId) -> Result<Slot> {
        if !self.holds(id) {
            return Err(IvfError::RebalanceConflict(id));
        }
        self.cache
            .state
            .lock()
            .entries
            .get(&id)
            .map(|e| e.slot.clone())
            .ok_or(IvfError::RebalanceConflict(id))
    }

    /// Reads a pinned cluster.
    pub fn read<R>(&self, id: ClusterId, f: impl FnOnce(&Cluster) -> R) -> Result<R> {
        let slot = self.slot(id)?;
        let guard = slot.read();
        let cluster = guard.as_ref().ok_or(IvfError::RebalanceConflict(id))?;
        Ok(f(cluster))
    }

    /// Mutates a pinned cluster and refreshes its byte estimate.
    pub fn write<R>(&self, id: ClusterId, f: impl FnOnce(&mut Cluster) -> R) -> Result<R> {
        let slot = self.slot(id)?;
        let (result, bytes) = {
            let mut guard = slot.write();
            let cluster = guard.as_mut().ok_or(IvfError::RebalanceConflict(id))?;
            let result = f(cluster);
            (result, cluster.byte_size())
        };
        let mut state = self.cache.state.lock();
        if let Some(entry) = state.entries.get_mut(&id) {
            let old = std::mem::replace(&mut entry.bytes, bytes);
            state.resident_bytes = state.resident_bytes.saturating_sub(old) + bytes;
        }
        Ok(result)
    }

    /// Hands a newly built cluster to the cache, pinned by this set.
    pub fn adopt(&mut self, cluster: Cluster) {
        let id = cluster.id();
        let bytes = cluster.byte_size();
        let mut state = self.cache.state.lock();
        let now = state.tick();
        state.entries.insert(
            id,
            CacheEntry {
                last_access: now,
                pinned: true,
                resident: true,
                evicting: false,
                bytes,
                slot: Arc::new(RwLock::new(Some(cluster))),
            },
        );
        state.resident_bytes += bytes;
        self.ids.push(id);
        self.ids.sort_unstable();
    }

    /// Retires a pinned cluster: drops it from the cache and deletes its file.
    ///
    /// Waiters on its pin wake up and observe `RebalanceConflict`.
    pub fn retire(&mut self, id: ClusterId) -> Result<()> {
        if !self.holds(id) {
            return Err(IvfError::RebalanceConflict(id));
        }
        let removed = {
            let mut state = self.cache.state.lock();
            let removed = state.entries.remove(&id);
            if let Some(entry) = &removed {
                if entry.resident {
                    state.resident_bytes = state.resident_bytes.saturating_sub(entry.bytes);
                }
            }
            removed
        };
        self.ids.retain(|i| *i != id);
        if let Some(entry) = removed {
            *entry.slot.write() = None;
        }
        self.cache.pin_released.notify_all();

        let path = cluster_path(&self.cache.dir, id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes back every dirty cluster held by this set, keeping the pins.
    pub fn flush(&self) -> Result<()> {
        if self.cache.sync_files {
            self.cache.store.flush()?;
        }
        for &id in &self.ids {
            let slot = self.slot(id)?;
            let mut guard = slot.write();
            if let Some(cluster) = guard.as_mut() {
                if cluster.is_dirty() {
                    self.cache.write_back(cluster)?;
                }
            }
        }
        Ok(())
    }

    /// Flushes dirty clusters and releases all pins.
    pub fn unlock(mut self) -> Result<()> {
        self.released = true;
        self.cache.sync_unlock(&self.ids)
    }
}

impl Drop for PinnedSet<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.cache.release(&self.ids);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GraphConfig;
    use crate::distance::DistanceMetric;
    use crate::types::{encode_vector, VectorRecord};
    use std::path::Path;
    use tempfile::{tempdir, TempDir};

    fn open_cache(dir: &Path, budget: usize) -> CacheManager {
        let store = Arc::new(VectorStore::open(dir.join("vectors.dat")).unwrap());
        let config = CacheConfig {
            memory_budget_bytes: budget,
            lock_timeout: Duration::from_millis(50),
        };
        CacheManager::new(dir, store, 2, config, false)
    }

    fn setup(budget: usize) -> (TempDir, CacheManager) {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path(), budget);
        (dir, cache)
    }

    fn make_cluster(cache: &CacheManager, id: u64, n: usize) -> Cluster {
        let mut cluster = Cluster::new(
            ClusterId(id),
            vec![id as f32, 0.0],
            DistanceMetric::Euclidean,
            GraphConfig::with_m(4),
        );
        for i in 0..n {
            let v = vec![id as f32, i as f32];
            let bytes = encode_vector(&v);
            let offset = cache.store().append(&bytes).unwrap();
            let record = VectorRecord {
                id: format!("c{id}-{i}"),
                dims: 2,
                offset,
                len: bytes.len() as u32,
            };
            cluster.insert(record, v).unwrap();
        }
        cluster
    }

    /// Persists clusters and registers them as non-resident.
    fn seed(cache: &CacheManager, dir: &Path, ids: &[u64]) {
        for &id in ids {
            let mut cluster = make_cluster(cache, id, 10);
            cluster.save(dir, false).unwrap();
            cache.register_existing(ClusterId(id));
        }
    }

    #[test]
    fn test_sync_is_idempotent() {
        let (dir, cache) = setup(usize::MAX);
        seed(&cache, dir.path(), &[1]);

        cache.sync(ClusterId(1)).unwrap();
        let after_first = cache.stats();
        assert_eq!(after_first.loads, 1);

        cache.sync(ClusterId(1)).unwrap();
        let after_second = cache.stats();
        assert_eq!(after_second.loads, after_first.loads);
        assert_eq!(after_second.writebacks, after_first.writebacks);
        assert_eq!(after_second.hits, after_first.hits + 1);
    }

    #[test]
    fn test_unknown_cluster_is_conflict() {
        let (_dir, cache) = setup(usize::MAX);
        assert!(matches!(
            cache.sync(ClusterId(99)),
            Err(IvfError::RebalanceConflict(ClusterId(99)))
        ));
    }

    #[test]
    fn test_pinned_cluster_survives_pressure() {
        let dir = tempdir().unwrap();
        let total = {
            let cache = open_cache(dir.path(), usize::MAX);
            seed(&cache, dir.path(), &[1, 2, 3, 4]);
            for id in 1..=4 {
                cache.sync(ClusterId(id)).unwrap();
            }
            cache.stats().resident_bytes
        };

        // Room for about two of the four clusters.
        let cache = open_cache(dir.path(), total / 2);
        for id in 1..=4 {
            cache.register_existing(ClusterId(id));
        }
        let pins = cache.sync_lock(&[ClusterId(1)]).unwrap();
        for id in [2u64, 3, 4, 2, 3, 4] {
            cache.sync(ClusterId(id)).unwrap();
            assert!(cache.is_resident(ClusterId(1)));
            assert!(cache.is_resident(ClusterId(id)));
        }
        assert!(cache.stats().evictions >= 3);
        pins.unlock().unwrap();
    }

    #[test]
    fn test_eviction_skips_cluster_under_read() {
        let dir = tempdir().unwrap();
        let one = {
            let cache = open_cache(dir.path(), usize::MAX);
            seed(&cache, dir.path(), &[1, 2, 3]);
            cache.sync(ClusterId(1)).unwrap();
            cache.stats().resident_bytes
        };

        let cache = open_cache(dir.path(), one);
        for id in 1..=3 {
            cache.register_existing(ClusterId(id));
        }
        cache.sync(ClusterId(1)).unwrap();
        let slot = cache.state.lock().entries[&ClusterId(1)].slot.clone();
        let reading = slot.read();

        cache.sync(ClusterId(2)).unwrap();
        assert!(cache.is_resident(ClusterId(1)));
        assert!(!cache.state.lock().entries[&ClusterId(1)].evicting);
        drop(reading);

        cache.sync(ClusterId(3)).unwrap();
        assert!(!cache.is_resident(ClusterId(1)));
        assert_eq!(cache.read(ClusterId(1), |c| c.len()).unwrap(), 10);
    }

    #[test]
    fn test_concurrent_faults_keep_accounting() {
        let dir = tempdir().unwrap();
        let ids: Vec<u64> = (1..=8).collect();
        let one = {
            let cache = open_cache(dir.path(), usize::MAX);
            seed(&cache, dir.path(), &ids);
            cache.sync(ClusterId(1)).unwrap();
            cache.stats().resident_bytes
        };

        // Every thread may hold one pin at a time.
        let cache = open_cache(dir.path(), one * 4 + one / 2);
        for &id in &ids {
            cache.register_existing(ClusterId(id));
        }

        std::thread::scope(|s| {
            for t in 0..4u64 {
                let cache = &cache;
                s.spawn(move || {
                    for round in 0..60u64 {
                        let id = ClusterId((t * 7 + round * 3) % 8 + 1);
                        if round % 5 == 0 {
                            let pins = cache
                                .sync_lock_until(&[id], Instant::now() + Duration::from_secs(10))
                                .unwrap();
                            pins.write(id, |c| c.compact(DistanceMetric::Euclidean)).unwrap().unwrap();
                            pins.unlock().unwrap();
                        } else {
                            assert_eq!(cache.read(id, |c| c.len()).unwrap(), 10);
                        }
                    }
                });
            }
        });

        let state = cache.state.lock();
        let resident: usize = state
            .entries
            .values()
            .filter(|e| e.resident)
            .map(|e| e.bytes)
            .sum();
        assert_eq!(state.resident_bytes, resident);
        assert!(state.entries.values().all(|e| !e.evicting && !e.pinned));
        drop(state);
        assert!(cache.stats().evictions > 0);
        for &id in &ids {
            assert_eq!(cache.read(ClusterId(id), |c| c.len()).unwrap(), 10);
        }
    }

    #[test]
    fn test_capacity_exceeded() {
        let (dir, cache) = setup(16);
        seed(&cache, dir.path(), &[1]);
        let err = cache.sync_lock(&[ClusterId(1)]).err().unwrap();
        assert!(matches!(err, IvfError::CapacityExceeded { budget: 16, .. }));
        assert!(!err.is_retryable());
        assert!(!cache.is_pinned(ClusterId(1)));
    }

    #[test]
    fn test_lock_timeout_releases_partial_set() {
        let (dir, cache) = setup(usize::MAX);
        seed(&cache, dir.path(), &[1, 2]);
        let held = cache.sync_lock(&[ClusterId(2)]).unwrap();
        let err = cache
            .sync_lock(&[ClusterId(1), ClusterId(2)])
            .err()
            .unwrap();
        assert!(matches!(err, IvfError::LockTimeout { cluster: ClusterId(2), .. }));
        assert!(err.is_retryable());
        assert!(!cache.is_pinned(ClusterId(1)));
        assert!(cache.is_pinned(ClusterId(2)));
        drop(held);
        assert!(!cache.is_pinned(ClusterId(2)));
    }

    #[test]
    fn test_unlock_writes_back_dirty() {
        let (dir, cache) = setup(usize::MAX);
        seed(&cache, dir.path(), &[1]);
        let pins = cache.sync_lock(&[ClusterId(1)]).unwrap();
        assert!(pins.write(ClusterId(1), |c| c.delete("c1-0")).unwrap());
        let before = cache.stats().writebacks;
        pins.unlock().unwrap();
        assert_eq!(cache.stats().writebacks, before + 1);

        let reloaded = Cluster::load(dir.path(), ClusterId(1), cache.store(), 2).unwrap();
        assert!(!reloaded.contains("c1-0"));
        assert_eq!(reloaded.len(), 9);
    }

    #[test]
    fn test_write_requires_pin() {
        let (dir, cache) = setup(usize::MAX);
        seed(&cache, dir.path(), &[1, 2]);
        let pins = cache.sync_lock(&[ClusterId(1)]).unwrap();
        assert!(matches!(
            pins.write(ClusterId(2), |c| c.len()),
            Err(IvfError::RebalanceConflict(ClusterId(2)))
        ));
    }

    #[test]
    fn test_adopt_and_retire() {
        let (dir, cache) = setup(usize::MAX);
        seed(&cache, dir.path(), &[1]);
        let mut pins = cache.sync_lock(&[ClusterId(1)]).unwrap();
        pins.adopt(make_cluster(&cache, 5, 3));
        pins.retire(ClusterId(1)).unwrap();
        assert!(!cache.contains(ClusterId(1)));
        assert!(!cluster_path(dir.path(), ClusterId(1)).exists());
        pins.unlock().unwrap();
        assert!(cluster_path(dir.path(), ClusterId(5)).exists());
        assert_eq!(cache.cluster_ids(), vec![ClusterId(5)]);
    }

    #[test]
    fn test_waiter_acquires_after_release() {
        let (dir, cache) = setup(usize::MAX);
        seed(&cache, dir.path(), &[1]);
        let cache = Arc::new(cache);
        let held = cache.sync_lock(&[ClusterId(1)]).unwrap();

        let waiter = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                cache
                    .sync_lock_until(&[ClusterId(1)], Instant::now() + Duration::from_secs(5))
                    .map(|p| p.ids().to_vec())
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        held.unlock().unwrap();
        assert_eq!(waiter.join().unwrap().unwrap(), vec![ClusterId(1)]);
    }
}
