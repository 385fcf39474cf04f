// Copyright (c) 2025 SynaDB Contributors
// Licensed under the SynaDB License. See LICENSE file for details.

//! Clusters: the unit of storage, indexing and caching.
//!
//! A cluster owns a centroid, an ordered member list of [`VectorRecord`]s and
//! a local graph over those members. It is persisted as one file:
//!
//! ```text
//! [magic "SIVC"][version u16][len u64]
//! bincode { cluster_id, centroid, member_count, members[], quarantined[], local_graph }
//! [crc32 u32]
//! ```
//!
//! Vector payloads are not part of the file. They live in the shared
//! [`VectorStore`] and are faulted in when the cluster is loaded.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::GraphConfig;
use crate::distance::{self, DistanceMetric};
use crate::error::{IvfError, Result};
use crate::graph::ProximityGraph;
use crate::persist;
use crate::store::VectorStore;
use crate::types::{decode_vector, ClusterId, VectorRecord};

const CLUSTER_MAGIC: &[u8; 4] = b"SIVC";
const CLUSTER_VERSION: u16 = 1;

/// One member slot. Tombstoned members keep their record until the cluster
/// is rebuilt, since the local graph still routes through them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    /// Location of the payload.
    pub record: VectorRecord,
    /// Tombstone flag.
    pub deleted: bool,
}

#[derive(Serialize)]
struct ClusterFileRef<'a> {
    cluster_id: ClusterId,
    centroid: &'a [f32],
    member_count: u64,
    members: &'a [Member],
    quarantined: Vec<&'a VectorRecord>,
    graph: &'a ProximityGraph<String>,
}

/// Deserialized cluster file.
#[derive(Deserialize)]
pub(crate) struct ClusterFile {
    pub cluster_id: ClusterId,
    pub centroid: Vec<f32>,
    pub member_count: u64,
    pub members: Vec<Member>,
    pub quarantined: Vec<VectorRecord>,
    pub graph: ProximityGraph<String>,
}

/// Path of the file holding cluster `id` inside `dir`.
pub(crate) fn cluster_path(dir: &Path, id: ClusterId) -> PathBuf {
    dir.join(format!("cluster-{:08}.ivc", id.0))
}

/// Parses a cluster id back out of a file name written by [`cluster_path`].
pub(crate) fn parse_cluster_file_name(name: &str) -> Option<ClusterId> {
    name.strip_prefix("cluster-")?
        .strip_suffix(".ivc")?
        .parse()
        .ok()
        .map(ClusterId)
}

/// A resident cluster.
#[derive(Debug, Clone)]
pub struct Cluster {
    id: ClusterId,
    centroid: Vec<f32>,
    members: Vec<Member>,
    positions: HashMap<String, usize>,
    graph: ProximityGraph<String>,
    quarantined: HashMap<String, VectorRecord>,
    dirty: bool,
}

impl Cluster {
    /// Creates an empty cluster around `centroid`.
    pub fn new(
        id: ClusterId,
        centroid: Vec<f32>,
        metric: DistanceMetric,
        config: GraphConfig,
    ) -> Self {
        let dims = centroid.len() as u16;
        Self {
            id,
            centroid,
            members: Vec::new(),
            positions: HashMap::new(),
            graph: ProximityGraph::new(dims, metric, config),
            quarantined: HashMap::new(),
            dirty: true,
        }
    }

    /// Builds a cluster from live entries; the centroid is their mean.
    pub fn from_entries(
        id: ClusterId,
        entries: Vec<(VectorRecord, Vec<f32>)>,
        dims: u16,
        metric: DistanceMetric,
        config: GraphConfig,
    ) -> Result<Self> {
        let centroid = distance::centroid(entries.iter().map(|(_, v)| v.as_slice()), dims as usize);
        let mut cluster = Self::new(id, centroid, metric, config);
        for (record, vector) in entries {
            cluster.insert(record, vector)?;
        }
        Ok(cluster)
    }

    /// Cluster id.
    pub fn id(&self) -> ClusterId {
        self.id
    }

    /// Centroid vector.
    pub fn centroid(&self) -> &[f32] {
        &self.centroid
    }

    /// Returns true if the in-memory state is newer than the file.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Number of live members.
    pub fn len(&self) -> usize {
        self.graph.len()
    }

    /// Returns true if the cluster has no live members.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of tombstoned members awaiting reclamation.
    pub fn tombstones(&self) -> usize {
        self.graph.tombstones()
    }

    /// Returns true if `id` is a live member.
    pub fn contains(&self, id: &str) -> bool {
        self.positions
            .get(id)
            .map(|&p| !self.members[p].deleted)
            .unwrap_or(false)
    }

    /// Returns true if `id` was dropped on load because its payload failed
    /// the store's checksum.
    pub fn is_quarantined(&self, id: &str) -> bool {
        self.quarantined.contains_key(id)
    }

    /// Ids dropped on load because of corrupt payloads.
    pub fn quarantined(&self) -> impl Iterator<Item = &String> {
        self.quarantined.keys()
    }

    /// Record of a quarantined id, pointing at the damaged payload.
    pub fn quarantined_record(&self, id: &str) -> Option<&VectorRecord> {
        self.quarantined.get(id)
    }

    /// Live member records in insertion order.
    pub fn records(&self) -> impl Iterator<Item = &VectorRecord> {
        self.members
            .iter()
            .filter(|m| !m.deleted)
            .map(|m| &m.record)
    }

    /// Record for a live member.
    pub fn record(&self, id: &str) -> Option<&VectorRecord> {
        self.positions
            .get(id)
            .map(|&p| &self.members[p])
            .filter(|m| !m.deleted)
            .map(|m| &m.record)
    }

    /// Resident vector of a live member.
    pub fn vector(&self, id: &str) -> Option<&[f32]> {
        if !self.contains(id) {
            return None;
        }
        self.graph.vector(&id.to_string())
    }

    /// Live members with their vectors, for rebalancing.
    pub fn live_entries(&self) -> Vec<(VectorRecord, Vec<f32>)> {
        self.records()
            .filter_map(|r| {
                self.graph
                    .vector(&r.id)
                    .map(|v| (r.clone(), v.to_vec()))
            })
            .collect()
    }

    /// Adds or replaces a member.
    pub fn insert(&mut self, record: VectorRecord, vector: Vec<f32>) -> Result<()> {
        self.graph.insert(record.id.clone(), vector)?;
        self.quarantined.remove(&record.id);
        let member = Member {
            record,
            deleted: false,
        };
        match self.positions.get(&member.record.id) {
            Some(&pos) => self.members[pos] = member,
            None => {
                self.positions
                    .insert(member.record.id.clone(), self.members.len());
                self.members.push(member);
            }
        }
        self.dirty = true;
        Ok(())
    }

    /// Tombstones a member. Returns `false` if it was not a live member.
    ///
    /// Deleting a quarantined id releases it and returns `true`.
    pub fn delete(&mut self, id: &str) -> bool {
        if self.quarantined.remove(id).is_some() {
            return true;
        }
        let Some(&pos) = self.positions.get(id) else {
            return false;
        };
        if self.members[pos].deleted {
            return false;
        }
        self.members[pos].deleted = true;
        self.graph.delete(&id.to_string());
        self.dirty = true;
        true
    }

    /// Searches the local graph.
    pub fn search(&self, query: &[f32], k: usize, ef: usize) -> Vec<(String, f32)> {
        self.graph.search(query, k, ef)
    }

    /// Default beam width of the local graph.
    pub fn ef_search(&self) -> usize {
        self.graph.config().ef_search
    }

    /// Rebuilds the local graph from live members, dropping tombstones.
    pub fn compact(&mut self, metric: DistanceMetric) -> Result<usize> {
        let reclaimed = self.tombstones();
        let config = self.graph.config().clone();
        let mut rebuilt = Self::new(self.id, self.centroid.clone(), metric, config);
        for (record, vector) in self.live_entries() {
            rebuilt.insert(record, vector)?;
        }
        rebuilt.quarantined = std::mem::take(&mut self.quarantined);
        *self = rebuilt;
        Ok(reclaimed)
    }

    /// Estimated resident size in bytes.
    pub fn byte_size(&self) -> usize {
        let dims = self.centroid.len();
        let stats = self.graph.stats();
        let per_member = dims * 4 + std::mem::size_of::<Member>() + 48;
        let ids: usize = self.members.iter().map(|m| m.record.id.len() * 2).sum();
        dims * 4 + self.members.len() * per_member + ids + stats.total_edges * 16
    }

    /// Writes the cluster file atomically and clears the dirty flag.
    pub fn save(&mut self, dir: &Path, sync: bool) -> Result<()> {
        let mut quarantined: Vec<&VectorRecord> = self.quarantined.values().collect();
        quarantined.sort_by(|a, b| a.id.cmp(&b.id));
        let file = ClusterFileRef {
            cluster_id: self.id,
            centroid: &self.centroid,
            member_count: self.len() as u64,
            members: &self.members,
            quarantined,
            graph: &self.graph,
        };
        persist::write_atomic(&cluster_path(dir, self.id), CLUSTER_MAGIC, CLUSTER_VERSION, &file, sync)?;
        self.dirty = false;
        Ok(())
    }

    /// Reads a cluster file without faulting in payloads.
    pub(crate) fn read_file(dir: &Path, id: ClusterId) -> Result<ClusterFile> {
        let file: ClusterFile =
            persist::read_checked(&cluster_path(dir, id), CLUSTER_MAGIC, CLUSTER_VERSION)?;
        if file.cluster_id != id {
            return Err(IvfError::CorruptedIndex(format!(
                "cluster file for {id} contains {}",
                file.cluster_id
            )));
        }
        Ok(file)
    }

    /// Loads a cluster and faults its payloads in from `store`.
    ///
    /// A member whose payload fails its checksum is tombstoned and
    /// quarantined; the rest of the cluster loads normally.
    pub fn load(dir: &Path, id: ClusterId, store: &VectorStore, dims: u16) -> Result<Self> {
        let ClusterFile {
            cluster_id,
            centroid,
            member_count,
            mut members,
            quarantined,
            mut graph,
        } = Self::read_file(dir, id)?;

        if centroid.len() != dims as usize {
            return Err(IvfError::DimensionMismatch {
                expected: dims,
                got: centroid.len(),
            });
        }

        let mut positions = HashMap::with_capacity(members.len());
        for (pos, member) in members.iter().enumerate() {
            positions.insert(member.record.id.clone(), pos);
        }

        let mut corrupt = Vec::new();
        graph.restore(|key| {
            let pos = positions.get(key).ok_or_else(|| {
                IvfError::CorruptedIndex(format!("{cluster_id}: graph node {key} has no record"))
            })?;
            let record = &members[*pos].record;
            match store.read(record.offset, record.len) {
                Ok(bytes) => Ok(decode_vector(&bytes)),
                Err(e @ IvfError::StorageCorruption { .. }) => {
                    warn!(cluster = %cluster_id, id = %key, error = %e, "quarantining member");
                    corrupt.push(*pos);
                    // Placeholder position; the node only keeps routing.
                    Ok(centroid.clone())
                }
                Err(e) => Err(e),
            }
        })?;

        if graph.len() as u64 != member_count {
            return Err(IvfError::CorruptedIndex(format!(
                "{cluster_id}: member count {member_count} but graph holds {}",
                graph.len()
            )));
        }

        let mut quarantined: HashMap<String, VectorRecord> = quarantined
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();
        let carried = quarantined.len();
        for pos in corrupt {
            let member = &mut members[pos];
            if !member.deleted {
                member.deleted = true;
                graph.delete(&member.record.id);
                quarantined.insert(member.record.id.clone(), member.record.clone());
            }
        }

        Ok(Self {
            id: cluster_id,
            centroid,
            members,
            positions,
            graph,
            dirty: quarantined.len() > carried,
            quarantined,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::encode_vector;
    use tempfile::tempdir;

    fn put(store: &VectorStore, cluster: &mut Cluster, id: &str, v: Vec<f32>) {
        let bytes = encode_vector(&v);
        let offset = store.append(&bytes).unwrap();
        let record = VectorRecord {
            id: id.to_string(),
            dims: v.len() as u16,
            offset,
            len: bytes.len() as u32,
        };
        cluster.insert(record, v).unwrap();
    }

    #[test]
    fn test_file_name_roundtrip() {
        let dir = Path::new("/tmp");
        let path = cluster_path(dir, ClusterId(42));
        let name = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(parse_cluster_file_name(name), Some(ClusterId(42)));
        assert_eq!(parse_cluster_file_name("global.idx"), None);
    }

    #[test]
    fn test_insert_delete_membership() {
        let mut cluster = Cluster::new(
            ClusterId(1),
            vec![0.0; 3],
            DistanceMetric::Euclidean,
            GraphConfig::with_m(4),
        );
        let dir = tempdir().unwrap();
        let store = VectorStore::open(dir.path().join("v.dat")).unwrap();
        put(&store, &mut cluster, "a", vec![1.0, 0.0, 0.0]);
        put(&store, &mut cluster, "b", vec![0.0, 1.0, 0.0]);
        assert_eq!(cluster.len(), 2);
        assert!(cluster.delete("a"));
        assert!(!cluster.contains("a"));
        assert_eq!(cluster.tombstones(), 1);
        assert_eq!(cluster.records().count(), 1);

        put(&store, &mut cluster, "a", vec![0.0, 0.0, 1.0]);
        assert!(cluster.contains("a"));
        assert_eq!(cluster.len(), 2);
        assert_eq!(cluster.vector("a"), Some(&[0.0f32, 0.0, 1.0][..]));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let store = VectorStore::open(dir.path().join("v.dat")).unwrap();
        let mut cluster = Cluster::new(
            ClusterId(7),
            vec![0.5, 0.5],
            DistanceMetric::Euclidean,
            GraphConfig::with_m(4).seed(3),
        );
        for i in 0..20 {
            put(&store, &mut cluster, &format!("v{i}"), vec![i as f32, 1.0]);
        }
        cluster.delete("v3");
        cluster.save(dir.path(), false).unwrap();
        assert!(!cluster.is_dirty());

        let loaded = Cluster::load(dir.path(), ClusterId(7), &store, 2).unwrap();
        assert_eq!(loaded.centroid(), cluster.centroid());
        assert_eq!(
            loaded.records().collect::<Vec<_>>(),
            cluster.records().collect::<Vec<_>>()
        );
        assert_eq!(loaded.tombstones(), 1);
        assert_eq!(loaded.vector("v12"), Some(&[12.0f32, 1.0][..]));
        assert_eq!(loaded.search(&[4.1, 1.0], 1, 10)[0].0, "v4");
    }

    #[test]
    fn test_load_quarantines_corrupt_payload() {
        use crate::store::RECORD_HEADER_SIZE;
        use std::io::{Seek, SeekFrom, Write};

        let dir = tempdir().unwrap();
        let path = dir.path().join("v.dat");
        let victim = {
            let store = VectorStore::open(&path).unwrap();
            let mut cluster = Cluster::new(
                ClusterId(4),
                vec![0.0, 0.0],
                DistanceMetric::Euclidean,
                GraphConfig::with_m(4).seed(1),
            );
            for i in 0..8 {
                put(&store, &mut cluster, &format!("v{i}"), vec![i as f32, 2.0]);
            }
            cluster.save(dir.path(), false).unwrap();
            store.flush().unwrap();
            cluster.record("v5").unwrap().offset
        };

        let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(victim + RECORD_HEADER_SIZE as u64)).unwrap();
        file.write_all(&[0xAB, 0xCD]).unwrap();
        drop(file);

        let store = VectorStore::open(&path).unwrap();
        let loaded = Cluster::load(dir.path(), ClusterId(4), &store, 2).unwrap();
        assert!(loaded.is_quarantined("v5"));
        assert!(!loaded.contains("v5"));
        assert_eq!(loaded.len(), 7);
        assert!(loaded.is_dirty());
        assert!(loaded.search(&[5.0, 2.0], 8, 16).iter().all(|(id, _)| id != "v5"));

        let mut loaded = loaded;
        loaded.save(dir.path(), false).unwrap();
        let reloaded = Cluster::load(dir.path(), ClusterId(4), &store, 2).unwrap();
        assert!(reloaded.is_quarantined("v5"));
        assert_eq!(reloaded.quarantined_record("v5").map(|r| r.offset), Some(victim));
        assert!(!reloaded.is_dirty());
        assert_eq!(reloaded.len(), 7);
    }

    #[test]
    fn test_compact_reclaims_tombstones() {
        let dir = tempdir().unwrap();
        let store = VectorStore::open(dir.path().join("v.dat")).unwrap();
        let mut cluster = Cluster::new(
            ClusterId(2),
            vec![0.0, 0.0],
            DistanceMetric::Euclidean,
            GraphConfig::with_m(4),
        );
        for i in 0..10 {
            put(&store, &mut cluster, &format!("v{i}"), vec![i as f32, 0.0]);
        }
        for i in 0..4 {
            cluster.delete(&format!("v{i}"));
        }
        assert_eq!(cluster.compact(DistanceMetric::Euclidean).unwrap(), 4);
        assert_eq!(cluster.tombstones(), 0);
        assert_eq!(cluster.len(), 6);
        assert!(cluster.is_dirty());
    }

    #[test]
    fn test_from_entries_centroid() {
        let entries = vec![
            (
                VectorRecord { id: "a".into(), dims: 2, offset: 64, len: 8 },
                vec![0.0, 0.0],
            ),
            (
                VectorRecord { id: "b".into(), dims: 2, offset: 84, len: 8 },
                vec![2.0, 4.0],
            ),
        ];
        let cluster = Cluster::from_entries(
            ClusterId(3),
            entries,
            2,
            DistanceMetric::Euclidean,
            GraphConfig::default(),
        )
        .unwrap();
        assert_eq!(cluster.centroid(), &[1.0, 2.0]);
        assert_eq!(cluster.len(), 2);
    }
}
