//! Snapshot artifact store with retention.
//!
//! Materialized snapshot streams are kept as single binary artifacts,
//! newest first, so a restarting node can restore the registry before
//! replaying any surviving log tail. The durable variant writes files
//! under the configured snapshot directory; the in-memory variant backs
//! ephemeral nodes and tests.
//!
//! Artifact layout: an 8-byte big-endian length, the bincode-encoded
//! [`SnapshotMeta`], then the framed snapshot stream produced by
//! [`crate::SnapshotCodec`].

use std::path::PathBuf;

use openraft::{BasicNode, SnapshotMeta};
use parking_lot::RwLock;
use webmesh_storage::StorageError;
use webmesh_types::RaftNodeId;

/// A retained snapshot artifact.
#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    /// Raft metadata of the snapshot.
    pub meta: SnapshotMeta<RaftNodeId, BasicNode>,
    /// The framed snapshot stream.
    pub data: Vec<u8>,
}

enum Inner {
    Disk { dir: PathBuf },
    Memory { snapshots: RwLock<Vec<StoredSnapshot>> },
}

/// Stores snapshot artifacts and prunes old ones past the retention
/// count.
pub struct SnapshotStore {
    inner: Inner,
    retention: usize,
}

impl SnapshotStore {
    /// Creates a durable store under `dir`, creating the directory if
    /// needed.
    pub fn open_disk(dir: PathBuf, retention: usize) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&dir).map_err(StorageError::io)?;
        Ok(Self {
            inner: Inner::Disk { dir },
            retention,
        })
    }

    /// Creates a volatile store.
    pub fn in_memory(retention: usize) -> Self {
        Self {
            inner: Inner::Memory {
                snapshots: RwLock::new(Vec::new()),
            },
            retention,
        }
    }

    /// Persists a snapshot and prunes beyond the retention count.
    pub fn store(
        &self,
        meta: &SnapshotMeta<RaftNodeId, BasicNode>,
        data: &[u8],
    ) -> Result<(), StorageError> {
        match &self.inner {
            Inner::Disk { dir } => {
                let (term, index) = meta
                    .last_log_id
                    .map(|id| (id.leader_id.term, id.index))
                    .unwrap_or((0, 0));
                let name = format!("{term:020}-{index:020}-{}.snap", meta.snapshot_id);
                let path = dir.join(&name);

                let meta_bytes = bincode::serialize(meta).map_err(StorageError::io)?;
                let mut artifact =
                    Vec::with_capacity(8 + meta_bytes.len() + data.len());
                artifact.extend_from_slice(&(meta_bytes.len() as u64).to_be_bytes());
                artifact.extend_from_slice(&meta_bytes);
                artifact.extend_from_slice(data);

                // Write then rename so readers never observe a partial
                // artifact.
                let tmp = dir.join(format!("{name}.tmp"));
                std::fs::write(&tmp, &artifact).map_err(StorageError::io)?;
                std::fs::rename(&tmp, &path).map_err(StorageError::io)?;

                self.prune_disk(dir)?;
                Ok(())
            }
            Inner::Memory { snapshots } => {
                let mut guard = snapshots.write();
                guard.push(StoredSnapshot {
                    meta: meta.clone(),
                    data: data.to_vec(),
                });
                let len = guard.len();
                if len > self.retention {
                    guard.drain(..len - self.retention);
                }
                Ok(())
            }
        }
    }

    /// Returns retained snapshot metadata, newest first.
    pub fn list(&self) -> Result<Vec<SnapshotMeta<RaftNodeId, BasicNode>>, StorageError> {
        match &self.inner {
            Inner::Disk { dir } => {
                let mut out = Vec::new();
                for name in self.artifact_names(dir)?.into_iter().rev() {
                    out.push(self.read_disk(dir, &name)?.meta);
                }
                Ok(out)
            }
            Inner::Memory { snapshots } => Ok(snapshots
                .read()
                .iter()
                .rev()
                .map(|s| s.meta.clone())
                .collect()),
        }
    }

    /// Returns the newest retained snapshot, if any.
    pub fn latest(&self) -> Result<Option<StoredSnapshot>, StorageError> {
        match &self.inner {
            Inner::Disk { dir } => match self.artifact_names(dir)?.last() {
                Some(name) => Ok(Some(self.read_disk(dir, name)?)),
                None => Ok(None),
            },
            Inner::Memory { snapshots } => Ok(snapshots.read().last().cloned()),
        }
    }

    fn artifact_names(&self, dir: &PathBuf) -> Result<Vec<String>, StorageError> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .map_err(StorageError::io)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.ends_with(".snap"))
            .collect();
        // Zero-padded term/index prefixes make the lexicographic order
        // the log order.
        names.sort();
        Ok(names)
    }

    fn read_disk(&self, dir: &PathBuf, name: &str) -> Result<StoredSnapshot, StorageError> {
        let raw = std::fs::read(dir.join(name)).map_err(StorageError::io)?;
        if raw.len() < 8 {
            return Err(StorageError::Decode {
                key: name.to_string(),
                message: "truncated snapshot artifact".to_string(),
            });
        }
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&raw[..8]);
        let meta_len = u64::from_be_bytes(len_bytes) as usize;
        if raw.len() < 8 + meta_len {
            return Err(StorageError::Decode {
                key: name.to_string(),
                message: "truncated snapshot metadata".to_string(),
            });
        }
        let meta: SnapshotMeta<RaftNodeId, BasicNode> =
            bincode::deserialize(&raw[8..8 + meta_len]).map_err(|e| StorageError::Decode {
                key: name.to_string(),
                message: e.to_string(),
            })?;
        Ok(StoredSnapshot {
            meta,
            data: raw[8 + meta_len..].to_vec(),
        })
    }

    fn prune_disk(&self, dir: &PathBuf) -> Result<(), StorageError> {
        let names = self.artifact_names(dir)?;
        if names.len() <= self.retention {
            return Ok(());
        }
        for name in &names[..names.len() - self.retention] {
            std::fs::remove_file(dir.join(name)).map_err(StorageError::io)?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use openraft::StoredMembership;
    use tempfile::tempdir;

    use super::*;

    fn meta(term: u64, index: u64) -> SnapshotMeta<RaftNodeId, BasicNode> {
        SnapshotMeta {
            last_log_id: Some(openraft::LogId::new(
                openraft::CommittedLeaderId::new(term, 0),
                index,
            )),
            last_membership: StoredMembership::default(),
            snapshot_id: format!("snapshot-{index}"),
        }
    }

    #[test]
    fn test_disk_store_and_latest() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::open_disk(dir.path().join("snapshots"), 3).expect("open");

        store.store(&meta(1, 10), b"ten").expect("store");
        store.store(&meta(1, 20), b"twenty").expect("store");

        let latest = store.latest().expect("latest").expect("some");
        assert_eq!(latest.data, b"twenty");
        assert_eq!(latest.meta.last_log_id.unwrap().index, 20);
    }

    #[test]
    fn test_disk_retention_prunes_oldest() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::open_disk(dir.path().join("snapshots"), 2).expect("open");

        for index in [10, 20, 30, 40] {
            store.store(&meta(1, index), b"data").expect("store");
        }

        let listed = store.list().expect("list");
        assert_eq!(listed.len(), 2);
        // Newest first.
        assert_eq!(listed[0].last_log_id.unwrap().index, 40);
        assert_eq!(listed[1].last_log_id.unwrap().index, 30);
    }

    #[test]
    fn test_memory_retention() {
        let store = SnapshotStore::in_memory(1);
        store.store(&meta(1, 1), b"a").expect("store");
        store.store(&meta(1, 2), b"b").expect("store");
        let listed = store.list().expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].last_log_id.unwrap().index, 2);
    }

    #[test]
    fn test_empty_store() {
        let store = SnapshotStore::in_memory(3);
        assert!(store.latest().expect("latest").is_none());
        assert!(store.list().expect("list").is_empty());
    }

    #[test]
    fn test_disk_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("snapshots");
        {
            let store = SnapshotStore::open_disk(path.clone(), 3).expect("open");
            store.store(&meta(2, 7), b"persisted").expect("store");
        }
        let store = SnapshotStore::open_disk(path, 3).expect("reopen");
        let latest = store.latest().expect("latest").expect("some");
        assert_eq!(latest.data, b"persisted");
    }
}
