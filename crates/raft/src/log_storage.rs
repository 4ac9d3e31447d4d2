//! Raft storage over redb and the key/value backend.
//!
//! One redb database holds the append-only log table and a small
//! metadata table (vote, last purged id, applied state, format code):
//! the log store and stable store of the node. The state machine half
//! applies committed entries to the mesh key/value backend, which is the
//! only component allowed to mutate it.
//!
//! Opening a store records the configured log format; re-opening under a
//! different format fails, since mid-cluster format migration is
//! unsupported.

use std::fmt::Debug;
use std::io::Cursor;
use std::ops::RangeBounds;
use std::path::Path;
use std::sync::Arc;

use openraft::storage::{LogState, RaftLogReader, RaftSnapshotBuilder, Snapshot};
use openraft::{
    BasicNode, Entry, EntryPayload, LogId, OptionalSend, RaftStorage, SnapshotMeta, StorageError,
    StoredMembership, Vote,
};
use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::info;

use webmesh_storage::{KvBackend, Prefix};
use webmesh_types::{LogFormat, RaftNodeId};

use crate::codec::{SnapshotCodec, SnapshotPayload};
use crate::error::ConsensusError;
use crate::snapshot::SnapshotStore;
use crate::types::{MeshRequest, MeshResponse, MeshTypeConfig};

// ============================================================================
// Table Definitions
// ============================================================================

/// Raft log entries. Key: log index. Value: serialized entry.
const LOG_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("raft_log");

/// Stable metadata. Key: metadata name. Value: serialized value.
const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("raft_meta");

const KEY_VOTE: &str = "vote";
const KEY_LAST_PURGED: &str = "last_purged";
const KEY_APPLIED: &str = "applied";
const KEY_LOG_FORMAT: &str = "log_format";

// ============================================================================
// Applied State
// ============================================================================

/// State machine bookkeeping persisted alongside the log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AppliedMeta {
    /// Last applied log id.
    last_applied: Option<LogId<RaftNodeId>>,
    /// Stored membership configuration.
    membership: StoredMembership<RaftNodeId, BasicNode>,
}

// ============================================================================
// Mesh Log Store
// ============================================================================

/// Combined raft storage: log store, stable store, and the state machine
/// that folds committed entries into the key/value backend.
pub struct MeshLogStore {
    db: Arc<Database>,
    backend: Arc<dyn KvBackend>,
    snapshots: Arc<SnapshotStore>,
    codec: SnapshotCodec,
    vote_cache: RwLock<Option<Vote<RaftNodeId>>>,
    last_purged_cache: RwLock<Option<LogId<RaftNodeId>>>,
    applied: RwLock<AppliedMeta>,
}

impl MeshLogStore {
    /// Opens or creates the log store at `path`.
    ///
    /// If a snapshot newer than the persisted applied state is retained,
    /// it is restored into the backend before the node replays any log
    /// tail. A restore failure fails the open, leaving the backend
    /// unchanged.
    pub fn open(
        path: impl AsRef<Path>,
        backend: Arc<dyn KvBackend>,
        snapshots: Arc<SnapshotStore>,
        format: LogFormat,
    ) -> Result<Self, ConsensusError> {
        let db = Database::create(path.as_ref())
            .map_err(|e| ConsensusError::Store {
                source: webmesh_storage::StorageError::io(e),
            })?;
        Self::with_database(db, backend, snapshots, format)
    }

    /// Creates a volatile log store for in-memory nodes.
    pub fn in_memory(
        backend: Arc<dyn KvBackend>,
        snapshots: Arc<SnapshotStore>,
        format: LogFormat,
    ) -> Result<Self, ConsensusError> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(|e| ConsensusError::Store {
                source: webmesh_storage::StorageError::io(e),
            })?;
        Self::with_database(db, backend, snapshots, format)
    }

    fn with_database(
        db: Database,
        backend: Arc<dyn KvBackend>,
        snapshots: Arc<SnapshotStore>,
        format: LogFormat,
    ) -> Result<Self, ConsensusError> {
        let store_err = |e: &dyn std::fmt::Display| ConsensusError::Store {
            source: webmesh_storage::StorageError::Io {
                message: e.to_string(),
            },
        };

        // Ensure tables exist.
        let write_txn = db.begin_write().map_err(|e| store_err(&e))?;
        {
            let _ = write_txn.open_table(LOG_TABLE).map_err(|e| store_err(&e))?;
            let _ = write_txn.open_table(META_TABLE).map_err(|e| store_err(&e))?;
        }
        write_txn.commit().map_err(|e| store_err(&e))?;

        let store = Self {
            db: Arc::new(db),
            backend,
            snapshots,
            codec: SnapshotCodec::new(format),
            vote_cache: RwLock::new(None),
            last_purged_cache: RwLock::new(None),
            applied: RwLock::new(AppliedMeta::default()),
        };

        store.check_log_format(format)?;
        store.load_caches()?;
        store.restore_latest_snapshot()?;
        Ok(store)
    }

    /// Verifies the store was written with the configured format, or
    /// records the format on first open.
    fn check_log_format(&self, format: LogFormat) -> Result<(), ConsensusError> {
        let stored = self.read_meta_raw(KEY_LOG_FORMAT)?;
        match stored {
            Some(raw) => {
                let code: u32 = bincode::deserialize(&raw).map_err(|e| ConsensusError::Store {
                    source: webmesh_storage::StorageError::io(e),
                })?;
                if code != format.code() {
                    let stored = LogFormat::from_code(code)
                        .map(|f| f.to_string())
                        .unwrap_or_else(|| format!("code {code}"));
                    return Err(ConsensusError::FormatMismatch {
                        stored,
                        configured: format.to_string(),
                    });
                }
                Ok(())
            }
            None => self.write_meta_raw(
                KEY_LOG_FORMAT,
                &bincode::serialize(&format.code()).unwrap_or_default(),
            ),
        }
    }

    fn load_caches(&self) -> Result<(), ConsensusError> {
        if let Some(raw) = self.read_meta_raw(KEY_VOTE)? {
            let vote: Vote<RaftNodeId> =
                bincode::deserialize(&raw).map_err(|e| ConsensusError::Store {
                    source: webmesh_storage::StorageError::io(e),
                })?;
            *self.vote_cache.write() = Some(vote);
        }
        if let Some(raw) = self.read_meta_raw(KEY_LAST_PURGED)? {
            let purged: LogId<RaftNodeId> =
                bincode::deserialize(&raw).map_err(|e| ConsensusError::Store {
                    source: webmesh_storage::StorageError::io(e),
                })?;
            *self.last_purged_cache.write() = Some(purged);
        }
        if let Some(raw) = self.read_meta_raw(KEY_APPLIED)? {
            let applied: AppliedMeta =
                bincode::deserialize(&raw).map_err(|e| ConsensusError::Store {
                    source: webmesh_storage::StorageError::io(e),
                })?;
            *self.applied.write() = applied;
        }
        Ok(())
    }

    /// Restores the newest retained snapshot when it is ahead of the
    /// persisted applied state. All-or-nothing: the stream is decoded in
    /// full before the backend is touched.
    fn restore_latest_snapshot(&self) -> Result<(), ConsensusError> {
        let Some(stored) = self.snapshots.latest().map_err(|source| ConsensusError::Store { source })?
        else {
            return Ok(());
        };
        let snapshot_index = stored.meta.last_log_id.map(|id| id.index).unwrap_or(0);
        let applied_index = self
            .applied
            .read()
            .last_applied
            .map(|id| id.index)
            .unwrap_or(0);
        if snapshot_index <= applied_index {
            return Ok(());
        }

        info!(
            snapshot_id = %stored.meta.snapshot_id,
            index = snapshot_index,
            "restoring registry from snapshot"
        );
        let payload = self
            .codec
            .decode(&stored.data)
            .map_err(ConsensusError::raft)?;
        self.apply_snapshot_payload(&payload)
            .map_err(|source| ConsensusError::Store { source })?;

        let mut applied = self.applied.write();
        applied.last_applied = stored.meta.last_log_id;
        applied.membership = stored.meta.last_membership.clone();
        let meta = applied.clone();
        drop(applied);
        self.write_meta_raw(
            KEY_APPLIED,
            &bincode::serialize(&meta).unwrap_or_default(),
        )?;

        // The snapshot stands in for the log prefix it covers; record
        // it as purged so the log state stays consistent after log
        // loss.
        if let Some(last_log_id) = stored.meta.last_log_id {
            let current_purged = *self.last_purged_cache.read();
            if current_purged.map(|id| id.index).unwrap_or(0) < last_log_id.index {
                self.write_meta_raw(
                    KEY_LAST_PURGED,
                    &bincode::serialize(&last_log_id).unwrap_or_default(),
                )?;
                *self.last_purged_cache.write() = Some(last_log_id);
            }
        }
        Ok(())
    }

    /// Replaces the registry contents with the decoded payload.
    fn apply_snapshot_payload(
        &self,
        payload: &SnapshotPayload,
    ) -> Result<(), webmesh_storage::StorageError> {
        self.backend.delete_prefix(Prefix::REGISTRY.as_str())?;
        for (key, value) in &payload.records {
            self.backend
                .put(key, value, std::time::Duration::ZERO)?;
        }
        Ok(())
    }

    fn read_meta_raw(&self, key: &str) -> Result<Option<Vec<u8>>, ConsensusError> {
        let store_err = |e: &dyn std::fmt::Display| ConsensusError::Store {
            source: webmesh_storage::StorageError::Io {
                message: e.to_string(),
            },
        };
        let read_txn = self.db.begin_read().map_err(|e| store_err(&e))?;
        let table = read_txn.open_table(META_TABLE).map_err(|e| store_err(&e))?;
        Ok(table
            .get(key)
            .map_err(|e| store_err(&e))?
            .map(|v| v.value().to_vec()))
    }

    fn write_meta_raw(&self, key: &str, value: &[u8]) -> Result<(), ConsensusError> {
        let store_err = |e: &dyn std::fmt::Display| ConsensusError::Store {
            source: webmesh_storage::StorageError::Io {
                message: e.to_string(),
            },
        };
        let write_txn = self.db.begin_write().map_err(|e| store_err(&e))?;
        {
            let mut table = write_txn.open_table(META_TABLE).map_err(|e| store_err(&e))?;
            table.insert(key, value).map_err(|e| store_err(&e))?;
        }
        write_txn.commit().map_err(|e| store_err(&e))?;
        Ok(())
    }

    fn get_last_entry(
        &self,
    ) -> Result<Option<Entry<MeshTypeConfig>>, StorageError<RaftNodeId>> {
        let read_txn = self.db.begin_read().map_err(|e| to_storage_error(&e))?;
        let log_table = read_txn
            .open_table(LOG_TABLE)
            .map_err(|e| to_storage_error(&e))?;
        let last = log_table.last().map_err(|e| to_storage_error(&e))?;
        if let Some((_, raw)) = last {
            let entry: Entry<MeshTypeConfig> =
                bincode::deserialize(raw.value()).map_err(|e| to_serde_error(&e))?;
            Ok(Some(entry))
        } else {
            Ok(None)
        }
    }

    /// Applies a single committed request to the backend.
    fn apply_request(
        &self,
        request: &MeshRequest,
    ) -> Result<MeshResponse, StorageError<RaftNodeId>> {
        let result = match request {
            MeshRequest::Put {
                key,
                value,
                ttl_seconds,
            } => self.backend.put(
                key,
                value,
                std::time::Duration::from_secs(*ttl_seconds),
            ),
            MeshRequest::Delete { key } => self.backend.delete(key),
            MeshRequest::DeletePrefix { prefix } => self.backend.delete_prefix(prefix),
        };
        // A backend failure here is fatal for the node: the state
        // machine can no longer track the log.
        result.map_err(|e| to_storage_error(&e))?;
        Ok(MeshResponse::Applied)
    }

    fn save_applied(&self, meta: &AppliedMeta) -> Result<(), StorageError<RaftNodeId>> {
        let raw = bincode::serialize(meta).map_err(|e| to_serde_error(&e))?;
        let write_txn = self.db.begin_write().map_err(|e| to_storage_error(&e))?;
        {
            let mut table = write_txn
                .open_table(META_TABLE)
                .map_err(|e| to_storage_error(&e))?;
            table
                .insert(KEY_APPLIED, raw.as_slice())
                .map_err(|e| to_storage_error(&e))?;
        }
        write_txn.commit().map_err(|e| to_storage_error(&e))?;
        Ok(())
    }

    fn build_snapshot_meta(
        &self,
        applied: &AppliedMeta,
    ) -> SnapshotMeta<RaftNodeId, BasicNode> {
        let index = applied.last_applied.map(|id| id.index).unwrap_or(0);
        SnapshotMeta {
            last_log_id: applied.last_applied,
            last_membership: applied.membership.clone(),
            snapshot_id: format!(
                "snapshot-{index}-{}",
                chrono::Utc::now().timestamp()
            ),
        }
    }
}

// ============================================================================
// RaftLogReader Implementation
// ============================================================================

impl RaftLogReader<MeshTypeConfig> for MeshLogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<MeshTypeConfig>>, StorageError<RaftNodeId>> {
        let read_txn = self.db.begin_read().map_err(|e| to_storage_error(&e))?;
        let log_table = read_txn
            .open_table(LOG_TABLE)
            .map_err(|e| to_storage_error(&e))?;

        let mut entries = Vec::new();
        for result in log_table.range(range).map_err(|e| to_storage_error(&e))? {
            let (_, raw) = result.map_err(|e| to_storage_error(&e))?;
            let entry: Entry<MeshTypeConfig> =
                bincode::deserialize(raw.value()).map_err(|e| to_serde_error(&e))?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

// ============================================================================
// Snapshot Builder
// ============================================================================

/// Builds a framed snapshot stream from the backend registry contents.
pub struct MeshSnapshotBuilder {
    backend: Arc<dyn KvBackend>,
    snapshots: Arc<SnapshotStore>,
    codec: SnapshotCodec,
    meta: SnapshotMeta<RaftNodeId, BasicNode>,
}

impl RaftSnapshotBuilder<MeshTypeConfig> for MeshSnapshotBuilder {
    async fn build_snapshot(
        &mut self,
    ) -> Result<Snapshot<MeshTypeConfig>, StorageError<RaftNodeId>> {
        let records = self
            .backend
            .iter_prefix(Prefix::REGISTRY.as_str())
            .map_err(|e| to_storage_error(&e))?;

        let (term, index) = self
            .meta
            .last_log_id
            .map(|id| (id.leader_id.term, id.index))
            .unwrap_or((0, 0));
        let payload = SnapshotPayload {
            term,
            index,
            records,
        };
        let data = self.codec.encode(&payload).map_err(|e| to_serde_error(&e))?;

        self.snapshots
            .store(&self.meta, &data)
            .map_err(|e| to_storage_error(&e))?;

        Ok(Snapshot {
            meta: self.meta.clone(),
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

// ============================================================================
// RaftStorage Implementation (deprecated but non-sealed)
// ============================================================================

#[allow(deprecated)]
impl RaftStorage<MeshTypeConfig> for MeshLogStore {
    type LogReader = Self;
    type SnapshotBuilder = MeshSnapshotBuilder;

    async fn get_log_state(
        &mut self,
    ) -> Result<LogState<MeshTypeConfig>, StorageError<RaftNodeId>> {
        let last_purged = *self.last_purged_cache.read();
        let last_log_id = self.get_last_entry()?.map(|e| e.log_id);
        Ok(LogState {
            last_purged_log_id: last_purged,
            last_log_id: last_log_id.or(last_purged),
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        Self {
            db: Arc::clone(&self.db),
            backend: Arc::clone(&self.backend),
            snapshots: Arc::clone(&self.snapshots),
            codec: self.codec,
            vote_cache: RwLock::new(*self.vote_cache.read()),
            last_purged_cache: RwLock::new(*self.last_purged_cache.read()),
            applied: RwLock::new(self.applied.read().clone()),
        }
    }

    async fn save_vote(
        &mut self,
        vote: &Vote<RaftNodeId>,
    ) -> Result<(), StorageError<RaftNodeId>> {
        let raw = bincode::serialize(vote).map_err(|e| to_serde_error(&e))?;
        let write_txn = self.db.begin_write().map_err(|e| to_storage_error(&e))?;
        {
            let mut table = write_txn
                .open_table(META_TABLE)
                .map_err(|e| to_storage_error(&e))?;
            table
                .insert(KEY_VOTE, raw.as_slice())
                .map_err(|e| to_storage_error(&e))?;
        }
        write_txn.commit().map_err(|e| to_storage_error(&e))?;
        *self.vote_cache.write() = Some(*vote);
        Ok(())
    }

    async fn read_vote(
        &mut self,
    ) -> Result<Option<Vote<RaftNodeId>>, StorageError<RaftNodeId>> {
        Ok(*self.vote_cache.read())
    }

    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<RaftNodeId>>
    where
        I: IntoIterator<Item = Entry<MeshTypeConfig>> + OptionalSend,
    {
        let write_txn = self.db.begin_write().map_err(|e| to_storage_error(&e))?;
        {
            let mut log_table = write_txn
                .open_table(LOG_TABLE)
                .map_err(|e| to_storage_error(&e))?;
            for entry in entries {
                let index = entry.log_id.index;
                let raw = bincode::serialize(&entry).map_err(|e| to_serde_error(&e))?;
                log_table
                    .insert(index, raw.as_slice())
                    .map_err(|e| to_storage_error(&e))?;
            }
        }
        write_txn.commit().map_err(|e| to_storage_error(&e))?;
        Ok(())
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<RaftNodeId>,
    ) -> Result<(), StorageError<RaftNodeId>> {
        let write_txn = self.db.begin_write().map_err(|e| to_storage_error(&e))?;
        {
            let mut log_table = write_txn
                .open_table(LOG_TABLE)
                .map_err(|e| to_storage_error(&e))?;
            let keys: Vec<u64> = log_table
                .range(log_id.index..)
                .map_err(|e| to_storage_error(&e))?
                .map(|r| r.map(|(k, _)| k.value()))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| to_storage_error(&e))?;
            for key in keys {
                log_table.remove(key).map_err(|e| to_storage_error(&e))?;
            }
        }
        write_txn.commit().map_err(|e| to_storage_error(&e))?;
        Ok(())
    }

    async fn purge_logs_upto(
        &mut self,
        log_id: LogId<RaftNodeId>,
    ) -> Result<(), StorageError<RaftNodeId>> {
        let write_txn = self.db.begin_write().map_err(|e| to_storage_error(&e))?;
        {
            let mut log_table = write_txn
                .open_table(LOG_TABLE)
                .map_err(|e| to_storage_error(&e))?;
            let mut meta_table = write_txn
                .open_table(META_TABLE)
                .map_err(|e| to_storage_error(&e))?;

            let keys: Vec<u64> = log_table
                .range(..=log_id.index)
                .map_err(|e| to_storage_error(&e))?
                .map(|r| r.map(|(k, _)| k.value()))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| to_storage_error(&e))?;
            for key in keys {
                log_table.remove(key).map_err(|e| to_storage_error(&e))?;
            }

            let raw = bincode::serialize(&log_id).map_err(|e| to_serde_error(&e))?;
            meta_table
                .insert(KEY_LAST_PURGED, raw.as_slice())
                .map_err(|e| to_storage_error(&e))?;
        }
        write_txn.commit().map_err(|e| to_storage_error(&e))?;
        *self.last_purged_cache.write() = Some(log_id);
        Ok(())
    }

    async fn last_applied_state(
        &mut self,
    ) -> Result<
        (
            Option<LogId<RaftNodeId>>,
            StoredMembership<RaftNodeId, BasicNode>,
        ),
        StorageError<RaftNodeId>,
    > {
        let applied = self.applied.read();
        Ok((applied.last_applied, applied.membership.clone()))
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<MeshTypeConfig>],
    ) -> Result<Vec<MeshResponse>, StorageError<RaftNodeId>> {
        let mut responses = Vec::with_capacity(entries.len());

        for entry in entries {
            let response = match &entry.payload {
                EntryPayload::Blank => MeshResponse::Applied,
                EntryPayload::Normal(request) => self.apply_request(request)?,
                EntryPayload::Membership(membership) => {
                    self.applied.write().membership =
                        StoredMembership::new(Some(entry.log_id), membership.clone());
                    MeshResponse::Applied
                }
            };
            self.applied.write().last_applied = Some(entry.log_id);
            responses.push(response);
        }

        let meta = self.applied.read().clone();
        self.save_applied(&meta)?;
        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        let applied = self.applied.read().clone();
        MeshSnapshotBuilder {
            backend: Arc::clone(&self.backend),
            snapshots: Arc::clone(&self.snapshots),
            codec: self.codec,
            meta: self.build_snapshot_meta(&applied),
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<RaftNodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<RaftNodeId, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<RaftNodeId>> {
        let data = snapshot.into_inner();
        // Decode in full before touching the backend so a corrupt stream
        // leaves local state untouched.
        let payload = self.codec.decode(&data).map_err(|e| to_serde_error(&e))?;
        self.apply_snapshot_payload(&payload)
            .map_err(|e| to_storage_error(&e))?;

        {
            let mut applied = self.applied.write();
            applied.last_applied = meta.last_log_id;
            applied.membership = meta.last_membership.clone();
        }
        let applied = self.applied.read().clone();
        self.save_applied(&applied)?;

        self.snapshots
            .store(meta, &data)
            .map_err(|e| to_storage_error(&e))?;
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<MeshTypeConfig>>, StorageError<RaftNodeId>> {
        let Some(stored) = self.snapshots.latest().map_err(|e| to_storage_error(&e))? else {
            return Ok(None);
        };
        Ok(Some(Snapshot {
            meta: stored.meta,
            snapshot: Box::new(Cursor::new(stored.data)),
        }))
    }
}

// ============================================================================
// Error Helpers
// ============================================================================

fn to_storage_error<E: std::fmt::Display>(e: &E) -> StorageError<RaftNodeId> {
    StorageError::from_io_error(
        openraft::ErrorSubject::Store,
        openraft::ErrorVerb::Write,
        std::io::Error::other(e.to_string()),
    )
}

fn to_serde_error<E: std::fmt::Display>(e: &E) -> StorageError<RaftNodeId> {
    StorageError::from_io_error(
        openraft::ErrorSubject::Store,
        openraft::ErrorVerb::Read,
        std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()),
    )
}

#[cfg(test)]
#[allow(deprecated, clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use openraft::CommittedLeaderId;
    use tempfile::tempdir;
    use webmesh_storage::MemoryBackend;

    use super::*;

    fn make_log_id(term: u64, index: u64) -> LogId<RaftNodeId> {
        LogId::new(CommittedLeaderId::new(term, 0), index)
    }

    fn put_entry(index: u64, key: &str, value: &str) -> Entry<MeshTypeConfig> {
        Entry {
            log_id: make_log_id(1, index),
            payload: EntryPayload::Normal(MeshRequest::Put {
                key: key.to_string(),
                value: value.to_string(),
                ttl_seconds: 0,
            }),
        }
    }

    fn open_in_memory() -> (MeshLogStore, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let snapshots = Arc::new(SnapshotStore::in_memory(3));
        let store = MeshLogStore::in_memory(backend.clone(), snapshots, LogFormat::Json)
            .expect("open store");
        (store, backend)
    }

    #[tokio::test]
    async fn test_save_and_read_vote() {
        let (mut store, _) = open_in_memory();
        let vote = Vote::new(1, 42);
        store.save_vote(&vote).await.expect("save vote");
        assert_eq!(store.read_vote().await.expect("read vote"), Some(vote));
    }

    #[tokio::test]
    async fn test_append_and_read_log() {
        let (mut store, _) = open_in_memory();
        store
            .append_to_log(vec![
                put_entry(1, "/registry/a", "1"),
                put_entry(2, "/registry/b", "2"),
            ])
            .await
            .expect("append");

        let entries = store.try_get_log_entries(1..=2).await.expect("read");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].log_id.index, 1);
        assert_eq!(entries[1].log_id.index, 2);

        let state = store.get_log_state().await.expect("log state");
        assert_eq!(state.last_log_id.unwrap().index, 2);
    }

    #[tokio::test]
    async fn test_apply_mutates_backend() {
        let (mut store, backend) = open_in_memory();
        store
            .apply_to_state_machine(&[put_entry(1, "/registry/nodes/n1", "{\"id\":\"n1\"}")])
            .await
            .expect("apply");
        assert_eq!(
            backend.get("/registry/nodes/n1").expect("get"),
            "{\"id\":\"n1\"}"
        );

        store
            .apply_to_state_machine(&[Entry {
                log_id: make_log_id(1, 2),
                payload: EntryPayload::Normal(MeshRequest::Delete {
                    key: "/registry/nodes/n1".to_string(),
                }),
            }])
            .await
            .expect("apply delete");
        assert!(backend.get("/registry/nodes/n1").is_err());

        let (last_applied, _) = store.last_applied_state().await.expect("state");
        assert_eq!(last_applied.unwrap().index, 2);
    }

    #[tokio::test]
    async fn test_apply_delete_prefix() {
        let (mut store, backend) = open_in_memory();
        store
            .apply_to_state_machine(&[
                put_entry(1, "/registry/leases/n1", "a"),
                put_entry(2, "/registry/leases/n2", "b"),
                put_entry(3, "/registry/other", "c"),
                Entry {
                    log_id: make_log_id(1, 4),
                    payload: EntryPayload::Normal(MeshRequest::DeletePrefix {
                        prefix: "/registry/leases/".to_string(),
                    }),
                },
            ])
            .await
            .expect("apply");
        assert!(backend.iter_prefix("/registry/leases/").unwrap().is_empty());
        assert!(backend.get("/registry/other").is_ok());
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip_byte_equal() {
        let (mut store, backend) = open_in_memory();
        store
            .apply_to_state_machine(&[
                put_entry(1, "/registry/foo", "bar"),
                put_entry(2, "/registry/baz", "qux"),
                put_entry(3, "/registry/abc", "def"),
            ])
            .await
            .expect("apply");
        let original = backend.iter_prefix("/registry").expect("iter");

        let mut builder = store.get_snapshot_builder().await;
        let snapshot = builder.build_snapshot().await.expect("build");
        let data = snapshot.snapshot.into_inner();

        // Restore onto an empty backend.
        let (mut fresh_store, fresh_backend) = open_in_memory();
        fresh_store
            .install_snapshot(&snapshot.meta, Box::new(Cursor::new(data)))
            .await
            .expect("install");

        let restored = fresh_backend.iter_prefix("/registry").expect("iter");
        assert_eq!(original, restored);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_leaves_backend_unchanged() {
        let (mut store, backend) = open_in_memory();
        backend
            .put("/registry/keep", "v", std::time::Duration::ZERO)
            .expect("put");

        let meta = SnapshotMeta {
            last_log_id: Some(make_log_id(1, 9)),
            last_membership: StoredMembership::default(),
            snapshot_id: "bad".to_string(),
        };
        let result = store
            .install_snapshot(&meta, Box::new(Cursor::new(b"garbage".to_vec())))
            .await;
        assert!(result.is_err());
        assert_eq!(backend.get("/registry/keep").expect("get"), "v");
    }

    #[tokio::test]
    async fn test_purge_and_conflict_delete() {
        let (mut store, _) = open_in_memory();
        store
            .append_to_log((1..=10).map(|i| put_entry(i, "/registry/k", "v")))
            .await
            .expect("append");

        store
            .delete_conflict_logs_since(make_log_id(1, 8))
            .await
            .expect("truncate");
        let entries = store.try_get_log_entries(1..).await.expect("read");
        assert_eq!(entries.last().unwrap().log_id.index, 7);

        store
            .purge_logs_upto(make_log_id(1, 3))
            .await
            .expect("purge");
        let entries = store.try_get_log_entries(1..).await.expect("read");
        assert_eq!(entries.first().unwrap().log_id.index, 4);

        let state = store.get_log_state().await.expect("state");
        assert_eq!(state.last_purged_log_id.unwrap().index, 3);
    }

    #[tokio::test]
    async fn test_format_mismatch_refused_on_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("raft.log");
        let backend: Arc<dyn KvBackend> = Arc::new(MemoryBackend::new());
        let snapshots = Arc::new(SnapshotStore::in_memory(3));

        {
            let _store = MeshLogStore::open(
                &path,
                backend.clone(),
                snapshots.clone(),
                LogFormat::Json,
            )
            .expect("open json");
        }

        let result = MeshLogStore::open(&path, backend, snapshots, LogFormat::Protobuf);
        assert!(matches!(result, Err(ConsensusError::FormatMismatch { .. })));
    }

    #[tokio::test]
    async fn test_restore_on_open_from_snapshot_store() {
        let snapshots = Arc::new(SnapshotStore::in_memory(3));

        // Build a snapshot from a populated node.
        {
            let backend = Arc::new(MemoryBackend::new());
            let mut store = MeshLogStore::in_memory(
                backend.clone(),
                snapshots.clone(),
                LogFormat::Json,
            )
            .expect("open");
            store
                .apply_to_state_machine(&[put_entry(1, "/registry/foo", "bar")])
                .await
                .expect("apply");
            let mut builder = store.get_snapshot_builder().await;
            builder.build_snapshot().await.expect("build");
        }

        // A fresh node with the same snapshot store restores the
        // registry during open.
        let backend = Arc::new(MemoryBackend::new());
        let _store =
            MeshLogStore::in_memory(backend.clone(), snapshots, LogFormat::Json).expect("open");
        assert_eq!(backend.get("/registry/foo").expect("get"), "bar");
    }
}
