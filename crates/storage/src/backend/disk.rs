//! Durable backend on redb.
//!
//! Records carry their absolute expiry so TTLs survive restarts. The
//! MVCC read transaction gives prefix iteration its consistent snapshot.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::StorageError;

use super::{KvBackend, KvEvent, KvOp, Subscription};

/// Table holding all mesh keys.
const KV_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("webmesh_kv");

/// Default capacity of the event fan-out channel.
const EVENT_CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    value: String,
    expires_at_unix_ms: Option<i64>,
}

impl StoredRecord {
    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_unix_ms.is_some_and(|at| at <= now_ms)
    }
}

fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// An ordered on-disk map backend.
pub struct DiskBackend {
    db: Arc<Database>,
    events: broadcast::Sender<KvEvent>,
    closed: AtomicBool,
}

impl DiskBackend {
    /// Opens or creates the backend database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(StorageError::io)?;

        // Ensure the table exists so later read transactions can open it.
        let write_txn = db.begin_write().map_err(StorageError::io)?;
        {
            let _ = write_txn.open_table(KV_TABLE).map_err(StorageError::io)?;
        }
        write_txn.commit().map_err(StorageError::io)?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            db: Arc::new(db),
            events,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    fn emit(&self, key: &str, op: KvOp, value: &str) {
        let _ = self.events.send(KvEvent {
            key: key.to_string(),
            op,
            value: value.to_string(),
        });
    }
}

impl KvBackend for DiskBackend {
    fn get(&self, key: &str) -> Result<String, StorageError> {
        self.ensure_open()?;
        let read_txn = self.db.begin_read().map_err(StorageError::io)?;
        let table = read_txn.open_table(KV_TABLE).map_err(StorageError::io)?;
        let Some(raw) = table.get(key).map_err(StorageError::io)? else {
            return Err(StorageError::KeyNotFound {
                key: key.to_string(),
            });
        };
        let record: StoredRecord =
            bincode::deserialize(raw.value()).map_err(|e| StorageError::Decode {
                key: key.to_string(),
                message: e.to_string(),
            })?;
        if record.is_expired(now_unix_ms()) {
            return Err(StorageError::KeyNotFound {
                key: key.to_string(),
            });
        }
        Ok(record.value)
    }

    fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError> {
        self.ensure_open()?;
        let record = StoredRecord {
            value: value.to_string(),
            expires_at_unix_ms: (!ttl.is_zero()).then(|| now_unix_ms() + ttl.as_millis() as i64),
        };
        let raw = bincode::serialize(&record).map_err(StorageError::io)?;
        let write_txn = self.db.begin_write().map_err(StorageError::io)?;
        {
            let mut table = write_txn.open_table(KV_TABLE).map_err(StorageError::io)?;
            table
                .insert(key, raw.as_slice())
                .map_err(StorageError::io)?;
        }
        write_txn.commit().map_err(StorageError::io)?;
        self.emit(key, KvOp::Put, value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.ensure_open()?;
        let write_txn = self.db.begin_write().map_err(StorageError::io)?;
        let removed = {
            let mut table = write_txn.open_table(KV_TABLE).map_err(StorageError::io)?;
            let existed = table.remove(key).map_err(StorageError::io)?;
            existed.is_some()
        };
        write_txn.commit().map_err(StorageError::io)?;
        if removed {
            self.emit(key, KvOp::Delete, "");
        }
        Ok(())
    }

    fn delete_prefix(&self, prefix: &str) -> Result<(), StorageError> {
        self.ensure_open()?;
        let write_txn = self.db.begin_write().map_err(StorageError::io)?;
        let removed: Vec<String> = {
            let mut table = write_txn.open_table(KV_TABLE).map_err(StorageError::io)?;
            let keys: Vec<String> = table
                .range(prefix..)
                .map_err(StorageError::io)?
                .map_while(|entry| {
                    entry
                        .ok()
                        .map(|(k, _)| k.value().to_string())
                        .filter(|k| k.starts_with(prefix))
                })
                .collect();
            for key in &keys {
                table.remove(key.as_str()).map_err(StorageError::io)?;
            }
            keys
        };
        write_txn.commit().map_err(StorageError::io)?;
        for key in removed {
            self.emit(&key, KvOp::Delete, "");
        }
        Ok(())
    }

    fn iter_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StorageError> {
        self.ensure_open()?;
        let now_ms = now_unix_ms();
        let read_txn = self.db.begin_read().map_err(StorageError::io)?;
        let table = read_txn.open_table(KV_TABLE).map_err(StorageError::io)?;

        let mut out = Vec::new();
        for entry in table.range(prefix..).map_err(StorageError::io)? {
            let (key, raw) = entry.map_err(StorageError::io)?;
            let key = key.value().to_string();
            if !key.starts_with(prefix) {
                break;
            }
            let record: StoredRecord =
                bincode::deserialize(raw.value()).map_err(|e| StorageError::Decode {
                    key: key.clone(),
                    message: e.to_string(),
                })?;
            if !record.is_expired(now_ms) {
                out.push((key, record.value));
            }
        }
        Ok(out)
    }

    fn subscribe(&self, prefix: &str) -> Subscription {
        Subscription::new(prefix.to_string(), self.events.subscribe())
    }

    fn close(&self) -> Result<(), StorageError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn open_backend(dir: &tempfile::TempDir) -> DiskBackend {
        DiskBackend::open(dir.path().join("kv.redb")).expect("open backend")
    }

    #[test]
    fn test_put_get_roundtrip() {
        let dir = tempdir().expect("tempdir");
        let backend = open_backend(&dir);
        backend
            .put("/registry/foo", "bar", Duration::ZERO)
            .expect("put");
        assert_eq!(backend.get("/registry/foo").expect("get"), "bar");
    }

    #[test]
    fn test_values_survive_reopen() {
        let dir = tempdir().expect("tempdir");
        {
            let backend = open_backend(&dir);
            backend
                .put("/registry/foo", "bar", Duration::ZERO)
                .expect("put");
            backend.close().expect("close");
        }
        let backend = open_backend(&dir);
        assert_eq!(backend.get("/registry/foo").expect("get"), "bar");
    }

    #[test]
    fn test_iter_prefix_ordered_and_bounded() {
        let dir = tempdir().expect("tempdir");
        let backend = open_backend(&dir);
        for key in ["/registry/b", "/registry/a", "/rest/x"] {
            backend.put(key, "v", Duration::ZERO).expect("put");
        }
        let pairs = backend.iter_prefix("/registry/").expect("iter");
        let keys: Vec<&str> = pairs.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["/registry/a", "/registry/b"]);
    }

    #[test]
    fn test_expired_records_are_hidden() {
        let dir = tempdir().expect("tempdir");
        let backend = open_backend(&dir);
        backend
            .put("/registry/tmp", "v", Duration::from_millis(1))
            .expect("put");
        std::thread::sleep(Duration::from_millis(10));
        assert!(backend.get("/registry/tmp").is_err());
        assert!(backend.iter_prefix("/registry/").expect("iter").is_empty());
    }

    #[test]
    fn test_delete_prefix() {
        let dir = tempdir().expect("tempdir");
        let backend = open_backend(&dir);
        for key in ["/registry/nodes/a", "/registry/nodes/b", "/registry/keep"] {
            backend.put(key, "v", Duration::ZERO).expect("put");
        }
        backend.delete_prefix("/registry/nodes/").expect("delete");
        assert!(backend
            .iter_prefix("/registry/nodes/")
            .expect("iter")
            .is_empty());
        assert!(backend.get("/registry/keep").is_ok());
    }
}
