//! The mesh storage facade.
//!
//! [`MeshStorage`] is the uniform API every component above the backend
//! uses: reads go to the local backend, writes are routed through
//! consensus by the implementation. The consensus-backed implementation
//! lives in the raft crate; [`MemoryBackend`] implements the trait
//! directly for unit tests and single-process tooling.

use std::time::Duration;

use async_trait::async_trait;

use crate::backend::{KvBackend, MemoryBackend, Subscription};
use crate::error::StorageError;
use crate::prefixes::Prefix;

/// Uniform read/write API over the replicated registry.
///
/// Reads observe the local backend and may trail the leader by one
/// round-trip on non-leaders. Writes are durable once they return.
/// Writes under `/raft/` are rejected with
/// [`StorageError::ReservedPrefix`] before reaching the log.
#[async_trait]
pub trait MeshStorage: Send + Sync + 'static {
    /// Returns the value at `key`.
    async fn get_value(&self, key: &str) -> Result<String, StorageError>;

    /// Writes `value` at `key` with the given TTL (zero = no expiry).
    async fn put_value(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError>;

    /// Deletes `key`.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Returns all `(key, value)` pairs under `prefix` in ascending key
    /// order.
    async fn iter_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StorageError>;

    /// Subscribes to changes under `prefix`.
    fn subscribe(&self, prefix: &str) -> Subscription;
}

/// Rejects user writes under the consensus prefix.
pub fn check_writable(key: &str) -> Result<(), StorageError> {
    if Prefix::CONSENSUS.contains(key) {
        return Err(StorageError::ReservedPrefix {
            key: key.to_string(),
        });
    }
    Ok(())
}

#[async_trait]
impl MeshStorage for MemoryBackend {
    async fn get_value(&self, key: &str) -> Result<String, StorageError> {
        self.get(key)
    }

    async fn put_value(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError> {
        check_writable(key)?;
        self.put(key, value, ttl)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        check_writable(key)?;
        KvBackend::delete(self, key)
    }

    async fn iter_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StorageError> {
        KvBackend::iter_prefix(self, prefix)
    }

    fn subscribe(&self, prefix: &str) -> Subscription {
        KvBackend::subscribe(self, prefix)
    }
}
