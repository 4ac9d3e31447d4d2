//! Key/value backend trait and implementations.

mod disk;
mod memory;

use std::time::Duration;

use tokio::sync::broadcast;

use crate::error::StorageError;

pub use disk::DiskBackend;
pub use memory::MemoryBackend;

/// The kind of mutation a subscription event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvOp {
    /// A key was written.
    Put,
    /// A key was removed.
    Delete,
}

/// A change notification emitted by a backend.
#[derive(Debug, Clone)]
pub struct KvEvent {
    /// The affected key.
    pub key: String,
    /// The mutation kind.
    pub op: KvOp,
    /// The new value; empty for deletes.
    pub value: String,
}

/// A prefix-filtered view of a backend's event stream.
///
/// The underlying channel is bounded; when a subscriber falls behind,
/// intermediate events are dropped and the subscriber should re-read
/// state rather than assume a complete history.
pub struct Subscription {
    prefix: String,
    rx: broadcast::Receiver<KvEvent>,
}

impl Subscription {
    pub(crate) fn new(prefix: String, rx: broadcast::Receiver<KvEvent>) -> Self {
        Self { prefix, rx }
    }

    /// Waits for the next event under the subscribed prefix.
    ///
    /// Returns `None` once the backend is closed. Lagged gaps are skipped
    /// silently.
    pub async fn recv(&mut self) -> Option<KvEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.key.starts_with(&self.prefix) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// An ordered key/value store with prefix iteration, per-key TTL and
/// change subscriptions.
///
/// Iteration is in ascending lexicographic key order and observes a
/// consistent snapshot of the backend taken when the iteration begins.
/// A TTL of zero means no expiry. Writes are atomic per key.
pub trait KvBackend: Send + Sync + 'static {
    /// Returns the value stored at `key`.
    fn get(&self, key: &str) -> Result<String, StorageError>;

    /// Stores `value` at `key` with the given time-to-live.
    fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError>;

    /// Removes `key`. Removing an absent key is not an error.
    fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Removes every key under `prefix`.
    fn delete_prefix(&self, prefix: &str) -> Result<(), StorageError>;

    /// Returns all live `(key, value)` pairs under `prefix` in ascending
    /// key order, from a consistent snapshot.
    fn iter_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StorageError>;

    /// Subscribes to changes under `prefix`.
    fn subscribe(&self, prefix: &str) -> Subscription;

    /// Closes the backend. Subsequent operations fail with
    /// [`StorageError::Closed`].
    fn close(&self) -> Result<(), StorageError>;
}
