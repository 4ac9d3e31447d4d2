//! In-memory backend for tests and ephemeral nodes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::error::StorageError;

use super::{KvBackend, KvEvent, KvOp, Subscription};

/// Default capacity of the event fan-out channel.
const EVENT_CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// A volatile ordered map backend.
///
/// Expiry is lazy: expired entries are filtered on read and iteration.
pub struct MemoryBackend {
    entries: RwLock<BTreeMap<String, StoredValue>>,
    events: broadcast::Sender<KvEvent>,
    closed: AtomicBool,
}

impl MemoryBackend {
    /// Creates an empty in-memory backend.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            entries: RwLock::new(BTreeMap::new()),
            events,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    fn emit(&self, key: &str, op: KvOp, value: &str) {
        // Nobody listening is fine; the channel drops the event.
        let _ = self.events.send(KvEvent {
            key: key.to_string(),
            op,
            value: value.to_string(),
        });
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl KvBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<String, StorageError> {
        self.ensure_open()?;
        let entries = self.entries.read();
        match entries.get(key) {
            Some(stored) if !stored.is_expired(Instant::now()) => Ok(stored.value.clone()),
            _ => Err(StorageError::KeyNotFound {
                key: key.to_string(),
            }),
        }
    }

    fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError> {
        self.ensure_open()?;
        let expires_at = (!ttl.is_zero()).then(|| Instant::now() + ttl);
        self.entries.write().insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at,
            },
        );
        self.emit(key, KvOp::Put, value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.ensure_open()?;
        if self.entries.write().remove(key).is_some() {
            self.emit(key, KvOp::Delete, "");
        }
        Ok(())
    }

    fn delete_prefix(&self, prefix: &str) -> Result<(), StorageError> {
        self.ensure_open()?;
        let removed: Vec<String> = {
            let mut entries = self.entries.write();
            let keys: Vec<String> = entries
                .range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, _)| k.clone())
                .collect();
            for key in &keys {
                entries.remove(key);
            }
            keys
        };
        for key in removed {
            self.emit(&key, KvOp::Delete, "");
        }
        Ok(())
    }

    fn iter_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StorageError> {
        self.ensure_open()?;
        let now = Instant::now();
        let entries = self.entries.read();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, v)| !v.is_expired(now))
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect())
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
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_put_get_delete() {
        let backend = MemoryBackend::new();
        backend
            .put("/registry/foo", "bar", Duration::ZERO)
            .expect("put");
        assert_eq!(backend.get("/registry/foo").expect("get"), "bar");

        backend.delete("/registry/foo").expect("delete");
        assert!(matches!(
            backend.get("/registry/foo"),
            Err(StorageError::KeyNotFound { .. })
        ));
    }

    #[test]
    fn test_delete_absent_key_is_ok() {
        let backend = MemoryBackend::new();
        backend.delete("/registry/missing").expect("delete");
    }

    #[test]
    fn test_iter_prefix_ordered() {
        let backend = MemoryBackend::new();
        for key in ["/registry/c", "/registry/a", "/registry/b", "/other/z"] {
            backend.put(key, "v", Duration::ZERO).expect("put");
        }
        let pairs = backend.iter_prefix("/registry/").expect("iter");
        let keys: Vec<&str> = pairs.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["/registry/a", "/registry/b", "/registry/c"]);
    }

    #[test]
    fn test_ttl_expiry() {
        let backend = MemoryBackend::new();
        backend
            .put("/registry/tmp", "v", Duration::from_nanos(1))
            .expect("put");
        std::thread::sleep(Duration::from_millis(5));
        assert!(backend.get("/registry/tmp").is_err());
        assert!(backend.iter_prefix("/registry/").expect("iter").is_empty());
    }

    #[test]
    fn test_zero_ttl_means_no_expiry() {
        let backend = MemoryBackend::new();
        backend
            .put("/registry/keep", "v", Duration::ZERO)
            .expect("put");
        assert_eq!(backend.get("/registry/keep").expect("get"), "v");
    }

    #[test]
    fn test_delete_prefix() {
        let backend = MemoryBackend::new();
        for key in ["/registry/nodes/a", "/registry/nodes/b", "/registry/other"] {
            backend.put(key, "v", Duration::ZERO).expect("put");
        }
        backend.delete_prefix("/registry/nodes/").expect("delete");
        assert!(backend
            .iter_prefix("/registry/nodes/")
            .expect("iter")
            .is_empty());
        assert!(backend.get("/registry/other").is_ok());
    }

    #[test]
    fn test_closed_backend_rejects_operations() {
        let backend = MemoryBackend::new();
        backend.close().expect("close");
        assert!(matches!(
            backend.put("/registry/x", "v", Duration::ZERO),
            Err(StorageError::Closed)
        ));
        assert!(matches!(
            backend.get("/registry/x"),
            Err(StorageError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_subscription_receives_prefixed_events() {
        let backend = MemoryBackend::new();
        let mut sub = backend.subscribe("/registry/nodes/");

        backend
            .put("/registry/other", "v", Duration::ZERO)
            .expect("put");
        backend
            .put("/registry/nodes/n1", "v1", Duration::ZERO)
            .expect("put");

        let event = sub.recv().await.expect("event");
        assert_eq!(event.key, "/registry/nodes/n1");
        assert_eq!(event.op, KvOp::Put);
        assert_eq!(event.value, "v1");
    }

    proptest! {
        /// Iteration always yields strictly ascending keys regardless of
        /// insertion order.
        #[test]
        fn prop_iteration_sorted(keys in proptest::collection::vec("[a-z]{1,8}", 1..32)) {
            let backend = MemoryBackend::new();
            for key in &keys {
                backend
                    .put(&format!("/registry/{key}"), "v", Duration::ZERO)
                    .unwrap();
            }
            let pairs = backend.iter_prefix("/registry/").unwrap();
            for window in pairs.windows(2) {
                prop_assert!(window[0].0 < window[1].0);
            }
        }
    }
}
