//! IPAM leases.
//!
//! One lease per node under `/registry/leases/<node-id>`, mirroring the
//! peer's `private_ipv4` allocation.

use std::sync::Arc;
use std::time::Duration;

use webmesh_storage::{MeshStorage, StorageError};
use webmesh_types::{codec, Lease};

use crate::error::MeshDbError;

/// Key prefix for leases.
pub const LEASES_PREFIX: &str = "/registry/leases";

fn lease_key(node_id: &str) -> String {
    format!("{LEASES_PREFIX}/{node_id}")
}

/// The leases collection.
pub struct Leases {
    storage: Arc<dyn MeshStorage>,
}

impl Leases {
    pub(crate) fn new(storage: Arc<dyn MeshStorage>) -> Self {
        Self { storage }
    }

    /// Creates or updates a node's lease.
    pub async fn put(&self, lease: &Lease) -> Result<(), MeshDbError> {
        if lease.node_id.is_empty() {
            return Err(MeshDbError::InvalidEntity {
                message: "lease node id must not be empty".to_string(),
            });
        }
        let doc = codec::encode(lease)
            .map_err(|e| MeshDbError::codec(format!("marshal lease {}", lease.node_id), e))?;
        self.storage
            .put_value(&lease_key(&lease.node_id), &doc, Duration::ZERO)
            .await
            .map_err(|e| MeshDbError::storage(format!("put lease {}", lease.node_id), e))
    }

    /// Returns a node's lease, if present.
    pub async fn get(&self, node_id: &str) -> Result<Option<Lease>, MeshDbError> {
        let doc = match self.storage.get_value(&lease_key(node_id)).await {
            Ok(doc) => doc,
            Err(StorageError::KeyNotFound { .. }) => return Ok(None),
            Err(e) => return Err(MeshDbError::storage(format!("get lease {node_id}"), e)),
        };
        codec::decode(&doc)
            .map(Some)
            .map_err(|e| MeshDbError::codec(format!("unmarshal lease {node_id}"), e))
    }

    /// Deletes a node's lease.
    pub async fn delete(&self, node_id: &str) -> Result<(), MeshDbError> {
        self.storage
            .delete(&lease_key(node_id))
            .await
            .map_err(|e| MeshDbError::storage(format!("delete lease {node_id}"), e))
    }

    /// Lists all leases in node-id order.
    pub async fn list(&self) -> Result<Vec<Lease>, MeshDbError> {
        let pairs = self
            .storage
            .iter_prefix(&format!("{LEASES_PREFIX}/"))
            .await
            .map_err(|e| MeshDbError::storage("list leases", e))?;
        pairs
            .iter()
            .map(|(key, doc)| {
                codec::decode(doc).map_err(|e| MeshDbError::codec(format!("unmarshal {key}"), e))
            })
            .collect()
    }
}
