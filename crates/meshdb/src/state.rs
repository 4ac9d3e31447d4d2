//! Bootstrap-time mesh state.
//!
//! The mesh prefixes and domain are written once when the cluster
//! bootstraps and are read-only afterwards.

use std::sync::Arc;
use std::time::Duration;

use ipnet::{Ipv4Net, Ipv6Net};
use webmesh_storage::{MeshStorage, StorageError};

use crate::error::MeshDbError;

/// Key prefix for mesh state fields.
pub const MESH_STATE_PREFIX: &str = "/registry/mesh-state";

const IPV4_PREFIX_KEY: &str = "ipv4-prefix";
const IPV6_PREFIX_KEY: &str = "ipv6-prefix";
const MESH_DOMAIN_KEY: &str = "mesh-domain";

/// The mesh state collection.
pub struct MeshState {
    storage: Arc<dyn MeshStorage>,
}

impl MeshState {
    pub(crate) fn new(storage: Arc<dyn MeshStorage>) -> Self {
        Self { storage }
    }

    async fn set_once(&self, field: &str, value: &str) -> Result<(), MeshDbError> {
        let key = format!("{MESH_STATE_PREFIX}/{field}");
        match self.storage.get_value(&key).await {
            Ok(existing) if existing == value => return Ok(()),
            Ok(_) => {
                return Err(MeshDbError::StateAlreadySet {
                    field: field.to_string(),
                })
            }
            Err(StorageError::KeyNotFound { .. }) => {}
            Err(e) => return Err(MeshDbError::storage(format!("get mesh state {field}"), e)),
        }
        self.storage
            .put_value(&key, value, Duration::ZERO)
            .await
            .map_err(|e| MeshDbError::storage(format!("set mesh state {field}"), e))
    }

    async fn get(&self, field: &str) -> Result<String, MeshDbError> {
        self.storage
            .get_value(&format!("{MESH_STATE_PREFIX}/{field}"))
            .await
            .map_err(|e| MeshDbError::storage(format!("get mesh state {field}"), e))
    }

    /// Records the mesh IPv4 prefix at bootstrap.
    pub async fn set_ipv4_prefix(&self, prefix: Ipv4Net) -> Result<(), MeshDbError> {
        self.set_once(IPV4_PREFIX_KEY, &prefix.to_string()).await
    }

    /// The mesh IPv4 prefix.
    pub async fn get_ipv4_prefix(&self) -> Result<Ipv4Net, MeshDbError> {
        let raw = self.get(IPV4_PREFIX_KEY).await?;
        raw.parse().map_err(|_| MeshDbError::InvalidEntity {
            message: format!("stored ipv4 prefix {raw} is malformed"),
        })
    }

    /// Records the mesh IPv6 prefix at bootstrap.
    pub async fn set_ipv6_prefix(&self, prefix: Ipv6Net) -> Result<(), MeshDbError> {
        self.set_once(IPV6_PREFIX_KEY, &prefix.to_string()).await
    }

    /// The mesh IPv6 prefix.
    pub async fn get_ipv6_prefix(&self) -> Result<Ipv6Net, MeshDbError> {
        let raw = self.get(IPV6_PREFIX_KEY).await?;
        raw.parse().map_err(|_| MeshDbError::InvalidEntity {
            message: format!("stored ipv6 prefix {raw} is malformed"),
        })
    }

    /// Records the mesh domain at bootstrap.
    pub async fn set_mesh_domain(&self, domain: &str) -> Result<(), MeshDbError> {
        self.set_once(MESH_DOMAIN_KEY, domain).await
    }

    /// The mesh DNS domain.
    pub async fn get_mesh_domain(&self) -> Result<String, MeshDbError> {
        self.get(MESH_DOMAIN_KEY).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use webmesh_storage::MemoryBackend;

    use super::*;

    fn state() -> MeshState {
        MeshState::new(Arc::new(MemoryBackend::new()))
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let state = state();
        state
            .set_ipv4_prefix("172.16.0.0/12".parse().unwrap())
            .await
            .expect("set");
        state.set_mesh_domain("webmesh.internal").await.expect("set");

        assert_eq!(
            state.get_ipv4_prefix().await.expect("get").to_string(),
            "172.16.0.0/12"
        );
        assert_eq!(
            state.get_mesh_domain().await.expect("get"),
            "webmesh.internal"
        );
    }

    #[tokio::test]
    async fn test_set_once_is_idempotent_for_same_value() {
        let state = state();
        state.set_mesh_domain("webmesh.internal").await.expect("set");
        state
            .set_mesh_domain("webmesh.internal")
            .await
            .expect("same value is a no-op");
    }

    #[tokio::test]
    async fn test_set_once_rejects_different_value() {
        let state = state();
        state.set_mesh_domain("webmesh.internal").await.expect("set");
        assert!(matches!(
            state.set_mesh_domain("other.example").await,
            Err(MeshDbError::StateAlreadySet { .. })
        ));
    }
}
