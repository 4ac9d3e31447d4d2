//! Consensus-backed mesh storage.
//!
//! [`ConsensusStorage`] is the production [`MeshStorage`]: reads hit the
//! local backend (possibly one round-trip stale on non-leaders), writes
//! become raft proposals. A non-leader either rejects writes with
//! `NotLeader` or, when the leader proxy is enabled, forwards them to
//! the current leader over the storage proxy service.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tonic::transport::Endpoint;
use tracing::debug;

use webmesh_proto::proto::storage_proxy_service_client::StorageProxyServiceClient;
use webmesh_proto::proto::{DeleteKeyRequest, PublishRequest};
use webmesh_storage::{check_writable, MeshStorage, StorageError, Subscription};

use crate::node::MeshRaft;
use crate::types::MeshRequest;

/// Read-anywhere/write-through-leader storage over a [`MeshRaft`] node.
pub struct ConsensusStorage {
    raft: Arc<MeshRaft>,
    leader_proxy: bool,
}

impl ConsensusStorage {
    /// Creates the facade. With `leader_proxy` set, writes on
    /// non-leaders are transparently forwarded to the leader.
    pub fn new(raft: Arc<MeshRaft>, leader_proxy: bool) -> Self {
        Self { raft, leader_proxy }
    }

    /// The raft node this facade proposes through.
    pub fn raft(&self) -> &Arc<MeshRaft> {
        &self.raft
    }

    async fn propose(&self, request: MeshRequest) -> Result<(), StorageError> {
        if self.raft.is_leader() {
            return self.raft.apply(request).await.map_err(Into::into);
        }

        let Some((_, leader_addr)) = self.raft.current_leader() else {
            return Err(StorageError::NoLeader);
        };
        if !self.leader_proxy {
            return Err(StorageError::NotLeader {
                leader: Some(leader_addr),
            });
        }

        debug!(leader = %leader_addr, key = request.target(), "forwarding write to leader");
        self.forward(&leader_addr, request).await
    }

    async fn forward(&self, leader_addr: &str, request: MeshRequest) -> Result<(), StorageError> {
        let endpoint = Endpoint::from_shared(format!("http://{leader_addr}"))
            .map_err(StorageError::io)?
            .connect_timeout(self.raft.config().connection_timeout);
        let channel = endpoint.connect().await.map_err(StorageError::io)?;
        let mut client = StorageProxyServiceClient::new(channel);

        let result = match request {
            MeshRequest::Put {
                key,
                value,
                ttl_seconds,
            } => client
                .publish(PublishRequest {
                    key,
                    value,
                    ttl_seconds,
                })
                .await
                .map(|_| ()),
            MeshRequest::Delete { key } => {
                client.delete_key(DeleteKeyRequest { key }).await.map(|_| ())
            }
            MeshRequest::DeletePrefix { prefix } => {
                // The proxy surface carries single-key operations; prefix
                // deletes only originate on the leader.
                return Err(StorageError::InvalidArgument {
                    message: format!("cannot forward prefix delete for {prefix}"),
                });
            }
        };

        result.map_err(|status| match status.code() {
            tonic::Code::FailedPrecondition => StorageError::NotLeader { leader: None },
            tonic::Code::Unavailable => StorageError::NoLeader,
            tonic::Code::DeadlineExceeded => StorageError::ApplyTimeout {
                timeout: self.raft.config().apply_timeout,
            },
            _ => StorageError::Io {
                message: status.message().to_string(),
            },
        })
    }
}

#[async_trait]
impl MeshStorage for ConsensusStorage {
    async fn get_value(&self, key: &str) -> Result<String, StorageError> {
        self.raft.backend().get(key)
    }

    async fn put_value(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError> {
        check_writable(key)?;
        self.propose(MeshRequest::Put {
            key: key.to_string(),
            value: value.to_string(),
            ttl_seconds: ttl.as_secs(),
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        check_writable(key)?;
        self.propose(MeshRequest::Delete {
            key: key.to_string(),
        })
        .await
    }

    async fn iter_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StorageError> {
        self.raft.backend().iter_prefix(prefix)
    }

    fn subscribe(&self, prefix: &str) -> Subscription {
        self.raft.backend().subscribe(prefix)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::collections::BTreeMap;

    use webmesh_storage::{KvBackend, MemoryBackend};
    use webmesh_types::RaftConfig;

    use super::*;

    async fn leader_storage() -> (ConsensusStorage, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let config = RaftConfig {
            in_memory: true,
            heartbeat_timeout: Duration::from_millis(1000),
            election_timeout: Duration::from_millis(1500),
            ..Default::default()
        };
        let raft = MeshRaft::new("n1", config, backend.clone())
            .await
            .expect("start");
        let servers = BTreeMap::from([("n1".to_string(), "127.0.0.1:0".to_string())]);
        raft.bootstrap(&servers).await.expect("bootstrap");
        (ConsensusStorage::new(raft, false), backend)
    }

    #[tokio::test]
    async fn test_leader_write_and_read() {
        let (storage, backend) = leader_storage().await;
        storage
            .put_value("/registry/foo", "bar", Duration::ZERO)
            .await
            .expect("put");
        assert_eq!(
            storage.get_value("/registry/foo").await.expect("get"),
            "bar"
        );
        assert_eq!(backend.get("/registry/foo").expect("backend"), "bar");
    }

    #[tokio::test]
    async fn test_reserved_prefix_guard_blocks_before_log() {
        let (storage, _backend) = leader_storage().await;
        let err = storage
            .put_value("/raft/anything", "v", Duration::ZERO)
            .await
            .expect_err("reserved prefix");
        assert!(matches!(err, StorageError::ReservedPrefix { .. }));

        // Nothing reached the registry.
        assert!(storage
            .iter_prefix("/raft")
            .await
            .expect("iter")
            .is_empty());
    }

    #[tokio::test]
    async fn test_delete_roundtrip() {
        let (storage, _) = leader_storage().await;
        storage
            .put_value("/registry/foo", "bar", Duration::ZERO)
            .await
            .expect("put");
        storage.delete("/registry/foo").await.expect("delete");
        assert!(storage.get_value("/registry/foo").await.is_err());
    }
}
