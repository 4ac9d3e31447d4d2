//! Storage proxy service.
//!
//! Accepts writes forwarded from non-leader nodes and proposes them
//! locally. Only the leader applies; a proxied write landing on another
//! non-leader is answered with `FailedPrecondition` carrying the leader
//! address so the sender can redial.

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::debug;

use webmesh_proto::proto::storage_proxy_service_server::StorageProxyService;
use webmesh_proto::proto::{
    DeleteKeyRequest, DeleteKeyResponse, PublishRequest, PublishResponse,
};
use webmesh_storage::check_writable;

use crate::error::ConsensusError;
use crate::node::MeshRaft;
use crate::types::MeshRequest;

/// Server side of the leader proxy for storage writes.
pub struct StorageProxyServiceImpl {
    raft: Arc<MeshRaft>,
}

impl StorageProxyServiceImpl {
    /// Creates the service over a running node.
    pub fn new(raft: Arc<MeshRaft>) -> Self {
        Self { raft }
    }

    async fn apply(&self, request: MeshRequest) -> Result<(), Status> {
        check_writable(request.target())
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
        self.raft.apply(request).await.map_err(|e| match e {
            ConsensusError::NotLeader { leader } => Status::failed_precondition(format!(
                "not the leader; current leader: {}",
                leader.unwrap_or_else(|| "unknown".to_string())
            )),
            ConsensusError::NoLeader => Status::unavailable("no raft leader elected"),
            ConsensusError::ApplyTimeout { timeout } => {
                Status::deadline_exceeded(format!("apply timed out after {timeout:?}"))
            }
            other => Status::internal(other.to_string()),
        })
    }
}

#[tonic::async_trait]
impl StorageProxyService for StorageProxyServiceImpl {
    async fn publish(
        &self,
        request: Request<PublishRequest>,
    ) -> Result<Response<PublishResponse>, Status> {
        let req = request.into_inner();
        debug!(key = %req.key, "proxied publish");
        self.apply(MeshRequest::Put {
            key: req.key,
            value: req.value,
            ttl_seconds: req.ttl_seconds,
        })
        .await?;
        Ok(Response::new(PublishResponse {}))
    }

    async fn delete_key(
        &self,
        request: Request<DeleteKeyRequest>,
    ) -> Result<Response<DeleteKeyResponse>, Status> {
        let req = request.into_inner();
        debug!(key = %req.key, "proxied delete");
        self.apply(MeshRequest::Delete { key: req.key }).await?;
        Ok(Response::new(DeleteKeyResponse {}))
    }
}
