//! Raft network transport using gRPC.
//!
//! Implements the `RaftNetwork` trait for OpenRaft, carrying vote
//! requests, log replication, and snapshot streams between nodes over
//! tonic channels that are created on demand and cached per peer.

use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use openraft::{
    error::{Fatal, RPCError, RaftError, ReplicationClosed, StreamingError, Unreachable},
    network::{RPCOption, RaftNetwork, RaftNetworkFactory},
    raft::{
        AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
        InstallSnapshotResponse, SnapshotResponse, VoteRequest, VoteResponse,
    },
    BasicNode, Snapshot, Vote,
};
use parking_lot::RwLock;
use tonic::transport::{Channel, Endpoint};
use webmesh_proto::proto::{
    raft_service_client::RaftServiceClient, RaftAppendEntriesRequest, RaftInstallSnapshotRequest,
    RaftLogId, RaftMembership, RaftMembershipConfig, RaftSnapshotMeta, RaftVote,
    RaftVoteRequest,
};
use webmesh_types::RaftNodeId;

use crate::types::MeshTypeConfig;

/// Error type for network operations.
#[derive(Debug, Clone)]
pub struct NetworkError(String);

impl std::fmt::Display for NetworkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NetworkError: {}", self.0)
    }
}

impl std::error::Error for NetworkError {}

pub(crate) fn vote_to_proto(vote: &Vote<RaftNodeId>) -> RaftVote {
    RaftVote {
        term: vote.leader_id.term,
        node_id: vote.leader_id.node_id,
        committed: vote.committed,
    }
}

pub(crate) fn vote_from_proto(vote: &RaftVote) -> Vote<RaftNodeId> {
    if vote.committed {
        Vote::new_committed(vote.term, vote.node_id)
    } else {
        Vote::new(vote.term, vote.node_id)
    }
}

fn log_id_to_proto(id: &openraft::LogId<RaftNodeId>) -> RaftLogId {
    RaftLogId {
        term: id.leader_id.term,
        index: id.index,
    }
}

/// gRPC-based raft network.
///
/// Maintains a pool of clients to peer nodes, creating connections on
/// demand and caching them for reuse.
#[derive(Clone)]
pub struct GrpcRaftNetwork {
    clients: Arc<RwLock<HashMap<RaftNodeId, RaftServiceClient<Channel>>>>,
    connect_timeout: Duration,
}

impl GrpcRaftNetwork {
    /// Creates a new network with the given connection timeout.
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            clients: Arc::new(RwLock::new(HashMap::new())),
            connect_timeout,
        }
    }

    async fn get_client(
        &self,
        target: RaftNodeId,
        node: &BasicNode,
    ) -> Result<RaftServiceClient<Channel>, NetworkError> {
        if let Some(client) = self.clients.read().get(&target).cloned() {
            return Ok(client);
        }

        let endpoint = Endpoint::from_shared(format!("http://{}", node.addr))
            .map_err(|e| NetworkError(format!("invalid endpoint: {e}")))?
            .connect_timeout(self.connect_timeout);
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| NetworkError(format!("connection failed: {e}")))?;

        let client = RaftServiceClient::new(channel);
        self.clients.write().insert(target, client.clone());
        Ok(client)
    }

    /// Drops the cached client for a peer, forcing a reconnect.
    pub fn evict(&self, target: RaftNodeId) {
        self.clients.write().remove(&target);
    }
}

/// Factory handing out per-peer network connections.
pub struct GrpcRaftNetworkFactory {
    network: GrpcRaftNetwork,
}

impl GrpcRaftNetworkFactory {
    /// Creates a new factory with the given connection timeout.
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            network: GrpcRaftNetwork::new(connect_timeout),
        }
    }
}

impl RaftNetworkFactory<MeshTypeConfig> for GrpcRaftNetworkFactory {
    type Network = GrpcRaftNetworkConnection;

    async fn new_client(&mut self, target: RaftNodeId, node: &BasicNode) -> Self::Network {
        GrpcRaftNetworkConnection {
            target,
            node: node.clone(),
            network: self.network.clone(),
        }
    }
}

/// A connection to a specific raft peer.
pub struct GrpcRaftNetworkConnection {
    target: RaftNodeId,
    node: BasicNode,
    network: GrpcRaftNetwork,
}

impl RaftNetwork<MeshTypeConfig> for GrpcRaftNetworkConnection {
    async fn vote(
        &mut self,
        rpc: VoteRequest<RaftNodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<RaftNodeId>, RPCError<RaftNodeId, BasicNode, RaftError<RaftNodeId>>>
    {
        let mut client = self
            .network
            .get_client(self.target, &self.node)
            .await
            .map_err(|e| RPCError::Unreachable(Unreachable::new(&e)))?;

        let request = RaftVoteRequest {
            vote: Some(vote_to_proto(&rpc.vote)),
            last_log_id: rpc.last_log_id.as_ref().map(log_id_to_proto),
        };

        let response = client
            .vote(request)
            .await
            .map_err(|e| RPCError::Unreachable(Unreachable::new(&NetworkError(e.to_string()))))?
            .into_inner();

        let vote = response.vote.ok_or_else(|| {
            RPCError::Unreachable(Unreachable::new(&NetworkError(
                "missing vote in response".to_string(),
            )))
        })?;

        Ok(VoteResponse {
            vote: vote_from_proto(&vote),
            vote_granted: response.vote_granted,
            last_log_id: response.last_log_id.map(|id| {
                openraft::LogId::new(
                    openraft::CommittedLeaderId::new(id.term, vote.node_id),
                    id.index,
                )
            }),
        })
    }

    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<MeshTypeConfig>,
        _option: RPCOption,
    ) -> Result<
        AppendEntriesResponse<RaftNodeId>,
        RPCError<RaftNodeId, BasicNode, RaftError<RaftNodeId>>,
    > {
        let mut client = self
            .network
            .get_client(self.target, &self.node)
            .await
            .map_err(|e| RPCError::Unreachable(Unreachable::new(&e)))?;

        let entries: Result<Vec<Vec<u8>>, _> =
            rpc.entries.iter().map(bincode::serialize).collect();
        let entries = entries
            .map_err(|e| RPCError::Unreachable(Unreachable::new(&NetworkError(e.to_string()))))?;

        let request = RaftAppendEntriesRequest {
            vote: Some(vote_to_proto(&rpc.vote)),
            prev_log_id: rpc.prev_log_id.as_ref().map(log_id_to_proto),
            entries,
            leader_commit: rpc.leader_commit.as_ref().map(log_id_to_proto),
        };

        let response = client
            .append_entries(request)
            .await
            .map_err(|e| RPCError::Unreachable(Unreachable::new(&NetworkError(e.to_string()))))?
            .into_inner();

        if response.success {
            Ok(AppendEntriesResponse::Success)
        } else if let Some(vote) = response.vote {
            Ok(AppendEntriesResponse::HigherVote(vote_from_proto(&vote)))
        } else {
            Ok(AppendEntriesResponse::Conflict)
        }
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<MeshTypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<RaftNodeId>,
        RPCError<
            RaftNodeId,
            BasicNode,
            RaftError<RaftNodeId, openraft::error::InstallSnapshotError>,
        >,
    > {
        let mut client = self
            .network
            .get_client(self.target, &self.node)
            .await
            .map_err(|e| RPCError::Unreachable(Unreachable::new(&e)))?;

        let members: HashMap<u64, String> = rpc
            .meta
            .last_membership
            .nodes()
            .map(|(id, node)| (*id, node.addr.clone()))
            .collect();

        let request = RaftInstallSnapshotRequest {
            vote: Some(vote_to_proto(&rpc.vote)),
            meta: Some(RaftSnapshotMeta {
                last_log_id: rpc.meta.last_log_id.as_ref().map(log_id_to_proto),
                last_membership: Some(RaftMembership {
                    configs: vec![RaftMembershipConfig { members }],
                }),
                snapshot_id: rpc.meta.snapshot_id.clone(),
            }),
            offset: rpc.offset,
            data: rpc.data.clone(),
            done: rpc.done,
        };

        let response = client
            .install_snapshot(request)
            .await
            .map_err(|e| RPCError::Unreachable(Unreachable::new(&NetworkError(e.to_string()))))?
            .into_inner();

        let vote = response.vote.ok_or_else(|| {
            RPCError::Unreachable(Unreachable::new(&NetworkError(
                "missing vote in response".to_string(),
            )))
        })?;

        Ok(InstallSnapshotResponse {
            vote: vote_from_proto(&vote),
        })
    }

    async fn full_snapshot(
        &mut self,
        vote: Vote<RaftNodeId>,
        snapshot: Snapshot<MeshTypeConfig>,
        cancel: impl Future<Output = ReplicationClosed> + Send + 'static,
        option: RPCOption,
    ) -> Result<SnapshotResponse<RaftNodeId>, StreamingError<MeshTypeConfig, Fatal<RaftNodeId>>>
    {
        use openraft::network::snapshot_transport::{Chunked, SnapshotTransport};

        Chunked::send_snapshot(self, vote, snapshot, cancel, option).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vote_proto_roundtrip() {
        for vote in [Vote::new(3, 17), Vote::new_committed(5, 99)] {
            let wire = vote_to_proto(&vote);
            assert_eq!(vote_from_proto(&wire), vote);
        }
    }

    #[test]
    fn test_log_id_to_proto() {
        let id = openraft::LogId::new(openraft::CommittedLeaderId::new(2, 7), 40);
        let wire = log_id_to_proto(&id);
        assert_eq!(wire.term, 2);
        assert_eq!(wire.index, 40);
    }
}
