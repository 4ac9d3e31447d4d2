//! Raft service implementation for inter-node communication.
//!
//! Handles incoming raft RPCs from peer nodes: vote requests during
//! elections, AppendEntries for replication and heartbeats, and
//! InstallSnapshot for follower catch-up.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use openraft::raft::AppendEntriesRequest;
use openraft::BasicNode;
use tonic::{Request, Response, Status};

use webmesh_proto::proto::raft_service_server::RaftService;
use webmesh_proto::proto::{
    RaftAppendEntriesRequest, RaftAppendEntriesResponse, RaftInstallSnapshotRequest,
    RaftInstallSnapshotResponse, RaftLogId, RaftVoteRequest, RaftVoteResponse,
};

use crate::node::MeshRaft;
use crate::raft_network::{vote_from_proto, vote_to_proto};
use crate::types::MeshTypeConfig;

/// Server side of the raft transport.
pub struct RaftServiceImpl {
    raft: Arc<MeshRaft>,
}

impl RaftServiceImpl {
    /// Creates the service over a running node.
    pub fn new(raft: Arc<MeshRaft>) -> Self {
        Self { raft }
    }
}

#[tonic::async_trait]
impl RaftService for RaftServiceImpl {
    async fn vote(
        &self,
        request: Request<RaftVoteRequest>,
    ) -> Result<Response<RaftVoteResponse>, Status> {
        let req = request.into_inner();
        let vote = req
            .vote
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("missing vote field"))?;

        let last_log_id = req.last_log_id.map(|id| {
            openraft::LogId::new(
                openraft::CommittedLeaderId::new(id.term, vote.node_id),
                id.index,
            )
        });

        let response = self
            .raft
            .raft()
            .vote(openraft::raft::VoteRequest {
                vote: vote_from_proto(vote),
                last_log_id,
            })
            .await
            .map_err(|e| Status::internal(format!("vote failed: {e}")))?;

        Ok(Response::new(RaftVoteResponse {
            vote: Some(vote_to_proto(&response.vote)),
            vote_granted: response.vote_granted,
            last_log_id: response.last_log_id.map(|id| RaftLogId {
                term: id.leader_id.term,
                index: id.index,
            }),
        }))
    }

    async fn append_entries(
        &self,
        request: Request<RaftAppendEntriesRequest>,
    ) -> Result<Response<RaftAppendEntriesResponse>, Status> {
        let req = request.into_inner();
        let vote = req
            .vote
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("missing vote field"))?;
        let leader_node_id = vote.node_id;

        let entries = req
            .entries
            .iter()
            .map(|bytes| {
                bincode::deserialize(bytes)
                    .map_err(|e| Status::invalid_argument(format!("malformed entry: {e}")))
            })
            .collect::<Result<Vec<_>, Status>>()?;

        let to_log_id = |id: RaftLogId| {
            openraft::LogId::new(
                openraft::CommittedLeaderId::new(id.term, leader_node_id),
                id.index,
            )
        };

        let append_request: AppendEntriesRequest<MeshTypeConfig> = AppendEntriesRequest {
            vote: vote_from_proto(vote),
            prev_log_id: req.prev_log_id.map(to_log_id),
            entries,
            leader_commit: req.leader_commit.map(to_log_id),
        };

        let response = self
            .raft
            .raft()
            .append_entries(append_request)
            .await
            .map_err(|e| Status::internal(format!("append entries failed: {e}")))?;

        use openraft::raft::AppendEntriesResponse::*;
        let (success, conflict, higher_vote) = match response {
            Success => (true, false, None),
            PartialSuccess(_) => (true, false, None),
            Conflict => (false, true, None),
            HigherVote(v) => (false, false, Some(vote_to_proto(&v))),
        };

        Ok(Response::new(RaftAppendEntriesResponse {
            success,
            conflict,
            vote: higher_vote,
        }))
    }

    async fn install_snapshot(
        &self,
        request: Request<RaftInstallSnapshotRequest>,
    ) -> Result<Response<RaftInstallSnapshotResponse>, Status> {
        let req = request.into_inner();
        let vote = req
            .vote
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("missing vote field"))?;
        let meta = req
            .meta
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("missing meta field"))?;

        let leader_node_id = vote.node_id;
        let last_log_id = meta.last_log_id.as_ref().map(|id| {
            openraft::LogId::new(
                openraft::CommittedLeaderId::new(id.term, leader_node_id),
                id.index,
            )
        });

        let membership_proto = meta
            .last_membership
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("missing last_membership"))?;

        let mut all_nodes: BTreeMap<u64, BasicNode> = BTreeMap::new();
        for config in &membership_proto.configs {
            for (node_id, addr) in &config.members {
                all_nodes.insert(*node_id, BasicNode { addr: addr.clone() });
            }
        }
        let voter_ids: BTreeSet<u64> = all_nodes.keys().copied().collect();
        let membership = openraft::Membership::new(vec![voter_ids], all_nodes);

        let snapshot_meta = openraft::SnapshotMeta {
            last_log_id,
            last_membership: openraft::StoredMembership::new(last_log_id, membership),
            snapshot_id: meta.snapshot_id.clone(),
        };

        let response = self
            .raft
            .raft()
            .install_snapshot(openraft::raft::InstallSnapshotRequest {
                vote: vote_from_proto(vote),
                meta: snapshot_meta,
                offset: req.offset,
                data: req.data,
                done: req.done,
            })
            .await
            .map_err(|e| Status::internal(format!("install snapshot failed: {e}")))?;

        Ok(Response::new(RaftInstallSnapshotResponse {
            vote: Some(vote_to_proto(&response.vote)),
        }))
    }
}
