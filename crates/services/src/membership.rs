//! The mesh membership service.
//!
//! Front door for nodes entering, updating, and leaving the mesh. All
//! state-changing RPCs are leader-only: a non-leader either forwards
//! the call through the leader proxy (carrying the original caller in
//! request metadata) or answers `FailedPrecondition` with the leader
//! address so the client can redial.
//!
//! Join and Leave are idempotent: a repeated Join with identical
//! parameters re-returns the same allocation, and Leave of an unknown
//! node succeeds.

use std::sync::Arc;

use chrono::Utc;
use ipnet::{IpNet, Ipv4Net};
use tonic::transport::Endpoint;
use tonic::{Request, Response, Status};
use tracing::{debug, info, instrument};

use webmesh_meshdb::{node_auto_route, wireguard_peers_for, MeshDb, MeshDbError};
use webmesh_proto::proto::membership_service_client::MembershipServiceClient;
use webmesh_proto::proto::membership_service_server::MembershipService;
use webmesh_proto::proto::{
    ConsensusMember, GetCurrentConsensusRequest, GetCurrentConsensusResponse, JoinRequest,
    JoinResponse, LeaveRequest, LeaveResponse, UpdateRequest, UpdateResponse,
};
use webmesh_raft::{ConsensusError, MeshRaft};
use webmesh_types::{
    raft_node_id, Lease, MeshConfig, MeshEdge, MeshNode, Route, RuleResource, Verb,
};

use crate::context;
use crate::error::ServiceError;
use crate::ipam::{derive_ipv6, Ipam};

/// The membership RPC implementation.
pub struct MembershipServiceImpl {
    raft: Arc<MeshRaft>,
    db: MeshDb,
    ipam: Arc<dyn Ipam>,
    mesh: MeshConfig,
}

impl MembershipServiceImpl {
    /// Creates the service.
    pub fn new(raft: Arc<MeshRaft>, db: MeshDb, ipam: Arc<dyn Ipam>, mesh: MeshConfig) -> Self {
        Self {
            raft,
            db,
            ipam,
            mesh,
        }
    }

    fn not_leader(&self) -> ServiceError {
        ServiceError::NotLeader {
            leader: self.raft.current_leader().map(|(_, addr)| addr),
        }
    }

    async fn leader_client(
        &self,
    ) -> Result<MembershipServiceClient<tonic::transport::Channel>, ServiceError> {
        let Some((_, addr)) = self.raft.current_leader() else {
            return Err(ServiceError::NoLeader);
        };
        let endpoint = Endpoint::from_shared(format!("http://{addr}"))
            .map_err(ServiceError::internal)?
            .connect_timeout(self.raft.config().connection_timeout);
        let channel = endpoint
            .connect()
            .await
            .map_err(ServiceError::internal)?;
        Ok(MembershipServiceClient::new(channel))
    }

    fn proxied_request<T>(caller: Option<&str>, message: T) -> Result<Request<T>, ServiceError> {
        let mut request = Request::new(message);
        if let Some(caller) = caller {
            let value = caller
                .parse()
                .map_err(|_| ServiceError::invalid_arg("caller id is not metadata-safe"))?;
            request
                .metadata_mut()
                .insert(context::PROXIED_FOR_METADATA_KEY, value);
        }
        Ok(request)
    }

    /// Authorizes the caller: the authenticated identity must match the
    /// claimed node id, and RBAC must grant the join.
    async fn authorize_join(
        &self,
        caller: Option<&str>,
        req: &JoinRequest,
    ) -> Result<(), ServiceError> {
        let caller = caller.ok_or_else(|| {
            ServiceError::permission_denied("request carries no authenticated identity")
        })?;
        if caller != req.id {
            return Err(ServiceError::permission_denied(format!(
                "caller {caller} may not join as {}",
                req.id
            )));
        }

        let evaluator = self.db.rbac().evaluator();
        if !evaluator
            .evaluate(caller, Verb::Put, RuleResource::DataChannels, "")
            .await?
        {
            return Err(ServiceError::permission_denied(format!(
                "node {caller} may not join the mesh"
            )));
        }
        if !req.as_observer
            && !evaluator
                .evaluate(caller, Verb::Put, RuleResource::Votes, "")
                .await?
        {
            return Err(ServiceError::permission_denied(format!(
                "node {caller} may not join as a voter"
            )));
        }
        Ok(())
    }

    async fn existing_peer(&self, id: &str) -> Result<Option<MeshNode>, ServiceError> {
        match self.db.peers().get(id).await {
            Ok(node) => Ok(Some(node)),
            Err(MeshDbError::NodeNotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn select_ipv4(
        &self,
        req: &JoinRequest,
        existing: Option<&MeshNode>,
        prefix: Ipv4Net,
    ) -> Result<Ipv4Net, ServiceError> {
        if let Some(allocated) = existing.and_then(|n| n.private_ipv4) {
            return Ok(allocated);
        }
        if !req.assigned_ipv4.is_empty() {
            let assigned: Ipv4Net = req.assigned_ipv4.parse().map_err(|_| {
                ServiceError::invalid_arg(format!("malformed ipv4 {}", req.assigned_ipv4))
            })?;
            if assigned.prefix_len() != 32 || !prefix.contains(&assigned.addr()) {
                return Err(ServiceError::invalid_arg(format!(
                    "assigned ipv4 {assigned} is not a host address in {prefix}"
                )));
            }
            return Ok(assigned);
        }
        self.ipam.allocate(prefix, &req.id).await
    }

    fn parse_routes(routes: &[String]) -> Result<Vec<IpNet>, ServiceError> {
        routes
            .iter()
            .map(|raw| {
                raw.parse::<IpNet>()
                    .map_err(|_| ServiceError::invalid_arg(format!("malformed cidr {raw}")))
            })
            .collect()
    }

    /// Starts managing the node's auto route when it advertises CIDRs
    /// not yet covered by its current routes.
    async fn ensure_peer_routes(
        &self,
        node_id: &str,
        routes: Vec<IpNet>,
    ) -> Result<(), ServiceError> {
        if routes.is_empty() {
            return Ok(());
        }
        let current = self.db.networking().get_routes_by_node(node_id).await?;
        let missing = routes.iter().any(|route| {
            !current
                .iter()
                .any(|r| r.destination_cidrs.contains(route))
        });
        if missing {
            let route = Route {
                name: node_auto_route(node_id),
                node: node_id.to_string(),
                destination_cidrs: routes,
            };
            debug!(node = node_id, route = %route.name, "adding auto route for node");
            self.db.networking().put_route(&route).await?;
        }
        Ok(())
    }

    /// Connects the joining node to the node that served the join, when
    /// that node is itself registered.
    async fn ensure_join_edge(&self, joiner: &str) -> Result<(), ServiceError> {
        let serving = self.raft.node_name();
        if serving == joiner {
            return Ok(());
        }
        if self.existing_peer(serving).await?.is_none() {
            return Ok(());
        }
        self.db
            .peers()
            .put_edge(&MeshEdge::between(serving, joiner))
            .await?;
        Ok(())
    }

    fn is_raft_member(&self, id: &str) -> bool {
        let raft_id = raft_node_id(id);
        self.raft
            .metrics()
            .borrow()
            .membership_config
            .membership()
            .nodes()
            .any(|(member, _)| *member == raft_id)
    }

    async fn handle_join(
        &self,
        caller: Option<String>,
        req: JoinRequest,
    ) -> Result<JoinResponse, ServiceError> {
        if req.id.is_empty() {
            return Err(ServiceError::invalid_arg("node id must not be empty"));
        }
        if req.public_key.is_empty() {
            return Err(ServiceError::invalid_arg("public key must not be empty"));
        }
        self.authorize_join(caller.as_deref(), &req).await?;

        let state = self.db.mesh_state();
        let ipv4_prefix = state.get_ipv4_prefix().await?;
        let ipv6_prefix = state.get_ipv6_prefix().await?;
        let mesh_domain = state.get_mesh_domain().await?;

        let existing = self.existing_peer(&req.id).await?;
        if let Some(existing) = &existing {
            if existing.public_key != req.public_key {
                return Err(ServiceError::AlreadyExists {
                    message: format!("node {} is registered with a different public key", req.id),
                });
            }
        }

        let ipv4 = self.select_ipv4(&req, existing.as_ref(), ipv4_prefix).await?;
        let ipv6 = derive_ipv6(&ipv6_prefix, &req.id);
        let now = Utc::now();

        let node = MeshNode {
            id: req.id.clone(),
            public_key: req.public_key.clone(),
            primary_endpoint: (!req.primary_endpoint.is_empty())
                .then(|| req.primary_endpoint.clone()),
            wireguard_endpoints: req.wireguard_endpoints.clone(),
            zone_awareness_id: (!req.zone_awareness_id.is_empty())
                .then(|| req.zone_awareness_id.clone()),
            features: req.features.iter().map(Into::into).collect(),
            private_ipv4: Some(ipv4),
            private_ipv6: Some(ipv6),
            created_at: existing.as_ref().map(|n| n.created_at).unwrap_or(now),
            updated_at: now,
        };
        self.db.peers().put(&node).await?;
        self.db
            .leases()
            .put(&Lease {
                node_id: req.id.clone(),
                ipv4,
                acquired_at: now,
            })
            .await?;

        self.ensure_peer_routes(&req.id, Self::parse_routes(&req.routes)?)
            .await?;
        self.ensure_join_edge(&req.id).await?;

        if !self.is_raft_member(&req.id) {
            if req.raft_address.is_empty() {
                return Err(ServiceError::invalid_arg(
                    "raft address required to join the consensus group",
                ));
            }
            let result = if req.as_observer {
                self.raft.add_observer(&req.id, &req.raft_address).await
            } else {
                self.raft.add_voter(&req.id, &req.raft_address).await
            };
            result.map_err(consensus_error)?;
        }

        let peers = wireguard_peers_for(&self.db, &req.id, self.mesh.per_route_filtering).await?;
        info!(
            node = %req.id,
            ipv4 = %ipv4,
            observer = req.as_observer,
            peers = peers.len(),
            "node joined the mesh"
        );

        Ok(JoinResponse {
            address_ipv4: ipv4.to_string(),
            address_ipv6: ipv6.to_string(),
            mesh_domain,
            peers: peers.iter().map(Into::into).collect(),
        })
    }

    async fn handle_update(
        &self,
        caller: Option<String>,
        req: UpdateRequest,
    ) -> Result<UpdateResponse, ServiceError> {
        if caller.as_deref() != Some(req.id.as_str()) {
            return Err(ServiceError::permission_denied(format!(
                "only node {} may update its own record",
                req.id
            )));
        }

        let existing =
            self.existing_peer(&req.id)
                .await?
                .ok_or_else(|| ServiceError::NotFound {
                    message: format!("node {}", req.id),
                })?;

        let node = MeshNode {
            primary_endpoint: (!req.primary_endpoint.is_empty())
                .then(|| req.primary_endpoint.clone()),
            wireguard_endpoints: req.wireguard_endpoints.clone(),
            features: req.features.iter().map(Into::into).collect(),
            updated_at: Utc::now(),
            ..existing
        };
        self.db.peers().put(&node).await?;
        self.ensure_peer_routes(&req.id, Self::parse_routes(&req.routes)?)
            .await?;
        Ok(UpdateResponse {})
    }

    async fn handle_leave(
        &self,
        caller: Option<String>,
        req: LeaveRequest,
    ) -> Result<LeaveResponse, ServiceError> {
        let caller = caller.ok_or_else(|| {
            ServiceError::permission_denied("request carries no authenticated identity")
        })?;
        if caller != req.id {
            let allowed = self
                .db
                .rbac()
                .evaluator()
                .evaluate(&caller, Verb::Delete, RuleResource::Peers, &req.id)
                .await?;
            if !allowed {
                return Err(ServiceError::permission_denied(format!(
                    "caller {caller} may not remove node {}",
                    req.id
                )));
            }
        }

        // Every step is idempotent; leaving an unknown node succeeds.
        self.raft
            .remove_server(&req.id)
            .await
            .map_err(consensus_error)?;
        self.db
            .networking()
            .delete_route(&node_auto_route(&req.id))
            .await?;
        self.db.peers().delete_node_edges(&req.id).await?;
        self.db.leases().delete(&req.id).await?;
        self.db.peers().delete(&req.id).await?;

        info!(node = %req.id, "node left the mesh");
        Ok(LeaveResponse {})
    }

    fn consensus_members(&self) -> GetCurrentConsensusResponse {
        let metrics = self.raft.metrics().borrow().clone();
        let membership = metrics.membership_config.membership().clone();
        let voters: Vec<u64> = membership.voter_ids().collect();

        let members: Vec<ConsensusMember> = membership
            .nodes()
            .map(|(id, node)| ConsensusMember {
                id: id.to_string(),
                address: node.addr.clone(),
                voter: voters.contains(id),
                leader: metrics.current_leader == Some(*id),
            })
            .collect();
        let leader = metrics
            .current_leader
            .map(|id| id.to_string())
            .unwrap_or_default();
        GetCurrentConsensusResponse { members, leader }
    }
}

fn consensus_error(err: ConsensusError) -> ServiceError {
    match err {
        ConsensusError::NotLeader { leader } => ServiceError::NotLeader { leader },
        ConsensusError::NoLeader => ServiceError::NoLeader,
        ConsensusError::ApplyTimeout { timeout } => ServiceError::Timeout {
            message: format!("raft apply after {timeout:?}"),
        },
        other => ServiceError::internal(other),
    }
}

#[tonic::async_trait]
impl MembershipService for MembershipServiceImpl {
    #[instrument(skip(self, request), fields(node = %request.get_ref().id))]
    async fn join(
        &self,
        request: Request<JoinRequest>,
    ) -> Result<Response<JoinResponse>, Status> {
        let caller = context::authenticated_caller(&request);
        let req = request.into_inner();

        if !self.raft.is_leader() {
            if !self.mesh.leader_proxy {
                return Err(self.not_leader().into());
            }
            debug!(node = %req.id, "proxying join to leader");
            let mut client = self.leader_client().await.map_err(Status::from)?;
            let proxied = Self::proxied_request(caller.as_deref(), req).map_err(Status::from)?;
            return client.join(proxied).await;
        }

        let response = self.handle_join(caller, req).await.map_err(Status::from)?;
        Ok(Response::new(response))
    }

    #[instrument(skip(self, request), fields(node = %request.get_ref().id))]
    async fn update(
        &self,
        request: Request<UpdateRequest>,
    ) -> Result<Response<UpdateResponse>, Status> {
        let caller = context::authenticated_caller(&request);
        let req = request.into_inner();

        if !self.raft.is_leader() {
            if !self.mesh.leader_proxy {
                return Err(self.not_leader().into());
            }
            let mut client = self.leader_client().await.map_err(Status::from)?;
            let proxied = Self::proxied_request(caller.as_deref(), req).map_err(Status::from)?;
            return client.update(proxied).await;
        }

        let response = self
            .handle_update(caller, req)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(response))
    }

    #[instrument(skip(self, request), fields(node = %request.get_ref().id))]
    async fn leave(
        &self,
        request: Request<LeaveRequest>,
    ) -> Result<Response<LeaveResponse>, Status> {
        let caller = context::authenticated_caller(&request);
        let req = request.into_inner();

        if !self.raft.is_leader() {
            if !self.mesh.leader_proxy {
                return Err(self.not_leader().into());
            }
            let mut client = self.leader_client().await.map_err(Status::from)?;
            let proxied = Self::proxied_request(caller.as_deref(), req).map_err(Status::from)?;
            return client.leave(proxied).await;
        }

        let response = self.handle_leave(caller, req).await.map_err(Status::from)?;
        Ok(Response::new(response))
    }

    async fn get_current_consensus(
        &self,
        _request: Request<GetCurrentConsensusRequest>,
    ) -> Result<Response<GetCurrentConsensusResponse>, Status> {
        Ok(Response::new(self.consensus_members()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use webmesh_storage::MemoryBackend;
    use webmesh_types::{RaftConfig, Role, RoleBinding, Rule, Subject, SubjectKind};

    use crate::ipam::BuiltinIpam;

    use super::*;

    async fn mesh_service() -> MembershipServiceImpl {
        let backend = Arc::new(MemoryBackend::new());
        let config = RaftConfig {
            in_memory: true,
            heartbeat_timeout: Duration::from_millis(1000),
            election_timeout: Duration::from_millis(1500),
            ..Default::default()
        };
        let raft = MeshRaft::new("leader", config, backend.clone())
            .await
            .expect("start raft");
        raft.bootstrap(&BTreeMap::from([(
            "leader".to_string(),
            "127.0.0.1:0".to_string(),
        )]))
        .await
        .expect("bootstrap");

        let db = MeshDb::new(backend);
        let mesh = MeshConfig::default();

        // Seed mesh state and permissive RBAC for the tests.
        let state = db.mesh_state();
        state.set_ipv4_prefix(mesh.ipv4_prefix).await.expect("state");
        state.set_ipv6_prefix(mesh.ipv6_prefix).await.expect("state");
        state.set_mesh_domain(&mesh.mesh_domain).await.expect("state");
        let rbac = db.rbac();
        rbac.put_role(&Role {
            name: "mesh-joiner".to_string(),
            rules: vec![Rule {
                verbs: vec![Verb::Put],
                resources: vec![RuleResource::DataChannels, RuleResource::Votes],
                resource_names: vec![],
            }],
        })
        .await
        .expect("role");
        rbac.put_role_binding(&RoleBinding {
            name: "all-may-join".to_string(),
            role: "mesh-joiner".to_string(),
            subjects: vec![Subject {
                kind: SubjectKind::Node,
                name: "*".to_string(),
            }],
        })
        .await
        .expect("binding");

        let ipam = Arc::new(BuiltinIpam::new(db.clone(), mesh.static_ipv4.clone()));
        MembershipServiceImpl::new(raft, db, ipam, mesh)
    }

    fn join_request(id: &str) -> JoinRequest {
        JoinRequest {
            id: id.to_string(),
            public_key: format!("{id}-key"),
            as_observer: true,
            raft_address: "127.0.0.1:0".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_join_allocates_sequentially() {
        let service = mesh_service().await;
        for (id, expected) in [("n1", "172.16.0.1/32"), ("n2", "172.16.0.2/32")] {
            let response = service
                .handle_join(Some(id.to_string()), join_request(id))
                .await
                .expect("join");
            assert_eq!(response.address_ipv4, expected);
            assert_eq!(response.mesh_domain, "webmesh.internal");
        }
    }

    #[tokio::test]
    async fn test_join_is_idempotent() {
        let service = mesh_service().await;
        let first = service
            .handle_join(Some("n1".to_string()), join_request("n1"))
            .await
            .expect("join");
        let second = service
            .handle_join(Some("n1".to_string()), join_request("n1"))
            .await
            .expect("join again");
        assert_eq!(first.address_ipv4, second.address_ipv4);
        assert_eq!(first.address_ipv6, second.address_ipv6);
        assert_eq!(service.db.peers().list().await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn test_join_rejects_key_conflict() {
        let service = mesh_service().await;
        service
            .handle_join(Some("n1".to_string()), join_request("n1"))
            .await
            .expect("join");

        let mut conflicting = join_request("n1");
        conflicting.public_key = "other-key".to_string();
        let err = service
            .handle_join(Some("n1".to_string()), conflicting)
            .await
            .expect_err("key conflict");
        assert!(matches!(err, ServiceError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_join_requires_matching_caller() {
        let service = mesh_service().await;
        let err = service
            .handle_join(Some("intruder".to_string()), join_request("n1"))
            .await
            .expect_err("mismatched caller");
        assert!(matches!(err, ServiceError::PermissionDenied { .. }));
    }

    #[tokio::test]
    async fn test_join_creates_lease_and_auto_route() {
        let service = mesh_service().await;
        let mut req = join_request("n1");
        req.routes = vec!["10.10.0.0/16".to_string()];
        service
            .handle_join(Some("n1".to_string()), req)
            .await
            .expect("join");

        let lease = service
            .db
            .leases()
            .get("n1")
            .await
            .expect("lease")
            .expect("present");
        assert_eq!(lease.ipv4.to_string(), "172.16.0.1/32");

        let routes = service
            .db
            .networking()
            .get_routes_by_node("n1")
            .await
            .expect("routes");
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].name, "n1-auto");
    }

    #[tokio::test]
    async fn test_leave_is_idempotent() {
        let service = mesh_service().await;
        service
            .handle_join(Some("n1".to_string()), join_request("n1"))
            .await
            .expect("join");

        service
            .handle_leave(
                Some("n1".to_string()),
                LeaveRequest {
                    id: "n1".to_string(),
                },
            )
            .await
            .expect("leave");
        assert!(service.db.leases().get("n1").await.expect("lease").is_none());
        assert!(service.db.peers().get("n1").await.is_err());

        // Second leave of the now-unknown node still succeeds.
        service
            .handle_leave(
                Some("n1".to_string()),
                LeaveRequest {
                    id: "n1".to_string(),
                },
            )
            .await
            .expect("leave again");
    }

    #[tokio::test]
    async fn test_static_assignment_respected() {
        let backend = Arc::new(MemoryBackend::new());
        let config = RaftConfig {
            in_memory: true,
            heartbeat_timeout: Duration::from_millis(1000),
            election_timeout: Duration::from_millis(1500),
            ..Default::default()
        };
        let raft = MeshRaft::new("leader", config, backend.clone())
            .await
            .expect("start raft");
        raft.bootstrap(&BTreeMap::from([(
            "leader".to_string(),
            "127.0.0.1:0".to_string(),
        )]))
        .await
        .expect("bootstrap");

        let db = MeshDb::new(backend);
        let mut mesh = MeshConfig::default();
        mesh.static_ipv4
            .insert("n7".to_string(), "172.16.0.50/32".parse().unwrap());

        let state = db.mesh_state();
        state.set_ipv4_prefix(mesh.ipv4_prefix).await.expect("state");
        state.set_ipv6_prefix(mesh.ipv6_prefix).await.expect("state");
        state.set_mesh_domain(&mesh.mesh_domain).await.expect("state");
        db.rbac()
            .put_role(&Role {
                name: "admin".to_string(),
                rules: vec![Rule {
                    verbs: vec![Verb::All],
                    resources: vec![RuleResource::All],
                    resource_names: vec![],
                }],
            })
            .await
            .expect("role");
        db.rbac()
            .put_role_binding(&RoleBinding {
                name: "admins".to_string(),
                role: "admin".to_string(),
                subjects: vec![Subject {
                    kind: SubjectKind::Node,
                    name: "*".to_string(),
                }],
            })
            .await
            .expect("binding");

        let ipam = Arc::new(BuiltinIpam::new(db.clone(), mesh.static_ipv4.clone()));
        let service = MembershipServiceImpl::new(raft, db, ipam, mesh);

        let response = service
            .handle_join(Some("n7".to_string()), join_request("n7"))
            .await
            .expect("join");
        assert_eq!(response.address_ipv4, "172.16.0.50/32");

        // Subsequent joins skip the static address.
        let next = service
            .handle_join(Some("n8".to_string()), join_request("n8"))
            .await
            .expect("join");
        assert_eq!(next.address_ipv4, "172.16.0.1/32");
    }

    #[tokio::test]
    async fn test_update_mutates_own_record_only() {
        let service = mesh_service().await;
        service
            .handle_join(Some("n1".to_string()), join_request("n1"))
            .await
            .expect("join");

        let update = UpdateRequest {
            id: "n1".to_string(),
            primary_endpoint: "203.0.113.9".to_string(),
            wireguard_endpoints: vec!["203.0.113.9:51820".to_string()],
            ..Default::default()
        };
        service
            .handle_update(Some("n1".to_string()), update.clone())
            .await
            .expect("update");
        let node = service.db.peers().get("n1").await.expect("get");
        assert_eq!(node.primary_endpoint.as_deref(), Some("203.0.113.9"));
        // The allocation survives updates.
        assert_eq!(
            node.private_ipv4.unwrap().to_string(),
            "172.16.0.1/32"
        );

        let err = service
            .handle_update(Some("n2".to_string()), update)
            .await
            .expect_err("foreign update");
        assert!(matches!(err, ServiceError::PermissionDenied { .. }));
    }
}
