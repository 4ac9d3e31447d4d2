//! The mesh raft node.
//!
//! [`MeshRaft`] wraps the OpenRaft instance with the node lifecycle the
//! rest of the system works against: one-shot bootstrap, proposal apply
//! with the configured timeout, membership changes, the leadership
//! observer channel, a wall-clock snapshot timer, and shutdown with
//! optional self-removal.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use openraft::error::{ClientWriteError, InitializeError, RaftError};
use openraft::storage::Adaptor;
use openraft::{BasicNode, ChangeMembers, Raft, RaftMetrics, SnapshotPolicy};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use webmesh_storage::KvBackend;
use webmesh_types::{raft_node_id, RaftConfig, RaftNodeId};

use crate::error::ConsensusError;
use crate::log_storage::MeshLogStore;
use crate::raft_network::GrpcRaftNetworkFactory;
use crate::snapshot::SnapshotStore;
use crate::types::{MeshRequest, MeshTypeConfig};

/// A cluster-configuration event emitted by the leadership observer.
///
/// The channel is bounded and lossy: consumers must be idempotent and
/// periodically re-read state rather than rely on a complete history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    /// The observed leader changed.
    LeaderChanged {
        /// The new leader, when one is known.
        leader: Option<RaftNodeId>,
    },
    /// A node appeared in the configuration.
    PeerAdded {
        /// The added node.
        node_id: RaftNodeId,
    },
    /// A node left the configuration.
    PeerRemoved {
        /// The removed node.
        node_id: RaftNodeId,
    },
}

/// The raft consensus node for a mesh member.
pub struct MeshRaft {
    raft: Raft<MeshTypeConfig>,
    node_id: RaftNodeId,
    node_name: String,
    backend: Arc<dyn KvBackend>,
    snapshots: Arc<SnapshotStore>,
    config: RaftConfig,
    events: broadcast::Sender<MeshEvent>,
    shutdown_tx: watch::Sender<bool>,
}

impl MeshRaft {
    /// Creates and starts a raft node for `node_name`.
    ///
    /// The node participates in replication immediately but holds no
    /// cluster membership until [`Self::bootstrap`] runs or an existing
    /// leader adds it.
    pub async fn new(
        node_name: &str,
        config: RaftConfig,
        backend: Arc<dyn KvBackend>,
    ) -> Result<Arc<Self>, ConsensusError> {
        config.validate().map_err(ConsensusError::raft)?;
        let node_id = raft_node_id(node_name);

        let snapshots = if config.in_memory {
            Arc::new(SnapshotStore::in_memory(config.snapshot_retention))
        } else {
            std::fs::create_dir_all(&config.data_dir).map_err(|e| ConsensusError::Store {
                source: webmesh_storage::StorageError::io(e),
            })?;
            Arc::new(
                SnapshotStore::open_disk(config.snapshot_dir(), config.snapshot_retention)
                    .map_err(|source| ConsensusError::Store { source })?,
            )
        };

        let store = if config.in_memory {
            MeshLogStore::in_memory(backend.clone(), snapshots.clone(), config.log_format)?
        } else {
            MeshLogStore::open(
                config.log_store_path(),
                backend.clone(),
                snapshots.clone(),
                config.log_format,
            )?
        };

        let raft_config = openraft::Config {
            cluster_name: "webmesh".to_string(),
            heartbeat_interval: config.heartbeat_timeout.as_millis() as u64,
            election_timeout_min: config.election_timeout.as_millis() as u64,
            election_timeout_max: config.election_timeout.as_millis() as u64 * 2,
            max_payload_entries: config.max_append_entries,
            snapshot_policy: SnapshotPolicy::LogsSinceLast(config.snapshot_threshold),
            install_snapshot_timeout: config.commit_timeout.as_millis() as u64,
            ..Default::default()
        };

        let network = GrpcRaftNetworkFactory::new(config.connection_timeout);
        let (log_storage, state_machine) = Adaptor::new(store);

        let raft = Raft::<MeshTypeConfig>::new(
            node_id,
            Arc::new(raft_config),
            network,
            log_storage,
            state_machine,
        )
        .await
        .map_err(ConsensusError::raft)?;

        info!(node = node_name, id = node_id, "raft node started");

        let (events, _) = broadcast::channel(config.observer_chan_buffer);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let node = Arc::new(Self {
            raft,
            node_id,
            node_name: node_name.to_string(),
            backend,
            snapshots,
            config,
            events,
            shutdown_tx,
        });

        node.spawn_observer(shutdown_rx.clone());
        node.spawn_snapshot_timer(shutdown_rx);
        Ok(node)
    }

    /// The underlying OpenRaft handle.
    pub fn raft(&self) -> &Raft<MeshTypeConfig> {
        &self.raft
    }

    /// The raft id of this node.
    pub fn node_id(&self) -> RaftNodeId {
        self.node_id
    }

    /// The mesh name of this node.
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// The key/value backend the state machine applies into.
    pub fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.backend
    }

    /// The snapshot artifact store.
    pub fn snapshots(&self) -> &Arc<SnapshotStore> {
        &self.snapshots
    }

    /// The node configuration.
    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    /// Subscribes to leadership observer events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    /// A watch receiver over the raft metrics.
    pub fn metrics(&self) -> watch::Receiver<RaftMetrics<RaftNodeId, BasicNode>> {
        self.raft.metrics()
    }

    /// Bootstraps the cluster with the given `name -> raft address`
    /// servers, all as voters. One-shot: a node whose log is non-empty
    /// refuses with [`ConsensusError::AlreadyBootstrapped`].
    pub async fn bootstrap(&self, servers: &BTreeMap<String, String>) -> Result<(), ConsensusError> {
        if self
            .raft
            .is_initialized()
            .await
            .map_err(ConsensusError::raft)?
        {
            return Err(ConsensusError::AlreadyBootstrapped);
        }

        let members: BTreeMap<RaftNodeId, BasicNode> = servers
            .iter()
            .map(|(name, addr)| (raft_node_id(name), BasicNode { addr: addr.clone() }))
            .collect();

        match self.raft.initialize(members).await {
            Ok(()) => {}
            Err(RaftError::APIError(InitializeError::NotAllowed(_))) => {
                return Err(ConsensusError::AlreadyBootstrapped);
            }
            Err(e) => return Err(ConsensusError::raft(e)),
        }

        self.wait_for_leader(self.config.startup_timeout).await?;
        Ok(())
    }

    /// Waits until any leader is observed, up to `timeout`.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<RaftNodeId, ConsensusError> {
        let mut metrics = self.raft.metrics();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(leader) = metrics.borrow().current_leader {
                return Ok(leader);
            }
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or(ConsensusError::NoLeader)?;
            if tokio::time::timeout(remaining, metrics.changed())
                .await
                .is_err()
            {
                return Err(ConsensusError::NoLeader);
            }
        }
    }

    /// Proposes a storage mutation and waits for commit and apply,
    /// bounded by the configured apply timeout.
    pub async fn apply(&self, request: MeshRequest) -> Result<(), ConsensusError> {
        let timeout = self.config.apply_timeout;
        let write = self.raft.client_write(request);
        match tokio::time::timeout(timeout, write).await {
            Err(_) => Err(ConsensusError::ApplyTimeout { timeout }),
            Ok(Ok(_)) => Ok(()),
            Ok(Err(RaftError::APIError(ClientWriteError::ForwardToLeader(fwd)))) => {
                Err(ConsensusError::NotLeader {
                    leader: fwd.leader_node.map(|n| n.addr),
                })
            }
            Ok(Err(RaftError::APIError(other))) => Err(ConsensusError::raft(other)),
            Ok(Err(RaftError::Fatal(fatal))) => Err(ConsensusError::raft(fatal)),
        }
    }

    /// True if this node currently holds leadership.
    pub fn is_leader(&self) -> bool {
        self.raft.metrics().borrow().current_leader == Some(self.node_id)
    }

    /// The current leader's id and advertised address, when known.
    pub fn current_leader(&self) -> Option<(RaftNodeId, String)> {
        let metrics = self.raft.metrics().borrow().clone();
        let leader = metrics.current_leader?;
        let addr = metrics
            .membership_config
            .membership()
            .nodes()
            .find(|(id, _)| **id == leader)
            .map(|(_, node)| node.addr.clone())?;
        Some((leader, addr))
    }

    /// Adds `name` as a voting member reachable at `addr`.
    pub async fn add_voter(&self, name: &str, addr: &str) -> Result<(), ConsensusError> {
        let id = raft_node_id(name);
        let node = BasicNode {
            addr: addr.to_string(),
        };
        self.raft
            .add_learner(id, node, false)
            .await
            .map_err(|e| self.map_write_error(e))?;
        self.raft
            .change_membership(ChangeMembers::AddVoterIds([id].into()), false)
            .await
            .map_err(|e| self.map_write_error(e))?;
        Ok(())
    }

    /// Adds `name` as a non-voting observer reachable at `addr`.
    pub async fn add_observer(&self, name: &str, addr: &str) -> Result<(), ConsensusError> {
        let id = raft_node_id(name);
        let node = BasicNode {
            addr: addr.to_string(),
        };
        self.raft
            .add_learner(id, node, false)
            .await
            .map_err(|e| self.map_write_error(e))?;
        Ok(())
    }

    /// Demotes a voting member to observer.
    pub async fn demote_voter(&self, name: &str) -> Result<(), ConsensusError> {
        let id = raft_node_id(name);
        self.raft
            .change_membership(ChangeMembers::RemoveVoters([id].into()), true)
            .await
            .map_err(|e| self.map_write_error(e))?;
        Ok(())
    }

    /// Removes `name` from the configuration entirely. Removing an
    /// unknown node is a no-op.
    pub async fn remove_server(&self, name: &str) -> Result<(), ConsensusError> {
        let id = raft_node_id(name);
        let membership = self
            .raft
            .metrics()
            .borrow()
            .membership_config
            .membership()
            .clone();
        let is_voter = membership.voter_ids().any(|v| v == id);
        let is_member = membership.nodes().any(|(n, _)| *n == id);
        if !is_member {
            return Ok(());
        }

        if is_voter {
            self.raft
                .change_membership(ChangeMembers::RemoveVoters([id].into()), false)
                .await
                .map_err(|e| self.map_write_error(e))?;
        } else {
            self.raft
                .change_membership(ChangeMembers::RemoveNodes([id].into()), false)
                .await
                .map_err(|e| self.map_write_error(e))?;
        }
        Ok(())
    }

    /// Shuts the node down, waiting up to the configured shutdown
    /// timeout. When `leave_on_shutdown` is set and this node leads, it
    /// first removes itself so the remaining members elect a successor.
    pub async fn shutdown(&self) -> Result<(), ConsensusError> {
        let _ = self.shutdown_tx.send(true);

        let deadline = self.config.shutdown_timeout;
        let result = tokio::time::timeout(deadline, async {
            if self.config.leave_on_shutdown && self.is_leader() {
                debug!(node = %self.node_name, "removing self from configuration before shutdown");
                if let Err(e) = self.remove_server(&self.node_name).await {
                    warn!(error = %e, "self-removal on shutdown failed");
                }
            }
            self.raft.shutdown().await.map_err(ConsensusError::raft)
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(ConsensusError::ApplyTimeout { timeout: deadline }),
        }
    }

    fn map_write_error(
        &self,
        err: RaftError<RaftNodeId, ClientWriteError<RaftNodeId, BasicNode>>,
    ) -> ConsensusError {
        match err {
            RaftError::APIError(ClientWriteError::ForwardToLeader(fwd)) => {
                ConsensusError::NotLeader {
                    leader: fwd.leader_node.map(|n| n.addr),
                }
            }
            other => ConsensusError::raft(other),
        }
    }

    /// Translates metrics transitions into observer events. Events are
    /// sent best-effort; the channel drops on overflow.
    fn spawn_observer(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let mut metrics = node.raft.metrics();
            let mut last_leader = metrics.borrow().current_leader;
            let mut last_members: Vec<RaftNodeId> = member_ids(&metrics.borrow().clone());

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                    changed = metrics.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }

                let current = metrics.borrow().clone();
                if current.current_leader != last_leader {
                    last_leader = current.current_leader;
                    let _ = node.events.send(MeshEvent::LeaderChanged {
                        leader: current.current_leader,
                    });
                }

                let members = member_ids(&current);
                for added in members.iter().filter(|m| !last_members.contains(m)) {
                    let _ = node.events.send(MeshEvent::PeerAdded { node_id: *added });
                }
                for removed in last_members.iter().filter(|m| !members.contains(m)) {
                    let _ = node.events.send(MeshEvent::PeerRemoved { node_id: *removed });
                }
                last_members = members;
            }
        });
    }

    /// Triggers a snapshot every `snapshot_interval` regardless of the
    /// committed-entry threshold.
    fn spawn_snapshot_timer(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let node = Arc::clone(self);
        let interval = node.config.snapshot_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = node.raft.trigger().snapshot().await {
                            debug!(error = %e, "interval snapshot trigger failed");
                        }
                    }
                }
            }
        });
    }
}

fn member_ids(metrics: &RaftMetrics<RaftNodeId, BasicNode>) -> Vec<RaftNodeId> {
    metrics
        .membership_config
        .membership()
        .nodes()
        .map(|(id, _)| *id)
        .collect()
}
