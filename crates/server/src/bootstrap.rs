//! Node assembly and cluster bootstrap.
//!
//! [`bootstrap_node`] wires the backend, consensus, storage facade,
//! mesh database, IPAM, and gRPC server for one node. Cluster formation
//! is a separate step ([`bootstrap_cluster`]) because elections need
//! the raft transport listening first.

use std::sync::Arc;

use snafu::Snafu;
use tracing::info;

use webmesh_meshdb::{MeshDb, MeshDbError, BOOTSTRAP_NODES_ACL_NAME};
use webmesh_raft::{ConsensusError, ConsensusStorage, MeshRaft};
use webmesh_services::{BuiltinIpam, MeshServer};
use webmesh_storage::{DiskBackend, KvBackend, MemoryBackend, StorageError};
use webmesh_types::{
    AclAction, ConfigError, Group, MeshConfig, NetworkAcl, Role, RoleBinding, Rule, RuleResource,
    Subject, SubjectKind, Verb,
};

use crate::config::Config;

/// Role granting full access, bound to the bootstrap node.
const ADMIN_ROLE: &str = "mesh-admin";
/// Role granting the permissions needed to join the mesh.
const JOINER_ROLE: &str = "mesh-joiner";
/// Group holding the initial voters.
const VOTERS_GROUP: &str = "voters";

/// Errors from node assembly and bootstrap.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum BootstrapError {
    /// The configuration failed to parse or validate.
    #[snafu(display("configuration: {source}"))]
    Config {
        /// Underlying configuration error.
        source: ConfigError,
    },

    /// A store failed to open.
    #[snafu(display("open storage: {source}"))]
    Storage {
        /// Underlying storage error.
        source: StorageError,
    },

    /// The consensus node failed to start or bootstrap.
    #[snafu(display("consensus: {source}"))]
    Consensus {
        /// Underlying consensus error.
        source: ConsensusError,
    },

    /// Seeding the initial registry state failed.
    #[snafu(display("seed registry: {source}"))]
    Seed {
        /// Underlying database error.
        source: MeshDbError,
    },
}

/// A fully assembled node, ready to serve.
pub struct BootstrappedNode {
    /// The consensus node.
    pub raft: Arc<MeshRaft>,
    /// The mesh database over consensus-backed storage.
    pub db: MeshDb,
    /// The gRPC server; consumed by the caller's serve task.
    pub server: Option<MeshServer>,
}

/// Assembles a node from its configuration. Does not form a cluster.
pub async fn bootstrap_node(
    config: &Config,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
) -> Result<BootstrappedNode, BootstrapError> {
    let raft_config = config.raft_config().map_err(|source| BootstrapError::Config { source })?;
    let mesh_config = config.mesh_config().map_err(|source| BootstrapError::Config { source })?;

    let backend: Arc<dyn KvBackend> = if raft_config.in_memory {
        Arc::new(MemoryBackend::new())
    } else {
        std::fs::create_dir_all(&raft_config.data_dir)
            .map_err(|e| BootstrapError::Storage {
                source: StorageError::io(e),
            })?;
        Arc::new(
            DiskBackend::open(raft_config.backend_path())
                .map_err(|source| BootstrapError::Storage { source })?,
        )
    };

    let raft = MeshRaft::new(&config.node_id, raft_config, backend)
        .await
        .map_err(|source| BootstrapError::Consensus { source })?;

    let storage = Arc::new(ConsensusStorage::new(raft.clone(), mesh_config.leader_proxy));
    let db = MeshDb::new(storage);
    let ipam = Arc::new(BuiltinIpam::new(db.clone(), mesh_config.static_ipv4.clone()));

    let server = MeshServer::builder()
        .raft(raft.clone())
        .db(db.clone())
        .ipam(ipam)
        .mesh(mesh_config)
        .addr(config.listen_address)
        .shutdown_rx(Some(shutdown_rx))
        .build();

    Ok(BootstrappedNode {
        raft,
        db,
        server: Some(server),
    })
}

/// Forms the cluster from the configured bootstrap servers and, on the
/// elected leader, seeds the initial registry state. One-shot: a node
/// with a non-empty log reports `AlreadyBootstrapped`, which is treated
/// as success on restart.
pub async fn bootstrap_cluster(
    node: &BootstrappedNode,
    config: &Config,
) -> Result<(), BootstrapError> {
    let servers = config
        .bootstrap_server_map()
        .map_err(|source| BootstrapError::Config { source })?;
    let mesh_config = config.mesh_config().map_err(|source| BootstrapError::Config { source })?;

    match node.raft.bootstrap(&servers).await {
        Ok(()) => {}
        Err(ConsensusError::AlreadyBootstrapped) => {
            info!(node = %config.node_id, "cluster already bootstrapped");
            return Ok(());
        }
        Err(source) => return Err(BootstrapError::Consensus { source }),
    }

    if node.raft.is_leader() {
        seed_initial_state(&node.db, &mesh_config, servers.keys())
            .await
            .map_err(|source| BootstrapError::Seed { source })?;
        info!(node = %config.node_id, "bootstrapped cluster as initial leader");
    }
    Ok(())
}

/// Writes the bootstrap-time registry state: mesh prefixes and domain,
/// the system ACL connecting the bootstrap nodes, and the default RBAC
/// roles. Idempotent for identical values so every bootstrap server may
/// race to it.
async fn seed_initial_state<'a>(
    db: &MeshDb,
    mesh: &MeshConfig,
    bootstrap_nodes: impl Iterator<Item = &'a String>,
) -> Result<(), MeshDbError> {
    let bootstrap_nodes: Vec<String> = bootstrap_nodes.cloned().collect();

    let state = db.mesh_state();
    state.set_ipv4_prefix(mesh.ipv4_prefix).await?;
    state.set_ipv6_prefix(mesh.ipv6_prefix).await?;
    state.set_mesh_domain(&mesh.mesh_domain).await?;

    let networking = db.networking();
    let bootstrap_acl = NetworkAcl {
        name: BOOTSTRAP_NODES_ACL_NAME.to_string(),
        priority: i32::MAX,
        action: AclAction::Accept,
        source_nodes: vec![format!("group:{VOTERS_GROUP}")],
        destination_nodes: vec![format!("group:{VOTERS_GROUP}")],
        ..Default::default()
    };
    match networking.put_network_acl(&bootstrap_acl).await {
        Ok(()) => {}
        // Create-once: an earlier bootstrap already wrote it.
        Err(MeshDbError::SystemAcl { .. }) => {}
        Err(e) => return Err(e),
    }

    let rbac = db.rbac();
    rbac.put_group(&Group {
        name: VOTERS_GROUP.to_string(),
        subjects: bootstrap_nodes
            .iter()
            .map(|id| Subject {
                kind: SubjectKind::Node,
                name: id.clone(),
            })
            .collect(),
    })
    .await?;

    rbac.put_role(&Role {
        name: ADMIN_ROLE.to_string(),
        rules: vec![Rule {
            verbs: vec![Verb::All],
            resources: vec![RuleResource::All],
            resource_names: vec![],
        }],
    })
    .await?;
    rbac.put_role_binding(&RoleBinding {
        name: format!("{ADMIN_ROLE}-binding"),
        role: ADMIN_ROLE.to_string(),
        subjects: bootstrap_nodes
            .iter()
            .map(|id| Subject {
                kind: SubjectKind::Node,
                name: id.clone(),
            })
            .collect(),
    })
    .await?;

    // The mesh is cooperative: any authenticated node may join. Tighter
    // deployments replace this binding through the admin surface.
    rbac.put_role(&Role {
        name: JOINER_ROLE.to_string(),
        rules: vec![Rule {
            verbs: vec![Verb::Put],
            resources: vec![RuleResource::DataChannels, RuleResource::Votes],
            resource_names: vec![],
        }],
    })
    .await?;
    rbac.put_role_binding(&RoleBinding {
        name: format!("{JOINER_ROLE}-binding"),
        role: JOINER_ROLE.to_string(),
        subjects: vec![Subject {
            kind: SubjectKind::Node,
            name: "*".to_string(),
        }],
    })
    .await?;

    Ok(())
}
