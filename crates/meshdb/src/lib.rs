//! Typed collections over the replicated mesh registry.
//!
//! This crate provides the database models of the mesh: peers and their
//! edges, network ACLs and routes, the bootstrap-time mesh state, RBAC,
//! and the reachability engine that computes per-node WireGuard peer
//! lists from them.
//!
//! Every collection is a thin typed view over a [`MeshStorage`] handle;
//! entities are stored as JSON documents under fixed key prefixes and
//! listed in ascending key order, which keeps graph construction and
//! ACL evaluation deterministic.
//!
//! [`MeshStorage`]: webmesh_storage::MeshStorage

#![deny(unsafe_code)]

mod acls;
mod error;
mod leases;
mod networking;
mod peers;
mod rbac;
mod reachability;
mod state;

use std::sync::Arc;

use webmesh_storage::MeshStorage;

pub use acls::{AclList, NetworkAction};
pub use error::MeshDbError;
pub use leases::Leases;
pub use networking::{node_auto_route, Networking, BOOTSTRAP_NODES_ACL_NAME};
pub use peers::{PeerGraph, Peers};
pub use rbac::{Rbac, RbacEvaluator};
pub use reachability::{filter_graph, wireguard_peers_for, AdjacencyMap, FilteredGraph};
pub use state::MeshState;

/// Handle to all typed collections of the mesh database.
#[derive(Clone)]
pub struct MeshDb {
    storage: Arc<dyn MeshStorage>,
}

impl MeshDb {
    /// Creates the database over a storage handle.
    pub fn new(storage: Arc<dyn MeshStorage>) -> Self {
        Self { storage }
    }

    /// The underlying storage handle.
    pub fn storage(&self) -> &Arc<dyn MeshStorage> {
        &self.storage
    }

    /// The peers collection.
    pub fn peers(&self) -> Peers {
        Peers::new(self.storage.clone())
    }

    /// The leases collection.
    pub fn leases(&self) -> Leases {
        Leases::new(self.storage.clone())
    }

    /// The network ACLs and routes collection.
    pub fn networking(&self) -> Networking {
        Networking::new(self.storage.clone())
    }

    /// The bootstrap-time mesh state.
    pub fn mesh_state(&self) -> MeshState {
        MeshState::new(self.storage.clone())
    }

    /// The RBAC collection and evaluator.
    pub fn rbac(&self) -> Rbac {
        Rbac::new(self.storage.clone())
    }
}
