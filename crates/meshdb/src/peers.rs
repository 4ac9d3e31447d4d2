//! Peers and the peer graph.
//!
//! Peers live under `/registry/nodes/<id>`; edges under
//! `/registry/node-edges/<src>/<dst>` with endpoints in lexicographic
//! order, so an unordered pair has exactly one possible key.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use webmesh_storage::{MeshStorage, StorageError};
use webmesh_types::{codec, MeshEdge, MeshNode};

use crate::error::MeshDbError;

/// Key prefix for peer records.
pub const NODES_PREFIX: &str = "/registry/nodes";

/// Key prefix for edges between peers.
pub const EDGES_PREFIX: &str = "/registry/node-edges";

fn node_key(id: &str) -> String {
    format!("{NODES_PREFIX}/{id}")
}

fn edge_key(edge: &MeshEdge) -> String {
    format!("{EDGES_PREFIX}/{}/{}", edge.source, edge.target)
}

/// The peers collection.
pub struct Peers {
    storage: Arc<dyn MeshStorage>,
}

impl Peers {
    pub(crate) fn new(storage: Arc<dyn MeshStorage>) -> Self {
        Self { storage }
    }

    /// Creates or updates a peer record.
    pub async fn put(&self, node: &MeshNode) -> Result<(), MeshDbError> {
        if node.id.is_empty() {
            return Err(MeshDbError::InvalidEntity {
                message: "node id must not be empty".to_string(),
            });
        }
        if node.public_key.is_empty() {
            return Err(MeshDbError::InvalidEntity {
                message: format!("node {} has no public key", node.id),
            });
        }
        let doc = codec::encode(node)
            .map_err(|e| MeshDbError::codec(format!("marshal node {}", node.id), e))?;
        self.storage
            .put_value(&node_key(&node.id), &doc, Duration::ZERO)
            .await
            .map_err(|e| MeshDbError::storage(format!("put node {}", node.id), e))
    }

    /// Returns a peer by id.
    pub async fn get(&self, id: &str) -> Result<MeshNode, MeshDbError> {
        let doc = match self.storage.get_value(&node_key(id)).await {
            Ok(doc) => doc,
            Err(StorageError::KeyNotFound { .. }) => {
                return Err(MeshDbError::NodeNotFound { id: id.to_string() })
            }
            Err(e) => return Err(MeshDbError::storage(format!("get node {id}"), e)),
        };
        codec::decode(&doc).map_err(|e| MeshDbError::codec(format!("unmarshal node {id}"), e))
    }

    /// Deletes a peer record. Incident edges are left to the caller.
    pub async fn delete(&self, id: &str) -> Result<(), MeshDbError> {
        self.storage
            .delete(&node_key(id))
            .await
            .map_err(|e| MeshDbError::storage(format!("delete node {id}"), e))
    }

    /// Lists all peers in id order.
    pub async fn list(&self) -> Result<Vec<MeshNode>, MeshDbError> {
        let pairs = self
            .storage
            .iter_prefix(&format!("{NODES_PREFIX}/"))
            .await
            .map_err(|e| MeshDbError::storage("list nodes", e))?;
        pairs
            .iter()
            .map(|(key, doc)| {
                codec::decode(doc).map_err(|e| MeshDbError::codec(format!("unmarshal {key}"), e))
            })
            .collect()
    }

    /// Creates or updates an edge. Both endpoints must exist.
    pub async fn put_edge(&self, edge: &MeshEdge) -> Result<(), MeshDbError> {
        if edge.weight == 0 {
            return Err(MeshDbError::InvalidEntity {
                message: "edge weight must be at least 1".to_string(),
            });
        }
        // Canonical order also rules out self-edges.
        if edge.source >= edge.target {
            return Err(MeshDbError::InvalidEntity {
                message: format!(
                    "edge endpoints {} -> {} are not in canonical order",
                    edge.source, edge.target
                ),
            });
        }
        self.get(&edge.source).await?;
        self.get(&edge.target).await?;

        let doc = codec::encode(edge).map_err(|e| {
            MeshDbError::codec(format!("marshal edge {}-{}", edge.source, edge.target), e)
        })?;
        self.storage
            .put_value(&edge_key(edge), &doc, Duration::ZERO)
            .await
            .map_err(|e| {
                MeshDbError::storage(format!("put edge {}-{}", edge.source, edge.target), e)
            })
    }

    /// Deletes the edge between two peers, if present.
    pub async fn delete_edge(&self, a: &str, b: &str) -> Result<(), MeshDbError> {
        let edge = MeshEdge::between(a, b);
        self.storage
            .delete(&edge_key(&edge))
            .await
            .map_err(|e| MeshDbError::storage(format!("delete edge {a}-{b}"), e))
    }

    /// Lists all edges in key order.
    pub async fn list_edges(&self) -> Result<Vec<MeshEdge>, MeshDbError> {
        let pairs = self
            .storage
            .iter_prefix(&format!("{EDGES_PREFIX}/"))
            .await
            .map_err(|e| MeshDbError::storage("list edges", e))?;
        pairs
            .iter()
            .map(|(key, doc)| {
                codec::decode(doc).map_err(|e| MeshDbError::codec(format!("unmarshal {key}"), e))
            })
            .collect()
    }

    /// Deletes every edge incident to `id`.
    pub async fn delete_node_edges(&self, id: &str) -> Result<(), MeshDbError> {
        for edge in self.list_edges().await? {
            if edge.source == id || edge.target == id {
                self.delete_edge(&edge.source, &edge.target).await?;
            }
        }
        Ok(())
    }

    /// Builds the peer graph from the persisted peers and edges.
    pub async fn graph(&self) -> Result<PeerGraph, MeshDbError> {
        let nodes: BTreeMap<String, MeshNode> = self
            .list()
            .await?
            .into_iter()
            .map(|n| (n.id.clone(), n))
            .collect();

        let mut adjacency: BTreeMap<String, BTreeSet<String>> = nodes
            .keys()
            .map(|id| (id.clone(), BTreeSet::new()))
            .collect();
        for edge in self.list_edges().await? {
            // Stale edges referencing deleted peers are skipped.
            if !nodes.contains_key(&edge.source) || !nodes.contains_key(&edge.target) {
                continue;
            }
            if let Some(set) = adjacency.get_mut(&edge.source) {
                set.insert(edge.target.clone());
            }
            if let Some(set) = adjacency.get_mut(&edge.target) {
                set.insert(edge.source.clone());
            }
        }

        Ok(PeerGraph { nodes, adjacency })
    }
}

/// An in-memory view of peers and their bidirectional adjacency.
///
/// Built from ordered iteration, so construction is deterministic.
#[derive(Debug, Clone, Default)]
pub struct PeerGraph {
    nodes: BTreeMap<String, MeshNode>,
    adjacency: BTreeMap<String, BTreeSet<String>>,
}

impl PeerGraph {
    /// Returns a vertex by id.
    pub fn vertex(&self, id: &str) -> Result<&MeshNode, MeshDbError> {
        self.nodes
            .get(id)
            .ok_or_else(|| MeshDbError::NodeNotFound { id: id.to_string() })
    }

    /// The full bidirectional adjacency map.
    pub fn adjacency_map(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.adjacency
    }

    /// All vertex ids in order.
    pub fn node_ids(&self) -> impl Iterator<Item = &String> {
        self.nodes.keys()
    }
}
