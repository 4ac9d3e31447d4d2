//! Mesh registry entities.
//!
//! Each type here maps to a single key in the replicated registry and is
//! stored as a JSON document via [`crate::codec`]. Timestamps are filled
//! by the proposer before the write enters the log, never by the state
//! machine, so that applying a log entry is deterministic.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};

/// A node registered in the mesh, stored at `/registry/nodes/<id>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshNode {
    /// Globally unique node name.
    pub id: String,
    /// Encoded curve25519 public key.
    pub public_key: String,
    /// Publicly reachable address, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_endpoint: Option<String>,
    /// WireGuard `ip:port` endpoints in preference order.
    #[serde(default)]
    pub wireguard_endpoints: Vec<String>,
    /// Zone awareness identifier for topology hints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone_awareness_id: Option<String>,
    /// Features the node exposes and the ports they listen on.
    #[serde(default)]
    pub features: Vec<FeaturePort>,
    /// Private IPv4 allocation inside the mesh prefix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_ipv4: Option<Ipv4Net>,
    /// Private IPv6 address derived from the mesh prefix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_ipv6: Option<Ipv6Net>,
    /// Creation time, filled by the proposer.
    pub created_at: DateTime<Utc>,
    /// Last update time, filled by the proposer.
    pub updated_at: DateTime<Utc>,
}

impl MeshNode {
    /// Returns the node's private IPv4 as a display string, or empty.
    pub fn address_ipv4(&self) -> String {
        self.private_ipv4.map(|p| p.to_string()).unwrap_or_default()
    }

    /// Returns the node's private IPv6 as a display string, or empty.
    pub fn address_ipv6(&self) -> String {
        self.private_ipv6.map(|p| p.to_string()).unwrap_or_default()
    }
}

/// A feature advertised by a node together with its listen port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeaturePort {
    /// Feature name (e.g. `raft`, `mesh-dns`).
    pub feature: String,
    /// Port the feature listens on.
    pub port: u16,
}

/// An undirected logical adjacency between two peers, stored at
/// `/registry/node-edges/<src>/<dst>` with `src < dst` lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshEdge {
    /// Lexicographically smaller endpoint.
    pub source: String,
    /// Lexicographically larger endpoint.
    pub target: String,
    /// Edge weight, at least 1.
    pub weight: u32,
    /// Opaque attributes.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, String>,
}

impl MeshEdge {
    /// Builds an edge with endpoints in canonical order.
    pub fn between(a: &str, b: &str) -> Self {
        let (source, target) = if a <= b { (a, b) } else { (b, a) };
        Self {
            source: source.to_string(),
            target: target.to_string(),
            weight: 1,
            attrs: BTreeMap::new(),
        }
    }
}

/// The IPAM record binding a node to its IPv4 allocation, stored at
/// `/registry/leases/<node-id>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Node the lease belongs to.
    pub node_id: String,
    /// The allocated address, mirroring `MeshNode::private_ipv4`.
    pub ipv4: Ipv4Net,
    /// When the lease was granted, filled by the proposer.
    pub acquired_at: DateTime<Utc>,
}

/// Verdict assigned by a matching network ACL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AclAction {
    /// Traffic is dropped.
    #[default]
    Deny,
    /// Traffic is allowed.
    Accept,
}

/// An ordered network access rule, stored at
/// `/registry/network-acls/<name>`.
///
/// Node selectors may contain literal node ids, the wildcard `*`, or a
/// `group:<name>` reference that is expanded against the RBAC groups at
/// evaluation time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAcl {
    /// Unique ACL name. `bootstrap-nodes` is reserved and system-managed.
    pub name: String,
    /// Evaluation priority; higher values are evaluated first.
    pub priority: i32,
    /// Verdict when the rule matches.
    pub action: AclAction,
    /// Source node selectors. Empty means match none, `*` matches all.
    #[serde(default)]
    pub source_nodes: Vec<String>,
    /// Destination node selectors.
    #[serde(default)]
    pub destination_nodes: Vec<String>,
    /// Source CIDR selectors. `*` matches all.
    #[serde(default)]
    pub source_cidrs: Vec<String>,
    /// Destination CIDR selectors.
    #[serde(default)]
    pub destination_cidrs: Vec<String>,
    /// Protocol selectors. Empty matches all.
    #[serde(default)]
    pub protocols: Vec<String>,
    /// Port selectors. Empty matches all.
    #[serde(default)]
    pub ports: Vec<u16>,
}

/// A CIDR advertisement, stored at `/registry/routes/<name>`: traffic for
/// each destination prefix should be delivered to `node`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Unique route name. `<node>-auto` names are managed by the core.
    pub name: String,
    /// The advertising gateway node.
    pub node: String,
    /// Prefixes routed through the node.
    pub destination_cidrs: Vec<IpNet>,
}

/// A computed WireGuard peer entry returned to a joining node.
///
/// This is a view assembled by the reachability engine, never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireGuardPeer {
    /// Peer node id.
    pub id: String,
    /// Peer public key.
    pub public_key: String,
    /// Zone awareness id of the peer.
    pub zone_awareness_id: String,
    /// Preferred endpoint chosen from the peer's wireguard endpoints.
    pub primary_endpoint: String,
    /// All wireguard endpoints of the peer.
    pub wireguard_endpoints: Vec<String>,
    /// Peer private IPv4 (empty if unset).
    pub address_ipv4: String,
    /// Peer private IPv6 (empty if unset).
    pub address_ipv6: String,
    /// Destination prefixes routed into this peer's tunnel.
    pub allowed_ips: Vec<String>,
}
