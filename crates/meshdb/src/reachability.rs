//! The reachability engine.
//!
//! Given a node, computes the ACL-filtered adjacency map of the mesh and
//! the WireGuard peer list with transitive allowed-IPs.
//!
//! Route handling has two modes. By default, a peer advertising any
//! denied route is removed from the map entirely. With per-route
//! filtering enabled, only the denied destinations are withheld from
//! allowed-IPs and the peer keeps its tunnels.
//! TODO(routes): drop the all-or-nothing default once per-route
//! filtering has soaked; the toggle exists for that migration.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use ipnet::IpNet;
use tracing::debug;
use webmesh_types::{MeshNode, Route, WireGuardPeer};

use crate::acls::{AclList, NetworkAction};
use crate::error::MeshDbError;
use crate::peers::PeerGraph;
use crate::MeshDb;

/// Node id -> set of adjacent node ids.
pub type AdjacencyMap = BTreeMap<String, BTreeSet<String>>;

/// The ACL-filtered view of the mesh from one node's perspective.
#[derive(Debug, Clone, Default)]
pub struct FilteredGraph {
    /// The filtered adjacency map.
    pub map: AdjacencyMap,
    /// `(node, cidr)` routes withheld under per-route filtering.
    denied_routes: BTreeSet<(String, String)>,
}

impl FilteredGraph {
    /// True if `cidr` advertised by `node` was denied.
    pub fn route_denied(&self, node: &str, cidr: &IpNet) -> bool {
        self.denied_routes
            .contains(&(node.to_string(), cidr.to_string()))
    }
}

/// Filters the full adjacency map for `this_node` according to the
/// current network ACLs. An empty ACL list yields a map with no
/// reachable peers.
pub async fn filter_graph(
    db: &MeshDb,
    graph: &PeerGraph,
    this_node: &MeshNode,
    per_route_filtering: bool,
) -> Result<FilteredGraph, MeshDbError> {
    let networking = db.networking();
    let acls = networking.list_network_acls().await?;
    let routes = routes_by_node(&networking.list_routes().await?);
    let full_map = graph.adjacency_map();

    let mut filtered = FilteredGraph::default();
    filtered.map.insert(
        this_node.id.clone(),
        full_map.get(&this_node.id).cloned().unwrap_or_default(),
    );

    // First pass: decide which nodes are reachable at all.
    for node_id in full_map.keys() {
        if *node_id == this_node.id {
            continue;
        }
        let node = graph.vertex(node_id)?;
        if !acls.allow_nodes_to_communicate(this_node, node) {
            debug!(from = %this_node.id, to = %node_id, "nodes not allowed to communicate");
            remove_adjacent(&mut filtered.map, &this_node.id, node_id);
            continue;
        }
        if !check_node_routes(
            &acls,
            this_node,
            node_id,
            routes.get(node_id),
            per_route_filtering,
            &mut filtered.denied_routes,
        ) {
            remove_adjacent(&mut filtered.map, &this_node.id, node_id);
            continue;
        }
        filtered.map.entry(node_id.clone()).or_default();
    }

    // Second pass: keep only edges between surviving nodes whose
    // endpoints may communicate.
    let retained: Vec<String> = filtered.map.keys().cloned().collect();
    for node_id in retained {
        let Some(edges) = full_map.get(&node_id) else {
            continue;
        };
        for peer_id in edges {
            if *peer_id == this_node.id {
                insert_adjacent(&mut filtered.map, &node_id, peer_id);
                continue;
            }
            let peer = graph.vertex(peer_id)?;
            if !acls.allow_nodes_to_communicate(this_node, peer) {
                continue;
            }
            if !check_node_routes(
                &acls,
                this_node,
                peer_id,
                routes.get(peer_id),
                per_route_filtering,
                &mut filtered.denied_routes,
            ) {
                continue;
            }
            insert_adjacent(&mut filtered.map, &node_id, peer_id);
        }
    }

    debug!(from = %this_node.id, map = ?filtered.map, "filtered adjacency map");
    Ok(filtered)
}

/// Computes the WireGuard peers for `node_id`: its ACL-filtered direct
/// adjacents, each with the preferred endpoint and transitive
/// allowed-IPs.
pub async fn wireguard_peers_for(
    db: &MeshDb,
    node_id: &str,
    per_route_filtering: bool,
) -> Result<Vec<WireGuardPeer>, MeshDbError> {
    let graph = db.peers().graph().await?;
    let this_node = graph.vertex(node_id)?.clone();
    let filtered = filter_graph(db, &graph, &this_node, per_route_filtering).await?;
    let routes = routes_by_node(&db.networking().list_routes().await?);

    let direct: BTreeSet<String> = filtered
        .map
        .get(node_id)
        .cloned()
        .unwrap_or_default();

    let mut out = Vec::with_capacity(direct.len());
    for adjacent in &direct {
        let node = graph.vertex(adjacent)?;

        let mut allowed_ips = Vec::new();
        push_node_addresses(&mut allowed_ips, node);
        push_node_routes(&mut allowed_ips, adjacent, routes.get(adjacent), &filtered);
        let transitive = transitive_allowed_ips(&graph, &filtered, &routes, node_id, &direct, adjacent)?;
        for ip in transitive {
            if !allowed_ips.contains(&ip) {
                allowed_ips.push(ip);
            }
        }

        out.push(WireGuardPeer {
            id: node.id.clone(),
            public_key: node.public_key.clone(),
            zone_awareness_id: node.zone_awareness_id.clone().unwrap_or_default(),
            primary_endpoint: preferred_endpoint(node),
            wireguard_endpoints: node.wireguard_endpoints.clone(),
            address_ipv4: node.address_ipv4(),
            address_ipv6: node.address_ipv6(),
            allowed_ips,
        });
    }
    Ok(out)
}

/// Walks the filtered map breadth-first from `adjacent`, skipping
/// `this_node` and its direct adjacents (those carry their own
/// tunnels), and collects the private addresses and advertised routes
/// of every node encountered. The visited set guards against cycles and
/// the map's ordering keeps traversal deterministic.
fn transitive_allowed_ips(
    graph: &PeerGraph,
    filtered: &FilteredGraph,
    routes: &BTreeMap<String, Vec<Route>>,
    this_node: &str,
    direct: &BTreeSet<String>,
    adjacent: &str,
) -> Result<Vec<String>, MeshDbError> {
    let mut allowed_ips = Vec::new();
    let mut visited: BTreeSet<String> = BTreeSet::new();
    visited.insert(adjacent.to_string());

    let mut queue: VecDeque<String> = VecDeque::new();
    queue.push_back(adjacent.to_string());

    while let Some(current) = queue.pop_front() {
        let Some(targets) = filtered.map.get(&current) else {
            continue;
        };
        for target in targets {
            if target == this_node || direct.contains(target) || visited.contains(target) {
                continue;
            }
            visited.insert(target.clone());

            let target_node = graph.vertex(target)?;
            push_node_addresses(&mut allowed_ips, target_node);
            push_node_routes(&mut allowed_ips, target, routes.get(target), filtered);

            queue.push_back(target.clone());
        }
    }
    Ok(allowed_ips)
}

/// The preferred endpoint: the first wireguard endpoint matching the
/// node's primary endpoint, else the first endpoint, else empty.
fn preferred_endpoint(node: &MeshNode) -> String {
    if let Some(primary) = node.primary_endpoint.as_deref() {
        if !primary.is_empty() {
            for endpoint in &node.wireguard_endpoints {
                if endpoint.starts_with(primary) {
                    return endpoint.clone();
                }
            }
        }
    }
    node.wireguard_endpoints.first().cloned().unwrap_or_default()
}

fn routes_by_node(routes: &[Route]) -> BTreeMap<String, Vec<Route>> {
    let mut map: BTreeMap<String, Vec<Route>> = BTreeMap::new();
    for route in routes {
        map.entry(route.node.clone()).or_default().push(route.clone());
    }
    map
}

fn push_node_addresses(allowed_ips: &mut Vec<String>, node: &MeshNode) {
    for addr in [node.address_ipv4(), node.address_ipv6()] {
        if !addr.is_empty() && !allowed_ips.contains(&addr) {
            allowed_ips.push(addr);
        }
    }
}

fn push_node_routes(
    allowed_ips: &mut Vec<String>,
    node_id: &str,
    routes: Option<&Vec<Route>>,
    filtered: &FilteredGraph,
) {
    let Some(routes) = routes else {
        return;
    };
    for route in routes {
        for cidr in &route.destination_cidrs {
            if filtered.route_denied(node_id, cidr) {
                continue;
            }
            let display = cidr.to_string();
            if !allowed_ips.contains(&display) {
                allowed_ips.push(display);
            }
        }
    }
}

fn remove_adjacent(map: &mut AdjacencyMap, from: &str, to: &str) {
    if let Some(set) = map.get_mut(from) {
        set.remove(to);
    }
}

fn insert_adjacent(map: &mut AdjacencyMap, from: &str, to: &str) {
    map.entry(from.to_string()).or_default().insert(to.to_string());
}

/// Evaluates every route a node advertises against the ACLs. Returns
/// false when the node must be dropped from the map (default mode with
/// a denied route).
fn check_node_routes(
    acls: &AclList,
    this_node: &MeshNode,
    node_id: &str,
    routes: Option<&Vec<Route>>,
    per_route_filtering: bool,
    denied: &mut BTreeSet<(String, String)>,
) -> bool {
    let Some(routes) = routes else {
        return true;
    };
    for route in routes {
        for cidr in &route.destination_cidrs {
            let src_cidr = match cidr {
                IpNet::V4(_) => this_node.private_ipv4.map(IpNet::V4),
                IpNet::V6(_) => this_node.private_ipv6.map(IpNet::V6),
            };
            let action = NetworkAction {
                src_node: this_node.id.clone(),
                dst_node: node_id.to_string(),
                src_cidr,
                dst_cidr: Some(*cidr),
            };
            if !acls.accept(&action) {
                debug!(
                    from = %this_node.id,
                    node = %node_id,
                    cidr = %cidr,
                    "route not allowed"
                );
                if per_route_filtering {
                    denied.insert((node_id.to_string(), cidr.to_string()));
                } else {
                    return false;
                }
            }
        }
    }
    true
}
