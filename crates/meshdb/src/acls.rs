//! Network ACL evaluation.
//!
//! ACLs are walked in descending priority (ties broken by ascending
//! name); the first matching rule decides, and the default verdict is
//! DENY. Node selectors may reference RBAC groups via `group:<name>`,
//! expanded once before evaluation.

use ipnet::IpNet;
use webmesh_types::{AclAction, NetworkAcl};

/// Group selector prefix inside ACL node lists.
pub const GROUP_REFERENCE: &str = "group:";

/// A concrete traffic tuple evaluated against the ACL list.
#[derive(Debug, Clone, Default)]
pub struct NetworkAction {
    /// Source node id.
    pub src_node: String,
    /// Destination node id.
    pub dst_node: String,
    /// Source prefix, when known.
    pub src_cidr: Option<IpNet>,
    /// Destination prefix, when known.
    pub dst_cidr: Option<IpNet>,
}

/// An ACL list sorted for evaluation, with group references expanded.
#[derive(Debug, Clone, Default)]
pub struct AclList {
    acls: Vec<NetworkAcl>,
}

impl AclList {
    /// Builds the evaluation list from raw ACLs and a group resolver.
    ///
    /// `resolve_group` maps a group name to its member node ids; unknown
    /// groups expand to nothing. Expansion happens exactly once here.
    pub fn expand<F>(mut acls: Vec<NetworkAcl>, resolve_group: F) -> Self
    where
        F: Fn(&str) -> Vec<String>,
    {
        for acl in &mut acls {
            acl.source_nodes = expand_selectors(&acl.source_nodes, &resolve_group);
            acl.destination_nodes = expand_selectors(&acl.destination_nodes, &resolve_group);
        }
        acls.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.name.cmp(&b.name))
        });
        Self { acls }
    }

    /// The sorted, expanded rules.
    pub fn rules(&self) -> &[NetworkAcl] {
        &self.acls
    }

    /// Evaluates an action: first match wins, default DENY.
    pub fn accept(&self, action: &NetworkAction) -> bool {
        for acl in &self.acls {
            if acl_matches(acl, action) {
                return acl.action == AclAction::Accept;
            }
        }
        false
    }

    /// True if traffic between the two nodes' private addresses is
    /// accepted.
    pub fn allow_nodes_to_communicate(
        &self,
        src: &webmesh_types::MeshNode,
        dst: &webmesh_types::MeshNode,
    ) -> bool {
        let action = NetworkAction {
            src_node: src.id.clone(),
            dst_node: dst.id.clone(),
            src_cidr: node_prefix(src),
            dst_cidr: node_prefix(dst),
        };
        self.accept(&action)
    }
}

fn node_prefix(node: &webmesh_types::MeshNode) -> Option<IpNet> {
    node.private_ipv4
        .map(IpNet::V4)
        .or(node.private_ipv6.map(IpNet::V6))
}

fn expand_selectors<F>(selectors: &[String], resolve_group: &F) -> Vec<String>
where
    F: Fn(&str) -> Vec<String>,
{
    let mut out = Vec::new();
    for selector in selectors {
        match selector.strip_prefix(GROUP_REFERENCE) {
            Some(group) => {
                for member in resolve_group(group) {
                    if !out.contains(&member) {
                        out.push(member);
                    }
                }
            }
            None => {
                if !out.contains(selector) {
                    out.push(selector.clone());
                }
            }
        }
    }
    out
}

fn acl_matches(acl: &NetworkAcl, action: &NetworkAction) -> bool {
    node_selector_matches(&acl.source_nodes, &action.src_node)
        && node_selector_matches(&acl.destination_nodes, &action.dst_node)
        && cidr_selector_matches(&acl.source_cidrs, action.src_cidr.as_ref())
        && cidr_selector_matches(&acl.destination_cidrs, action.dst_cidr.as_ref())
}

fn node_selector_matches(selectors: &[String], node: &str) -> bool {
    if selectors.is_empty() {
        return true;
    }
    selectors.iter().any(|s| s == "*" || s == node)
}

fn cidr_selector_matches(selectors: &[String], cidr: Option<&IpNet>) -> bool {
    if selectors.is_empty() {
        return true;
    }
    let Some(cidr) = cidr else {
        // A cidr-scoped rule cannot match an action without addresses.
        return selectors.iter().any(|s| s == "*");
    };
    selectors.iter().any(|s| {
        if s == "*" {
            return true;
        }
        s.parse::<IpNet>()
            .map(|selector| selector.contains(&cidr.addr()))
            .unwrap_or(false)
    })
}
