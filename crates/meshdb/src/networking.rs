//! Network ACLs and routes.
//!
//! Interfaces to the database models for network resources, adapted
//! from the mesh registry layout: ACLs under
//! `/registry/network-acls/<name>`, routes under
//! `/registry/routes/<name>`.

use std::sync::Arc;
use std::time::Duration;

use ipnet::IpNet;
use webmesh_storage::{MeshStorage, StorageError};
use webmesh_types::{codec, NetworkAcl, Route};

use crate::acls::{AclList, GROUP_REFERENCE};
use crate::error::MeshDbError;
use crate::rbac::Rbac;

/// Name of the system-managed bootstrap nodes ACL: created once at
/// bootstrap, immutable afterwards.
pub const BOOTSTRAP_NODES_ACL_NAME: &str = "bootstrap-nodes";

/// Key prefix for network ACLs.
pub const NETWORK_ACLS_PREFIX: &str = "/registry/network-acls";

/// Key prefix for routes.
pub const ROUTES_PREFIX: &str = "/registry/routes";

/// Returns true if the named ACL is system-managed.
pub fn is_system_acl(name: &str) -> bool {
    name == BOOTSTRAP_NODES_ACL_NAME
}

/// The name of the route the core manages on behalf of a node.
pub fn node_auto_route(node_id: &str) -> String {
    format!("{node_id}-auto")
}

fn acl_key(name: &str) -> String {
    format!("{NETWORK_ACLS_PREFIX}/{name}")
}

fn route_key(name: &str) -> String {
    format!("{ROUTES_PREFIX}/{name}")
}

/// The network resources collection.
pub struct Networking {
    storage: Arc<dyn MeshStorage>,
}

impl Networking {
    pub(crate) fn new(storage: Arc<dyn MeshStorage>) -> Self {
        Self { storage }
    }

    /// Creates or updates a network ACL. System ACLs may be created
    /// once and never updated.
    pub async fn put_network_acl(&self, acl: &NetworkAcl) -> Result<(), MeshDbError> {
        if acl.name.is_empty() {
            return Err(MeshDbError::InvalidEntity {
                message: "network acl name must not be empty".to_string(),
            });
        }
        for selector in acl.source_cidrs.iter().chain(&acl.destination_cidrs) {
            if selector != "*" && selector.parse::<IpNet>().is_err() {
                return Err(MeshDbError::InvalidEntity {
                    message: format!("network acl {} has malformed cidr {selector}", acl.name),
                });
            }
        }
        if is_system_acl(&acl.name) {
            match self.get_network_acl(&acl.name).await {
                Ok(_) => return Err(MeshDbError::SystemAcl {
                    name: acl.name.clone(),
                }),
                Err(MeshDbError::AclNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        let doc = codec::encode(acl)
            .map_err(|e| MeshDbError::codec(format!("marshal network acl {}", acl.name), e))?;
        self.storage
            .put_value(&acl_key(&acl.name), &doc, Duration::ZERO)
            .await
            .map_err(|e| MeshDbError::storage(format!("put network acl {}", acl.name), e))
    }

    /// Returns a network ACL by name.
    pub async fn get_network_acl(&self, name: &str) -> Result<NetworkAcl, MeshDbError> {
        let doc = match self.storage.get_value(&acl_key(name)).await {
            Ok(doc) => doc,
            Err(StorageError::KeyNotFound { .. }) => {
                return Err(MeshDbError::AclNotFound {
                    name: name.to_string(),
                })
            }
            Err(e) => return Err(MeshDbError::storage(format!("get network acl {name}"), e)),
        };
        codec::decode(&doc)
            .map_err(|e| MeshDbError::codec(format!("unmarshal network acl {name}"), e))
    }

    /// Deletes a network ACL. System ACLs cannot be deleted.
    pub async fn delete_network_acl(&self, name: &str) -> Result<(), MeshDbError> {
        if is_system_acl(name) {
            return Err(MeshDbError::SystemAcl {
                name: name.to_string(),
            });
        }
        self.storage
            .delete(&acl_key(name))
            .await
            .map_err(|e| MeshDbError::storage(format!("delete network acl {name}"), e))
    }

    /// Lists all ACLs sorted for evaluation (descending priority, then
    /// ascending name) with group references expanded.
    pub async fn list_network_acls(&self) -> Result<AclList, MeshDbError> {
        let pairs = self
            .storage
            .iter_prefix(&format!("{NETWORK_ACLS_PREFIX}/"))
            .await
            .map_err(|e| MeshDbError::storage("list network acls", e))?;
        let acls: Vec<NetworkAcl> = pairs
            .iter()
            .map(|(key, doc)| {
                codec::decode(doc).map_err(|e| MeshDbError::codec(format!("unmarshal {key}"), e))
            })
            .collect::<Result<_, _>>()?;

        // Resolve group memberships once for the whole list.
        let rbac = Rbac::new(self.storage.clone());
        let mut groups = std::collections::BTreeMap::new();
        for acl in &acls {
            for selector in acl.source_nodes.iter().chain(&acl.destination_nodes) {
                if let Some(group) = selector.strip_prefix(GROUP_REFERENCE) {
                    if !groups.contains_key(group) {
                        let members = rbac.group_node_members(group).await?;
                        groups.insert(group.to_string(), members);
                    }
                }
            }
        }

        Ok(AclList::expand(acls, |group| {
            groups.get(group).cloned().unwrap_or_default()
        }))
    }

    /// Creates or updates a route.
    pub async fn put_route(&self, route: &Route) -> Result<(), MeshDbError> {
        if route.name.is_empty() || route.node.is_empty() {
            return Err(MeshDbError::InvalidEntity {
                message: "route name and node must not be empty".to_string(),
            });
        }
        let doc = codec::encode(route)
            .map_err(|e| MeshDbError::codec(format!("marshal route {}", route.name), e))?;
        self.storage
            .put_value(&route_key(&route.name), &doc, Duration::ZERO)
            .await
            .map_err(|e| {
                MeshDbError::storage(format!("put route {} for node {}", route.name, route.node), e)
            })
    }

    /// Returns a route by name.
    pub async fn get_route(&self, name: &str) -> Result<Route, MeshDbError> {
        let doc = match self.storage.get_value(&route_key(name)).await {
            Ok(doc) => doc,
            Err(StorageError::KeyNotFound { .. }) => {
                return Err(MeshDbError::RouteNotFound {
                    name: name.to_string(),
                })
            }
            Err(e) => return Err(MeshDbError::storage(format!("get route {name}"), e)),
        };
        codec::decode(&doc).map_err(|e| MeshDbError::codec(format!("unmarshal route {name}"), e))
    }

    /// Deletes a route by name.
    pub async fn delete_route(&self, name: &str) -> Result<(), MeshDbError> {
        self.storage
            .delete(&route_key(name))
            .await
            .map_err(|e| MeshDbError::storage(format!("delete route {name}"), e))
    }

    /// Lists all routes in name order.
    pub async fn list_routes(&self) -> Result<Vec<Route>, MeshDbError> {
        let pairs = self
            .storage
            .iter_prefix(&format!("{ROUTES_PREFIX}/"))
            .await
            .map_err(|e| MeshDbError::storage("list routes", e))?;
        pairs
            .iter()
            .map(|(key, doc)| {
                codec::decode(doc).map_err(|e| MeshDbError::codec(format!("unmarshal {key}"), e))
            })
            .collect()
    }

    /// Routes advertised by a given node.
    pub async fn get_routes_by_node(&self, node_id: &str) -> Result<Vec<Route>, MeshDbError> {
        Ok(self
            .list_routes()
            .await?
            .into_iter()
            .filter(|r| r.node == node_id)
            .collect())
    }

    /// Routes whose destinations fall inside the given prefix.
    pub async fn get_routes_by_cidr(&self, cidr: &IpNet) -> Result<Vec<Route>, MeshDbError> {
        Ok(self
            .list_routes()
            .await?
            .into_iter()
            .filter(|r| {
                r.destination_cidrs
                    .iter()
                    .any(|dst| cidr.contains(&dst.addr()))
            })
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use webmesh_storage::MemoryBackend;
    use webmesh_types::AclAction;

    use super::*;

    fn networking() -> Networking {
        Networking::new(Arc::new(MemoryBackend::new()))
    }

    fn acl(name: &str, priority: i32) -> NetworkAcl {
        NetworkAcl {
            name: name.to_string(),
            priority,
            action: AclAction::Accept,
            source_nodes: vec!["*".to_string()],
            destination_nodes: vec!["*".to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_acl_crud() {
        let nw = networking();
        nw.put_network_acl(&acl("allow-all", 0)).await.expect("put");
        assert_eq!(
            nw.get_network_acl("allow-all").await.expect("get").priority,
            0
        );
        nw.delete_network_acl("allow-all").await.expect("delete");
        assert!(matches!(
            nw.get_network_acl("allow-all").await,
            Err(MeshDbError::AclNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_system_acl_create_once() {
        let nw = networking();
        nw.put_network_acl(&acl(BOOTSTRAP_NODES_ACL_NAME, 100))
            .await
            .expect("first create allowed");
        assert!(matches!(
            nw.put_network_acl(&acl(BOOTSTRAP_NODES_ACL_NAME, 50)).await,
            Err(MeshDbError::SystemAcl { .. })
        ));
        assert!(matches!(
            nw.delete_network_acl(BOOTSTRAP_NODES_ACL_NAME).await,
            Err(MeshDbError::SystemAcl { .. })
        ));
    }

    #[tokio::test]
    async fn test_acl_rejects_malformed_cidr() {
        let nw = networking();
        let mut bad = acl("bad", 0);
        bad.source_cidrs = vec!["not-a-cidr".to_string()];
        assert!(matches!(
            nw.put_network_acl(&bad).await,
            Err(MeshDbError::InvalidEntity { .. })
        ));
    }

    #[tokio::test]
    async fn test_list_sorted_by_priority_then_name() {
        let nw = networking();
        nw.put_network_acl(&acl("b", 10)).await.expect("put");
        nw.put_network_acl(&acl("a", 10)).await.expect("put");
        nw.put_network_acl(&acl("z", 100)).await.expect("put");

        let list = nw.list_network_acls().await.expect("list");
        let names: Vec<&str> = list.rules().iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["z", "a", "b"]);
    }

    #[tokio::test]
    async fn test_routes_by_node_and_cidr() {
        let nw = networking();
        nw.put_route(&Route {
            name: node_auto_route("n1"),
            node: "n1".to_string(),
            destination_cidrs: vec!["10.10.0.0/16".parse().unwrap()],
        })
        .await
        .expect("put");
        nw.put_route(&Route {
            name: "lab".to_string(),
            node: "n2".to_string(),
            destination_cidrs: vec!["10.20.0.0/16".parse().unwrap()],
        })
        .await
        .expect("put");

        let by_node = nw.get_routes_by_node("n1").await.expect("by node");
        assert_eq!(by_node.len(), 1);
        assert_eq!(by_node[0].name, "n1-auto");

        let by_cidr = nw
            .get_routes_by_cidr(&"10.20.0.0/14".parse().unwrap())
            .await
            .expect("by cidr");
        assert_eq!(by_cidr.len(), 1);
        assert_eq!(by_cidr[0].node, "n2");
    }
}
