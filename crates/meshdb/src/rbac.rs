//! RBAC collection and evaluator.
//!
//! Roles, role bindings, groups, and users live under
//! `/registry/{roles,role-bindings,groups,users}/<name>`. The evaluator
//! answers whether an authenticated node may perform a verb on a
//! resource, walking every binding that applies to the node directly or
//! through a group.

use std::sync::Arc;
use std::time::Duration;

use webmesh_storage::{MeshStorage, StorageError};
use webmesh_types::{codec, Group, Role, RoleBinding, RuleResource, User, Verb};

use crate::error::MeshDbError;

/// Key prefix for roles.
pub const ROLES_PREFIX: &str = "/registry/roles";
/// Key prefix for role bindings.
pub const ROLE_BINDINGS_PREFIX: &str = "/registry/role-bindings";
/// Key prefix for groups.
pub const GROUPS_PREFIX: &str = "/registry/groups";
/// Key prefix for users.
pub const USERS_PREFIX: &str = "/registry/users";

/// The RBAC collection.
pub struct Rbac {
    storage: Arc<dyn MeshStorage>,
}

impl Rbac {
    pub(crate) fn new(storage: Arc<dyn MeshStorage>) -> Self {
        Self { storage }
    }

    async fn put_named<T: serde::Serialize>(
        &self,
        prefix: &str,
        name: &str,
        entity: &T,
    ) -> Result<(), MeshDbError> {
        if name.is_empty() {
            return Err(MeshDbError::InvalidEntity {
                message: "name must not be empty".to_string(),
            });
        }
        let doc = codec::encode(entity)
            .map_err(|e| MeshDbError::codec(format!("marshal {prefix}/{name}"), e))?;
        self.storage
            .put_value(&format!("{prefix}/{name}"), &doc, Duration::ZERO)
            .await
            .map_err(|e| MeshDbError::storage(format!("put {prefix}/{name}"), e))
    }

    async fn get_named<T: serde::de::DeserializeOwned>(
        &self,
        prefix: &str,
        name: &str,
    ) -> Result<Option<T>, MeshDbError> {
        let doc = match self.storage.get_value(&format!("{prefix}/{name}")).await {
            Ok(doc) => doc,
            Err(StorageError::KeyNotFound { .. }) => return Ok(None),
            Err(e) => return Err(MeshDbError::storage(format!("get {prefix}/{name}"), e)),
        };
        codec::decode(&doc)
            .map(Some)
            .map_err(|e| MeshDbError::codec(format!("unmarshal {prefix}/{name}"), e))
    }

    async fn list_under<T: serde::de::DeserializeOwned>(
        &self,
        prefix: &str,
    ) -> Result<Vec<T>, MeshDbError> {
        let pairs = self
            .storage
            .iter_prefix(&format!("{prefix}/"))
            .await
            .map_err(|e| MeshDbError::storage(format!("list {prefix}"), e))?;
        pairs
            .iter()
            .map(|(key, doc)| {
                codec::decode(doc).map_err(|e| MeshDbError::codec(format!("unmarshal {key}"), e))
            })
            .collect()
    }

    /// Creates or updates a role.
    pub async fn put_role(&self, role: &Role) -> Result<(), MeshDbError> {
        self.put_named(ROLES_PREFIX, &role.name, role).await
    }

    /// Returns a role by name.
    pub async fn get_role(&self, name: &str) -> Result<Role, MeshDbError> {
        self.get_named(ROLES_PREFIX, name)
            .await?
            .ok_or_else(|| MeshDbError::RoleNotFound {
                name: name.to_string(),
            })
    }

    /// Deletes a role by name.
    pub async fn delete_role(&self, name: &str) -> Result<(), MeshDbError> {
        self.storage
            .delete(&format!("{ROLES_PREFIX}/{name}"))
            .await
            .map_err(|e| MeshDbError::storage(format!("delete role {name}"), e))
    }

    /// Lists all roles.
    pub async fn list_roles(&self) -> Result<Vec<Role>, MeshDbError> {
        self.list_under(ROLES_PREFIX).await
    }

    /// Creates or updates a role binding.
    pub async fn put_role_binding(&self, binding: &RoleBinding) -> Result<(), MeshDbError> {
        self.put_named(ROLE_BINDINGS_PREFIX, &binding.name, binding)
            .await
    }

    /// Lists all role bindings.
    pub async fn list_role_bindings(&self) -> Result<Vec<RoleBinding>, MeshDbError> {
        self.list_under(ROLE_BINDINGS_PREFIX).await
    }

    /// Creates or updates a group.
    pub async fn put_group(&self, group: &Group) -> Result<(), MeshDbError> {
        self.put_named(GROUPS_PREFIX, &group.name, group).await
    }

    /// Returns a group by name.
    pub async fn get_group(&self, name: &str) -> Result<Option<Group>, MeshDbError> {
        self.get_named(GROUPS_PREFIX, name).await
    }

    /// Lists all groups.
    pub async fn list_groups(&self) -> Result<Vec<Group>, MeshDbError> {
        self.list_under(GROUPS_PREFIX).await
    }

    /// Creates or updates a user.
    pub async fn put_user(&self, user: &User) -> Result<(), MeshDbError> {
        self.put_named(USERS_PREFIX, &user.name, user).await
    }

    /// Lists all users.
    pub async fn list_users(&self) -> Result<Vec<User>, MeshDbError> {
        self.list_under(USERS_PREFIX).await
    }

    /// Node members of a group; unknown groups have no members.
    pub async fn group_node_members(&self, name: &str) -> Result<Vec<String>, MeshDbError> {
        let Some(group) = self.get_group(name).await? else {
            return Ok(Vec::new());
        };
        Ok(group
            .subjects
            .iter()
            .filter(|s| {
                matches!(
                    s.kind,
                    webmesh_types::SubjectKind::Node | webmesh_types::SubjectKind::All
                )
            })
            .map(|s| s.name.clone())
            .collect())
    }

    /// Returns the evaluator over this collection.
    pub fn evaluator(&self) -> RbacEvaluator {
        RbacEvaluator {
            rbac: Rbac::new(self.storage.clone()),
        }
    }
}

/// Answers authorization questions against the persisted RBAC state.
pub struct RbacEvaluator {
    rbac: Rbac,
}

impl RbacEvaluator {
    /// True if `node_id` may perform `verb` on `resource`, optionally
    /// scoped to `resource_name`.
    pub async fn evaluate(
        &self,
        node_id: &str,
        verb: Verb,
        resource: RuleResource,
        resource_name: &str,
    ) -> Result<bool, MeshDbError> {
        let bindings = self.rbac.list_role_bindings().await?;
        for binding in bindings {
            let mut applies = binding.contains_node(node_id);
            if !applies {
                for group_name in binding.group_names() {
                    if group_name == "*" {
                        applies = true;
                        break;
                    }
                    if let Some(group) = self.rbac.get_group(group_name).await? {
                        if group.contains_node(node_id) {
                            applies = true;
                            break;
                        }
                    }
                }
            }
            if !applies {
                continue;
            }

            let role = match self.rbac.get_role(&binding.role).await {
                Ok(role) => role,
                // A binding to a deleted role grants nothing.
                Err(MeshDbError::RoleNotFound { .. }) => continue,
                Err(e) => return Err(e),
            };
            if role
                .rules
                .iter()
                .any(|rule| rule.matches(verb, resource, resource_name))
            {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use webmesh_storage::MemoryBackend;
    use webmesh_types::{Rule, Subject, SubjectKind};

    use super::*;

    fn rbac() -> Rbac {
        Rbac::new(Arc::new(MemoryBackend::new()))
    }

    async fn seed_admin(rbac: &Rbac, node: &str) {
        rbac.put_role(&Role {
            name: "admin".to_string(),
            rules: vec![Rule {
                verbs: vec![Verb::All],
                resources: vec![RuleResource::All],
                resource_names: vec![],
            }],
        })
        .await
        .expect("role");
        rbac.put_role_binding(&RoleBinding {
            name: "admins".to_string(),
            role: "admin".to_string(),
            subjects: vec![Subject {
                kind: SubjectKind::Node,
                name: node.to_string(),
            }],
        })
        .await
        .expect("binding");
    }

    #[tokio::test]
    async fn test_direct_binding_grants() {
        let rbac = rbac();
        seed_admin(&rbac, "n1").await;
        let evaluator = rbac.evaluator();

        assert!(evaluator
            .evaluate("n1", Verb::Put, RuleResource::DataChannels, "")
            .await
            .expect("evaluate"));
        assert!(!evaluator
            .evaluate("n2", Verb::Put, RuleResource::DataChannels, "")
            .await
            .expect("evaluate"));
    }

    #[tokio::test]
    async fn test_group_binding_grants() {
        let rbac = rbac();
        rbac.put_role(&Role {
            name: "joiner".to_string(),
            rules: vec![Rule {
                verbs: vec![Verb::Put],
                resources: vec![RuleResource::DataChannels, RuleResource::Votes],
                resource_names: vec![],
            }],
        })
        .await
        .expect("role");
        rbac.put_group(&Group {
            name: "voters".to_string(),
            subjects: vec![Subject {
                kind: SubjectKind::Node,
                name: "n3".to_string(),
            }],
        })
        .await
        .expect("group");
        rbac.put_role_binding(&RoleBinding {
            name: "voters-can-join".to_string(),
            role: "joiner".to_string(),
            subjects: vec![Subject {
                kind: SubjectKind::Group,
                name: "voters".to_string(),
            }],
        })
        .await
        .expect("binding");

        let evaluator = rbac.evaluator();
        assert!(evaluator
            .evaluate("n3", Verb::Put, RuleResource::Votes, "")
            .await
            .expect("evaluate"));
        assert!(!evaluator
            .evaluate("n3", Verb::Delete, RuleResource::Votes, "")
            .await
            .expect("evaluate"));
        assert!(!evaluator
            .evaluate("stranger", Verb::Put, RuleResource::Votes, "")
            .await
            .expect("evaluate"));
    }

    #[tokio::test]
    async fn test_binding_to_missing_role_grants_nothing() {
        let rbac = rbac();
        rbac.put_role_binding(&RoleBinding {
            name: "dangling".to_string(),
            role: "gone".to_string(),
            subjects: vec![Subject {
                kind: SubjectKind::Node,
                name: "n1".to_string(),
            }],
        })
        .await
        .expect("binding");

        assert!(!rbac
            .evaluator()
            .evaluate("n1", Verb::Get, RuleResource::Peers, "")
            .await
            .expect("evaluate"));
    }

    #[tokio::test]
    async fn test_group_members() {
        let rbac = rbac();
        rbac.put_group(&Group {
            name: "ops".to_string(),
            subjects: vec![
                Subject {
                    kind: SubjectKind::Node,
                    name: "a".to_string(),
                },
                Subject {
                    kind: SubjectKind::User,
                    name: "human".to_string(),
                },
            ],
        })
        .await
        .expect("group");

        assert_eq!(
            rbac.group_node_members("ops").await.expect("members"),
            vec!["a".to_string()]
        );
        assert!(rbac
            .group_node_members("missing")
            .await
            .expect("members")
            .is_empty());
    }
}
