//! RBAC entities and rule matching.
//!
//! Roles grant verbs over resources; role bindings attach roles to
//! subjects (nodes, users, groups). The wildcard `*` matches any verb,
//! resource, or resource name. Evaluation itself lives in the meshdb
//! crate; this module only defines the persisted shapes and the per-rule
//! match logic.

use serde::{Deserialize, Serialize};

/// A verb a rule can grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verb {
    /// Matches any verb.
    #[serde(rename = "*")]
    All,
    /// Create or update.
    Put,
    /// Read.
    Get,
    /// Delete.
    Delete,
}

/// A resource class a rule can grant access to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleResource {
    /// Matches any resource.
    #[serde(rename = "*")]
    All,
    /// Peer records.
    Peers,
    /// Edges between peers.
    Edges,
    /// Network ACLs.
    NetworkAcls,
    /// Routes.
    Routes,
    /// Mesh data channels.
    DataChannels,
    /// Consensus votes (joining as a voter).
    Votes,
    /// Roles.
    Roles,
    /// Role bindings.
    RoleBindings,
    /// Groups.
    Groups,
    /// Users.
    Users,
}

/// A single grant inside a role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Granted verbs.
    #[serde(default)]
    pub verbs: Vec<Verb>,
    /// Granted resource classes.
    #[serde(default)]
    pub resources: Vec<RuleResource>,
    /// Specific resource names; empty grants all names.
    #[serde(default)]
    pub resource_names: Vec<String>,
}

impl Rule {
    /// Returns true if this rule grants `verb` on `resource` with the
    /// given resource name (`""` when the action is not name-scoped).
    pub fn matches(&self, verb: Verb, resource: RuleResource, resource_name: &str) -> bool {
        let verb_ok = self.verbs.iter().any(|v| *v == Verb::All || *v == verb);
        let resource_ok = self
            .resources
            .iter()
            .any(|r| *r == RuleResource::All || *r == resource);
        let name_ok = self.resource_names.is_empty()
            || resource_name.is_empty()
            || self
                .resource_names
                .iter()
                .any(|n| n == "*" || n == resource_name);
        verb_ok && resource_ok && name_ok
    }
}

/// A named set of rules, stored at `/registry/roles/<name>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    /// Unique role name.
    pub name: String,
    /// Grants carried by the role.
    #[serde(default)]
    pub rules: Vec<Rule>,
}

/// The kind of principal a subject refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectKind {
    /// Matches any principal.
    #[serde(rename = "*")]
    All,
    /// A mesh node.
    Node,
    /// A human or machine user.
    User,
    /// A named group.
    Group,
}

/// A principal referenced by a role binding or group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    /// Principal kind.
    pub kind: SubjectKind,
    /// Principal name; `*` matches any name of the kind.
    pub name: String,
}

/// Attaches a role to subjects, stored at
/// `/registry/role-bindings/<name>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleBinding {
    /// Unique binding name.
    pub name: String,
    /// Referenced role.
    pub role: String,
    /// Principals the role applies to.
    #[serde(default)]
    pub subjects: Vec<Subject>,
}

impl RoleBinding {
    /// Returns true if the binding applies to the named node, directly or
    /// via the wildcard subject.
    pub fn contains_node(&self, node_id: &str) -> bool {
        self.subjects.iter().any(|s| match s.kind {
            SubjectKind::All => true,
            SubjectKind::Node | SubjectKind::User => s.name == "*" || s.name == node_id,
            SubjectKind::Group => false,
        })
    }

    /// Group names the binding applies to.
    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.subjects
            .iter()
            .filter(|s| s.kind == SubjectKind::Group)
            .map(|s| s.name.as_str())
    }
}

/// A named set of subjects, stored at `/registry/groups/<name>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Unique group name.
    pub name: String,
    /// Group members.
    #[serde(default)]
    pub subjects: Vec<Subject>,
}

impl Group {
    /// Returns true if the group contains the named node.
    pub fn contains_node(&self, node_id: &str) -> bool {
        self.subjects.iter().any(|s| {
            matches!(s.kind, SubjectKind::Node | SubjectKind::All)
                && (s.name == "*" || s.name == node_id)
        })
    }
}

/// A registered user, stored at `/registry/users/<name>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Unique user name.
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(verbs: Vec<Verb>, resources: Vec<RuleResource>) -> Rule {
        Rule {
            verbs,
            resources,
            resource_names: vec![],
        }
    }

    #[test]
    fn test_rule_exact_match() {
        let r = rule(vec![Verb::Put], vec![RuleResource::DataChannels]);
        assert!(r.matches(Verb::Put, RuleResource::DataChannels, ""));
        assert!(!r.matches(Verb::Get, RuleResource::DataChannels, ""));
        assert!(!r.matches(Verb::Put, RuleResource::Routes, ""));
    }

    #[test]
    fn test_rule_wildcards() {
        let r = rule(vec![Verb::All], vec![RuleResource::All]);
        assert!(r.matches(Verb::Delete, RuleResource::Votes, "anything"));
    }

    #[test]
    fn test_rule_resource_names() {
        let r = Rule {
            verbs: vec![Verb::Put],
            resources: vec![RuleResource::Routes],
            resource_names: vec!["n1-auto".to_string()],
        };
        assert!(r.matches(Verb::Put, RuleResource::Routes, "n1-auto"));
        assert!(!r.matches(Verb::Put, RuleResource::Routes, "n2-auto"));
        // Not name-scoped: names are ignored.
        assert!(r.matches(Verb::Put, RuleResource::Routes, ""));
    }

    #[test]
    fn test_binding_contains_node() {
        let binding = RoleBinding {
            name: "admins".to_string(),
            role: "admin".to_string(),
            subjects: vec![Subject {
                kind: SubjectKind::Node,
                name: "n1".to_string(),
            }],
        };
        assert!(binding.contains_node("n1"));
        assert!(!binding.contains_node("n2"));
    }

    #[test]
    fn test_group_wildcard_member() {
        let group = Group {
            name: "everyone".to_string(),
            subjects: vec![Subject {
                kind: SubjectKind::Node,
                name: "*".to_string(),
            }],
        };
        assert!(group.contains_node("anybody"));
    }
}
