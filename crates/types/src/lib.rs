//! Shared domain types for the WebMesh core.
//!
//! This crate provides:
//! - Mesh registry entities (peers, edges, leases, ACLs, routes, RBAC)
//! - The entity codec (JSON documents, one per registry key)
//! - Configuration types with validation

#![deny(unsafe_code)]

pub mod codec;
pub mod config;
mod entities;
mod node_id;
mod rbac;

pub use codec::{decode, encode, CodecError};
pub use config::{ConfigError, LogFormat, MeshConfig, RaftConfig};
pub use entities::{
    AclAction, FeaturePort, Lease, MeshEdge, MeshNode, NetworkAcl, Route, WireGuardPeer,
};
pub use node_id::{raft_node_id, RaftNodeId};
pub use rbac::{Group, Role, RoleBinding, Rule, RuleResource, Subject, SubjectKind, User, Verb};
