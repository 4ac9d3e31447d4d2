//! Raft node identity derivation.
//!
//! Mesh nodes are addressed by string names everywhere in the registry,
//! but the consensus layer requires compact `u64` identifiers. The raft
//! id of a node is derived deterministically from its name so that every
//! member of the cluster computes the same mapping without coordination.

use sha2::{Digest, Sha256};

/// Node identifier used by the consensus layer.
pub type RaftNodeId = u64;

/// Derives the raft node id for a mesh node name.
///
/// Takes the first eight bytes of `SHA-256(name)` interpreted big-endian.
/// The mapping is stable across releases; changing it would split any
/// existing cluster.
pub fn raft_node_id(name: &str) -> RaftNodeId {
    let digest = Sha256::digest(name.as_bytes());
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(buf)
}
