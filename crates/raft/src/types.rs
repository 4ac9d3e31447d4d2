//! Core types for OpenRaft integration.

use std::fmt;
use std::io::Cursor;

use openraft::impls::OneshotResponder;
use openraft::BasicNode;
use serde::{Deserialize, Serialize};

use webmesh_types::RaftNodeId;

// Type parameters:
// - `D`: application data (MeshRequest)
// - `R`: application response (MeshResponse)
// - `NodeId`: u64 derived from the mesh node name
// - `Node`: BasicNode carrying the node's advertised address
// - `SnapshotData`: in-memory cursor over the framed snapshot stream
openraft::declare_raft_types!(
    /// WebMesh raft type configuration.
    pub MeshTypeConfig:
        D = MeshRequest,
        R = MeshResponse,
        NodeId = RaftNodeId,
        Node = BasicNode,
        Entry = openraft::Entry<MeshTypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = openraft::TokioRuntime,
        Responder = OneshotResponder<MeshTypeConfig>
);

/// A storage mutation proposed through the raft log.
///
/// The state machine interprets each committed entry as one of these
/// operations and applies it to the key/value backend. Application must
/// be deterministic: any timestamps inside `value` are filled by the
/// proposer, never by the applier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeshRequest {
    /// Write `value` at `key` with a time-to-live in seconds (0 = none).
    Put {
        /// Target key.
        key: String,
        /// Value to store.
        value: String,
        /// Time-to-live in seconds; zero means no expiry.
        ttl_seconds: u64,
    },

    /// Remove `key`.
    Delete {
        /// Target key.
        key: String,
    },

    /// Remove every key under `prefix`.
    DeletePrefix {
        /// Target prefix.
        prefix: String,
    },
}

impl MeshRequest {
    /// The key or prefix the request targets.
    pub fn target(&self) -> &str {
        match self {
            MeshRequest::Put { key, .. } | MeshRequest::Delete { key } => key,
            MeshRequest::DeletePrefix { prefix } => prefix,
        }
    }
}

/// Response from the raft state machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeshResponse {
    /// The entry was applied.
    #[default]
    Applied,
}

impl fmt::Display for MeshResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeshResponse::Applied => write!(f, "Applied"),
        }
    }
}
