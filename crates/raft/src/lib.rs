//! Raft consensus for WebMesh.
//!
//! This crate provides:
//! - OpenRaft integration over the webmesh-storage key/value backend
//! - Combined `RaftStorage` implementation (log store + state machine)
//! - Snapshot materialization with configurable framing and retention
//! - The gRPC raft transport between nodes
//! - The [`MeshRaft`] node wrapper and leadership observer
//! - The consensus-backed [`ConsensusStorage`] mesh storage facade
//!
//! ## Architecture Note
//!
//! OpenRaft 0.9 seals the v2 `RaftLogStorage`/`RaftStateMachine` traits.
//! We use the deprecated but non-sealed `RaftStorage` trait, which
//! combines log storage and the state machine in one implementation,
//! split for the runtime by `openraft::storage::Adaptor`.

#![deny(unsafe_code)]
// gRPC services return tonic::Status by value - standard practice
#![allow(clippy::result_large_err)]

mod codec;
pub mod error;
mod log_storage;
mod node;
mod raft_network;
pub mod services;
mod snapshot;
mod storage_facade;
mod types;

pub use codec::{SnapshotCodec, SnapshotCodecError, SnapshotPayload, SNAPSHOT_FORMAT_VERSION};
pub use error::ConsensusError;
pub use log_storage::MeshLogStore;
pub use node::{MeshEvent, MeshRaft};
pub use raft_network::{GrpcRaftNetwork, GrpcRaftNetworkFactory};
pub use snapshot::{SnapshotStore, StoredSnapshot};
pub use storage_facade::ConsensusStorage;
pub use types::{MeshRequest, MeshResponse, MeshTypeConfig};

pub use webmesh_types::RaftNodeId;
