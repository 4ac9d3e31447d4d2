//! Error types for the consensus layer using snafu.
//!
//! OpenRaft's error types carry complex generic bounds that interact
//! poorly with derive macros, so raft failures are captured as messages
//! while the semantically interesting conditions get their own variants.

use std::time::Duration;

use snafu::Snafu;
use webmesh_storage::StorageError;

/// Errors from the raft node and consensus-backed storage.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConsensusError {
    /// The operation requires the leader and this node is not it.
    #[snafu(display("not the raft leader"))]
    NotLeader {
        /// Address of the current leader, when known.
        leader: Option<String>,
    },

    /// No leader is currently elected.
    #[snafu(display("no raft leader elected"))]
    NoLeader,

    /// Bootstrap was attempted on a node whose log is not empty.
    #[snafu(display("raft node is already bootstrapped"))]
    AlreadyBootstrapped,

    /// A proposal did not commit and apply in time.
    #[snafu(display("apply timed out after {timeout:?}"))]
    ApplyTimeout {
        /// The configured apply timeout.
        timeout: Duration,
    },

    /// The node has been closed.
    #[snafu(display("raft node is closed"))]
    Closed,

    /// The local store refused to open.
    #[snafu(display("open raft store: {source}"))]
    Store {
        /// Underlying storage error.
        source: StorageError,
    },

    /// The configured log format does not match the store on disk.
    #[snafu(display("log format mismatch: store was written as {stored}, configured {configured}"))]
    FormatMismatch {
        /// Format recorded in the store header.
        stored: String,
        /// Format in the node configuration.
        configured: String,
    },

    /// Any other raft failure, captured as text.
    #[snafu(display("raft: {message}"))]
    Raft {
        /// Error text from openraft.
        message: String,
    },
}

impl ConsensusError {
    /// Creates a raft error from any openraft error value.
    pub fn raft<E: std::fmt::Display>(err: E) -> Self {
        ConsensusError::Raft {
            message: err.to_string(),
        }
    }
}

impl From<ConsensusError> for StorageError {
    fn from(err: ConsensusError) -> Self {
        match err {
            ConsensusError::NotLeader { leader } => StorageError::NotLeader { leader },
            ConsensusError::NoLeader => StorageError::NoLeader,
            ConsensusError::ApplyTimeout { timeout } => StorageError::ApplyTimeout { timeout },
            ConsensusError::Closed => StorageError::Closed,
            ConsensusError::Store { source } => source,
            other => StorageError::Io {
                message: other.to_string(),
            },
        }
    }
}
