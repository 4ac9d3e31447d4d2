//! Error types for the storage layer using snafu.
//!
//! The same error enum is shared by backends and the consensus-backed
//! facade so that callers match on one taxonomy. Variants map onto the
//! boundary kinds: `NotLeader`/`NoLeader` are routed, `ApplyTimeout` is
//! transient, `InvalidArgument`/`ReservedPrefix` are validation, the
//! rest are state or fatal.

use std::time::Duration;

use snafu::Snafu;

/// Errors from key/value storage and the mesh storage facade.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// The requested key does not exist.
    #[snafu(display("key not found: {key}"))]
    KeyNotFound {
        /// The missing key.
        key: String,
    },

    /// A user write targeted a reserved prefix.
    #[snafu(display("write to reserved prefix: {key}"))]
    ReservedPrefix {
        /// The rejected key.
        key: String,
    },

    /// A malformed request argument.
    #[snafu(display("invalid argument: {message}"))]
    InvalidArgument {
        /// What was malformed.
        message: String,
    },

    /// The underlying store failed.
    #[snafu(display("storage i/o: {message}"))]
    Io {
        /// Backend error text.
        message: String,
    },

    /// A stored record failed to decode.
    #[snafu(display("decode stored value at {key}: {message}"))]
    Decode {
        /// The key whose value was corrupt.
        key: String,
        /// Decoder error text.
        message: String,
    },

    /// The store has been closed.
    #[snafu(display("storage is closed"))]
    Closed,

    /// A write was attempted on a node that is not the leader.
    #[snafu(display("not the raft leader"))]
    NotLeader {
        /// Address of the current leader, when known.
        leader: Option<String>,
    },

    /// No leader is currently elected.
    #[snafu(display("no leader elected"))]
    NoLeader,

    /// A proposal did not commit and apply within the configured window.
    #[snafu(display("apply timed out after {timeout:?}"))]
    ApplyTimeout {
        /// The configured apply timeout.
        timeout: Duration,
    },
}

impl StorageError {
    /// Creates an i/o error from any error value.
    pub fn io<E: std::fmt::Display>(err: E) -> Self {
        StorageError::Io {
            message: err.to_string(),
        }
    }

    /// Returns true if a caller should retry the operation after a
    /// backoff (transient cluster conditions).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::NoLeader | StorageError::ApplyTimeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = StorageError::KeyNotFound {
            key: "/registry/nodes/n1".to_string(),
        };
        assert_eq!(err.to_string(), "key not found: /registry/nodes/n1");
    }

    #[test]
    fn test_transient_classification() {
        assert!(StorageError::NoLeader.is_transient());
        assert!(StorageError::ApplyTimeout {
            timeout: Duration::from_secs(10)
        }
        .is_transient());
        assert!(!StorageError::Closed.is_transient());
        assert!(!StorageError::ReservedPrefix {
            key: "/raft/x".to_string()
        }
        .is_transient());
    }
}
