//! Error types for the mesh database using snafu.

use snafu::Snafu;
use webmesh_storage::StorageError;
use webmesh_types::CodecError;

/// Errors from the typed mesh collections.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MeshDbError {
    /// A referenced node does not exist.
    #[snafu(display("node not found: {id}"))]
    NodeNotFound {
        /// The missing node id.
        id: String,
    },

    /// A referenced network ACL does not exist.
    #[snafu(display("network acl not found: {name}"))]
    AclNotFound {
        /// The missing ACL name.
        name: String,
    },

    /// A referenced route does not exist.
    #[snafu(display("route not found: {name}"))]
    RouteNotFound {
        /// The missing route name.
        name: String,
    },

    /// A referenced role does not exist.
    #[snafu(display("role not found: {name}"))]
    RoleNotFound {
        /// The missing role name.
        name: String,
    },

    /// A system-managed ACL was targeted by an update or delete.
    #[snafu(display("cannot modify system network acl {name}"))]
    SystemAcl {
        /// The protected ACL name.
        name: String,
    },

    /// A mesh state field was written twice with different values.
    #[snafu(display("mesh state {field} is already set"))]
    StateAlreadySet {
        /// The immutable field.
        field: String,
    },

    /// A malformed entity or argument.
    #[snafu(display("invalid argument: {message}"))]
    InvalidEntity {
        /// What was malformed.
        message: String,
    },

    /// The storage layer failed.
    #[snafu(display("{context}: {source}"))]
    Storage {
        /// Short operation context.
        context: String,
        /// Underlying storage error.
        source: StorageError,
    },

    /// A stored document failed to decode.
    #[snafu(display("{context}: {source}"))]
    Codec {
        /// Short operation context.
        context: String,
        /// Underlying codec error.
        source: CodecError,
    },
}

impl MeshDbError {
    /// Wraps a storage error with a short operation context.
    pub fn storage(context: impl Into<String>, source: StorageError) -> Self {
        MeshDbError::Storage {
            context: context.into(),
            source,
        }
    }

    /// Wraps a codec error with a short operation context.
    pub fn codec(context: impl Into<String>, source: CodecError) -> Self {
        MeshDbError::Codec {
            context: context.into(),
            source,
        }
    }
}
