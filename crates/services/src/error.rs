//! Service error types and their gRPC translation.
//!
//! ## gRPC Status Code Mapping
//!
//! | Variant            | gRPC Code             | Retryable |
//! |--------------------|-----------------------|-----------|
//! | `PermissionDenied` | `PERMISSION_DENIED`   | No        |
//! | `AlreadyExists`    | `ALREADY_EXISTS`      | No        |
//! | `NotFound`         | `NOT_FOUND`           | No        |
//! | `InvalidArgument`  | `INVALID_ARGUMENT`    | No        |
//! | `NotLeader`        | `FAILED_PRECONDITION` | On leader |
//! | `NoLeader`         | `UNAVAILABLE`         | Yes       |
//! | `Timeout`          | `DEADLINE_EXCEEDED`   | Yes       |
//! | `Internal`         | `INTERNAL`            | No        |

use snafu::Snafu;
use webmesh_meshdb::MeshDbError;
use webmesh_storage::StorageError;

/// Errors from the mesh services, converted to `tonic::Status` at the
/// boundary.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ServiceError {
    /// The caller is not authorized for the operation.
    #[snafu(display("permission denied: {message}"))]
    PermissionDenied {
        /// What was refused.
        message: String,
    },

    /// A conflicting entity already exists.
    #[snafu(display("already exists: {message}"))]
    AlreadyExists {
        /// The conflict.
        message: String,
    },

    /// The requested entity does not exist.
    #[snafu(display("not found: {message}"))]
    NotFound {
        /// The missing entity.
        message: String,
    },

    /// A malformed request argument.
    #[snafu(display("invalid argument: {message}"))]
    InvalidArgument {
        /// What was malformed.
        message: String,
    },

    /// The operation requires the leader. The message carries the
    /// leader address when known so clients can redial.
    #[snafu(display("not the leader{}", leader_suffix(leader)))]
    NotLeader {
        /// Address of the current leader, when known.
        leader: Option<String>,
    },

    /// The cluster has no leader.
    #[snafu(display("no leader elected"))]
    NoLeader,

    /// The operation did not complete in time. Completion is not
    /// guaranteed either way; callers must reconcile by re-reading.
    #[snafu(display("operation timed out: {message}"))]
    Timeout {
        /// What timed out.
        message: String,
    },

    /// An internal failure.
    #[snafu(display("internal: {message}"))]
    Internal {
        /// Failure text.
        message: String,
    },
}

fn leader_suffix(leader: &Option<String>) -> String {
    match leader {
        Some(addr) => format!("; current leader: {addr}"),
        None => String::new(),
    }
}

impl ServiceError {
    /// Creates a permission denied error.
    pub fn permission_denied(message: impl Into<String>) -> Self {
        ServiceError::PermissionDenied {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_arg(message: impl Into<String>) -> Self {
        ServiceError::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates an internal error from any error value.
    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        ServiceError::Internal {
            message: err.to_string(),
        }
    }
}

impl From<StorageError> for ServiceError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotLeader { leader } => ServiceError::NotLeader { leader },
            StorageError::NoLeader => ServiceError::NoLeader,
            StorageError::ApplyTimeout { timeout } => ServiceError::Timeout {
                message: format!("raft apply after {timeout:?}"),
            },
            StorageError::ReservedPrefix { key } => ServiceError::InvalidArgument {
                message: format!("write to reserved prefix {key}"),
            },
            StorageError::InvalidArgument { message } => {
                ServiceError::InvalidArgument { message }
            }
            StorageError::KeyNotFound { key } => ServiceError::NotFound { message: key },
            other => ServiceError::internal(other),
        }
    }
}

impl From<MeshDbError> for ServiceError {
    fn from(err: MeshDbError) -> Self {
        match err {
            MeshDbError::NodeNotFound { id } => ServiceError::NotFound {
                message: format!("node {id}"),
            },
            MeshDbError::AclNotFound { name } => ServiceError::NotFound {
                message: format!("network acl {name}"),
            },
            MeshDbError::RouteNotFound { name } => ServiceError::NotFound {
                message: format!("route {name}"),
            },
            MeshDbError::RoleNotFound { name } => ServiceError::NotFound {
                message: format!("role {name}"),
            },
            MeshDbError::InvalidEntity { message } => ServiceError::InvalidArgument { message },
            MeshDbError::SystemAcl { name } => ServiceError::InvalidArgument {
                message: format!("network acl {name} is system-managed"),
            },
            MeshDbError::StateAlreadySet { field } => ServiceError::AlreadyExists {
                message: format!("mesh state {field}"),
            },
            MeshDbError::Storage { context, source } => {
                let inner: ServiceError = source.into();
                match inner {
                    ServiceError::Internal { message } => ServiceError::Internal {
                        message: format!("{context}: {message}"),
                    },
                    other => other,
                }
            }
            other => ServiceError::internal(other),
        }
    }
}

impl From<ServiceError> for tonic::Status {
    fn from(err: ServiceError) -> Self {
        let message = err.to_string();
        match err {
            ServiceError::PermissionDenied { .. } => tonic::Status::permission_denied(message),
            ServiceError::AlreadyExists { .. } => tonic::Status::already_exists(message),
            ServiceError::NotFound { .. } => tonic::Status::not_found(message),
            ServiceError::InvalidArgument { .. } => tonic::Status::invalid_argument(message),
            ServiceError::NotLeader { .. } => tonic::Status::failed_precondition(message),
            ServiceError::NoLeader => tonic::Status::unavailable(message),
            ServiceError::Timeout { .. } => tonic::Status::deadline_exceeded(message),
            ServiceError::Internal { .. } => tonic::Status::internal(message),
        }
    }
}
