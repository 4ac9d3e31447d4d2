//! Protobuf types and conversions for WebMesh.
//!
//! This crate provides:
//! - Generated protobuf types and gRPC service traits ([`proto`])
//! - Bidirectional conversions between domain types and proto types
//!   ([`convert`])
//!
//! Kept separate from the raft crate so that clients needing only the
//! wire format do not pull in consensus internals.

#![deny(unsafe_code)]
// gRPC services return tonic::Status by value - standard practice
#![allow(clippy::result_large_err)]

/// Generated protobuf types and service traits.
pub mod proto {
    #![allow(clippy::all)]
    #![allow(missing_docs)]

    tonic::include_proto!("webmesh.v1");
}

/// Bidirectional conversions between domain and protobuf types.
pub mod convert;
