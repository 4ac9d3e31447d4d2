//! Mesh services: membership, IPAM, and the combined gRPC server.
//!
//! The membership service is the RPC front door of the mesh: Join,
//! Update, Leave, and consensus introspection, routed to the current
//! leader. The built-in IPAM allocates IPv4 addresses from the mesh
//! prefix; the server module wires every service onto one listener.

#![deny(unsafe_code)]
// gRPC services return tonic::Status by value - standard practice
#![allow(clippy::result_large_err)]

pub mod context;
mod error;
mod ipam;
mod membership;
mod server;

pub use error::ServiceError;
pub use ipam::{derive_ipv6, BuiltinIpam, Ipam};
pub use membership::MembershipServiceImpl;
pub use server::MeshServer;
