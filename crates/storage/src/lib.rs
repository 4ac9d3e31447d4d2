//! Key/value storage for the WebMesh registry.
//!
//! This crate provides:
//! - The [`KvBackend`] trait with in-memory and redb-backed
//!   implementations
//! - The reserved key-prefix scheme (`/registry`, `/raft`)
//! - The [`MeshStorage`] facade trait the rest of the system reads and
//!   writes through
//!
//! The backend is the only shared mutable state in a node. It is mutated
//! exclusively by the consensus state machine; everything else holds
//! read-only handles and proposes writes through a [`MeshStorage`]
//! implementation.

#![deny(unsafe_code)]

pub mod backend;
mod error;
mod facade;
mod prefixes;

pub use backend::{DiskBackend, KvBackend, KvEvent, KvOp, MemoryBackend, Subscription};
pub use error::StorageError;
pub use facade::{check_writable, MeshStorage};
pub use prefixes::{is_reserved_prefix, Prefix, RESERVED_PREFIXES};
