//! WebMesh node runner.
//!
//! Exposes the configuration and bootstrap plumbing so integration
//! tests can assemble nodes the same way the `webmeshd` binary does.

#![deny(unsafe_code)]

pub mod bootstrap;
pub mod config;
pub mod shutdown;
