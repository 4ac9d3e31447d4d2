//! Configuration types for the WebMesh core.
//!
//! Each configuration struct deserializes with serde (durations in
//! humantime form), carries documented defaults, and validates after
//! load.
//! The server binary maps every field to a CLI flag and an environment
//! variable; the constants here name the environment variables so the
//! two stay in sync.

pub mod mesh;
pub mod raft;

use snafu::Snafu;

pub use mesh::MeshConfig;
pub use raft::{LogFormat, RaftConfig};

/// Error type for configuration loading and validation.
#[derive(Debug, Snafu)]
pub enum ConfigError {
    /// A configuration value is out of range or inconsistent.
    #[snafu(display("invalid configuration: {message}"))]
    Validation {
        /// Description of the violated rule.
        message: String,
    },

    /// A configuration value failed to parse.
    #[snafu(display("parse configuration value {field}: {message}"))]
    Parse {
        /// The offending field.
        field: String,
        /// Parser error text.
        message: String,
    },
}
