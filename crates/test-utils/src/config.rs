//! Raft configurations tuned for fast tests.

use std::path::Path;
use std::time::Duration;

use webmesh_types::RaftConfig;

/// An in-memory configuration with short timeouts for single-process
/// tests.
#[must_use]
pub fn in_memory_raft_config() -> RaftConfig {
    RaftConfig {
        in_memory: true,
        heartbeat_timeout: Duration::from_millis(150),
        election_timeout: Duration::from_millis(300),
        apply_timeout: Duration::from_secs(5),
        commit_timeout: Duration::from_secs(5),
        startup_timeout: Duration::from_secs(15),
        shutdown_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

/// A durable configuration rooted at `data_dir` with test timeouts.
#[must_use]
pub fn fast_raft_config(data_dir: &Path) -> RaftConfig {
    RaftConfig {
        in_memory: false,
        data_dir: data_dir.to_path_buf(),
        ..in_memory_raft_config()
    }
}
