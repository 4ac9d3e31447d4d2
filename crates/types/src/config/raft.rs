//! Raft and storage configuration.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Environment variable for the raft listen address.
pub const LISTEN_ADDRESS_ENV: &str = "RAFT_LISTEN_ADDRESS";
/// Environment variable for the data directory.
pub const DATA_DIR_ENV: &str = "RAFT_DATA_DIR";
/// Environment variable for in-memory mode.
pub const IN_MEMORY_ENV: &str = "RAFT_IN_MEMORY";
/// Environment variable for the connection pool count.
pub const CONNECTION_POOL_COUNT_ENV: &str = "RAFT_CONNECTION_POOL_COUNT";
/// Environment variable for the connection timeout.
pub const CONNECTION_TIMEOUT_ENV: &str = "RAFT_CONNECTION_TIMEOUT";
/// Environment variable for the heartbeat timeout.
pub const HEARTBEAT_TIMEOUT_ENV: &str = "RAFT_HEARTBEAT_TIMEOUT";
/// Environment variable for the election timeout.
pub const ELECTION_TIMEOUT_ENV: &str = "RAFT_ELECTION_TIMEOUT";
/// Environment variable for the apply timeout.
pub const APPLY_TIMEOUT_ENV: &str = "RAFT_APPLY_TIMEOUT";
/// Environment variable for the commit timeout.
pub const COMMIT_TIMEOUT_ENV: &str = "RAFT_COMMIT_TIMEOUT";
/// Environment variable for the append entries batch limit.
pub const MAX_APPEND_ENTRIES_ENV: &str = "RAFT_MAX_APPEND_ENTRIES";
/// Environment variable for the leader lease timeout.
pub const LEADER_LEASE_TIMEOUT_ENV: &str = "RAFT_LEADER_LEASE_TIMEOUT";
/// Environment variable for the snapshot interval.
pub const SNAPSHOT_INTERVAL_ENV: &str = "RAFT_SNAPSHOT_INTERVAL";
/// Environment variable for the snapshot threshold.
pub const SNAPSHOT_THRESHOLD_ENV: &str = "RAFT_SNAPSHOT_THRESHOLD";
/// Environment variable for the snapshot retention count.
pub const SNAPSHOT_RETENTION_ENV: &str = "RAFT_SNAPSHOT_RETENTION";
/// Environment variable for the observer channel buffer.
pub const OBSERVER_CHAN_BUFFER_ENV: &str = "RAFT_OBSERVER_CHAN_BUFFER";
/// Environment variable for the log format.
pub const LOG_FORMAT_ENV: &str = "RAFT_LOG_FORMAT";
/// Environment variable for preferring IPv6 raft addresses.
pub const PREFER_IPV6_ENV: &str = "RAFT_PREFER_IPV6";
/// Environment variable for leaving the cluster on shutdown.
pub const LEAVE_ON_SHUTDOWN_ENV: &str = "LEAVE_ON_SHUTDOWN";
/// Environment variable for the startup timeout.
pub const STARTUP_TIMEOUT_ENV: &str = "STARTUP_TIMEOUT";
/// Environment variable for the shutdown timeout.
pub const SHUTDOWN_TIMEOUT_ENV: &str = "SHUTDOWN_TIMEOUT";

/// On-disk log and snapshot encoding.
///
/// The whole cluster agrees on one format for its lifetime. Stores record
/// the format code they were written with and refuse to open under a
/// different one; migration mid-cluster is unsupported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogFormat {
    /// Newline-delimited JSON records.
    #[default]
    #[serde(rename = "json")]
    Json,
    /// Length-prefixed protobuf records.
    #[serde(rename = "protobuf")]
    Protobuf,
    /// Length-prefixed protobuf records, snappy-compressed as a stream.
    #[serde(rename = "protobuf+snappy")]
    ProtobufSnappy,
}

impl LogFormat {
    /// Stable numeric code recorded in store headers.
    pub fn code(self) -> u32 {
        match self {
            LogFormat::Json => 1,
            LogFormat::Protobuf => 2,
            LogFormat::ProtobufSnappy => 3,
        }
    }

    /// Resolves a stored format code.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(LogFormat::Json),
            2 => Some(LogFormat::Protobuf),
            3 => Some(LogFormat::ProtobufSnappy),
            _ => None,
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Json => write!(f, "json"),
            LogFormat::Protobuf => write!(f, "protobuf"),
            LogFormat::ProtobufSnappy => write!(f, "protobuf+snappy"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(LogFormat::Json),
            "protobuf" => Ok(LogFormat::Protobuf),
            "protobuf+snappy" => Ok(LogFormat::ProtobufSnappy),
            other => Err(ConfigError::Parse {
                field: "log-format".to_string(),
                message: format!("unknown log format {other:?}"),
            }),
        }
    }
}

/// Raft consensus and storage configuration.
///
/// # Validation Rules
///
/// - `heartbeat_timeout` must be <= `election_timeout`
/// - `apply_timeout`, `commit_timeout`, `connection_timeout` must be >= 1s
/// - `snapshot_threshold`, `snapshot_retention`, `observer_chan_buffer`
///   and `max_append_entries` must be > 0
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Address the raft transport listens on.
    pub listen_address: String,
    /// Directory for the log store, stable store, snapshots and backend.
    pub data_dir: PathBuf,
    /// Replace all durable stores with volatile equivalents.
    pub in_memory: bool,
    /// Number of pooled transport connections per peer; 0 disables pooling.
    pub connection_pool_count: usize,
    /// Timeout for opening transport connections.
    #[serde(with = "humantime_serde")]
    pub connection_timeout: Duration,
    /// Follower heartbeat timeout.
    #[serde(with = "humantime_serde")]
    pub heartbeat_timeout: Duration,
    /// Base election timeout; the effective timeout is randomized above it.
    #[serde(with = "humantime_serde")]
    pub election_timeout: Duration,
    /// Maximum time a proposal may wait for apply before failing.
    #[serde(with = "humantime_serde")]
    pub apply_timeout: Duration,
    /// Maximum time a proposal may wait for quorum commit.
    #[serde(with = "humantime_serde")]
    pub commit_timeout: Duration,
    /// Maximum entries shipped per AppendEntries RPC.
    pub max_append_entries: u64,
    /// Leader lease duration.
    #[serde(with = "humantime_serde")]
    pub leader_lease_timeout: Duration,
    /// Wall-clock interval after which a snapshot is taken regardless of
    /// the threshold.
    #[serde(with = "humantime_serde")]
    pub snapshot_interval: Duration,
    /// Committed entries since the last snapshot that trigger a new one.
    pub snapshot_threshold: u64,
    /// Number of snapshot artifacts retained on disk.
    pub snapshot_retention: usize,
    /// Buffer size of the leadership observer channel.
    pub observer_chan_buffer: usize,
    /// Log and snapshot encoding.
    pub log_format: LogFormat,
    /// Prefer IPv6 addresses when resolving raft peers.
    pub prefer_ipv6: bool,
    /// Remove this node from the configuration before shutting down.
    pub leave_on_shutdown: bool,
    /// Maximum time to wait for the node to become ready at startup.
    #[serde(with = "humantime_serde")]
    pub startup_timeout: Duration,
    /// Maximum time to wait for in-flight proposals at shutdown.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:9443".to_string(),
            data_dir: PathBuf::from("/var/lib/webmesh/store"),
            in_memory: false,
            connection_pool_count: 0,
            connection_timeout: Duration::from_secs(3),
            heartbeat_timeout: Duration::from_secs(3),
            election_timeout: Duration::from_secs(3),
            apply_timeout: Duration::from_secs(10),
            commit_timeout: Duration::from_secs(15),
            max_append_entries: 64,
            leader_lease_timeout: Duration::from_secs(3),
            snapshot_interval: Duration::from_secs(300),
            snapshot_threshold: 50,
            snapshot_retention: 3,
            observer_chan_buffer: 100,
            log_format: LogFormat::default(),
            prefer_ipv6: false,
            leave_on_shutdown: false,
            startup_timeout: Duration::from_secs(180),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl RaftConfig {
    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_timeout > self.election_timeout {
            return Err(ConfigError::Validation {
                message: format!(
                    "heartbeat_timeout ({:?}) must not exceed election_timeout ({:?})",
                    self.heartbeat_timeout, self.election_timeout
                ),
            });
        }
        for (name, value) in [
            ("connection_timeout", self.connection_timeout),
            ("apply_timeout", self.apply_timeout),
            ("commit_timeout", self.commit_timeout),
        ] {
            if value < Duration::from_secs(1) {
                return Err(ConfigError::Validation {
                    message: format!("{name} must be >= 1s, got {value:?}"),
                });
            }
        }
        if self.snapshot_threshold == 0 {
            return Err(ConfigError::Validation {
                message: "snapshot_threshold must be > 0".to_string(),
            });
        }
        if self.snapshot_retention == 0 {
            return Err(ConfigError::Validation {
                message: "snapshot_retention must be > 0".to_string(),
            });
        }
        if self.max_append_entries == 0 {
            return Err(ConfigError::Validation {
                message: "max_append_entries must be > 0".to_string(),
            });
        }
        if self.observer_chan_buffer == 0 {
            return Err(ConfigError::Validation {
                message: "observer_chan_buffer must be > 0".to_string(),
            });
        }
        Ok(())
    }

    /// Path of the raft log store inside the data directory.
    pub fn log_store_path(&self) -> PathBuf {
        self.data_dir.join("raft.log")
    }

    /// Path of the stable store inside the data directory.
    pub fn stable_store_path(&self) -> PathBuf {
        self.data_dir.join("raft-stable-dat")
    }

    /// Path of the snapshot directory inside the data directory.
    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }

    /// Path of the key/value backend inside the data directory.
    pub fn backend_path(&self) -> PathBuf {
        self.data_dir.join("webmesh.redb")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        RaftConfig::default().validate().expect("defaults valid");
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let config = RaftConfig::default();
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(3));
        assert_eq!(config.election_timeout, Duration::from_secs(3));
        assert_eq!(config.commit_timeout, Duration::from_secs(15));
        assert_eq!(config.apply_timeout, Duration::from_secs(10));
        assert_eq!(config.leader_lease_timeout, Duration::from_secs(3));
        assert_eq!(config.snapshot_interval, Duration::from_secs(300));
        assert_eq!(config.snapshot_threshold, 50);
        assert_eq!(config.snapshot_retention, 3);
        assert_eq!(config.observer_chan_buffer, 100);
        assert_eq!(config.startup_timeout, Duration::from_secs(180));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_rejects_heartbeat_above_election() {
        let config = RaftConfig {
            heartbeat_timeout: Duration::from_secs(10),
            election_timeout: Duration::from_secs(3),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_snapshot_threshold() {
        let config = RaftConfig {
            snapshot_threshold: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_log_format_parse() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!(
            "protobuf+snappy".parse::<LogFormat>().unwrap(),
            LogFormat::ProtobufSnappy
        );
        assert!("msgpack".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_log_format_codes_roundtrip() {
        for format in [
            LogFormat::Json,
            LogFormat::Protobuf,
            LogFormat::ProtobufSnappy,
        ] {
            assert_eq!(LogFormat::from_code(format.code()), Some(format));
        }
        assert_eq!(LogFormat::from_code(0), None);
    }

    #[test]
    fn test_humantime_deserialization() {
        let config: RaftConfig = serde_json::from_str(
            r#"{"heartbeat_timeout":"1s","election_timeout":"2s","snapshot_interval":"5m"}"#,
        )
        .expect("deserialize");
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(1));
        assert_eq!(config.snapshot_interval, Duration::from_secs(300));
    }

    #[test]
    fn test_store_paths() {
        let config = RaftConfig {
            data_dir: PathBuf::from("/tmp/mesh"),
            ..Default::default()
        };
        assert_eq!(config.log_store_path(), PathBuf::from("/tmp/mesh/raft.log"));
        assert_eq!(
            config.stable_store_path(),
            PathBuf::from("/tmp/mesh/raft-stable-dat")
        );
        assert_eq!(config.snapshot_dir(), PathBuf::from("/tmp/mesh/snapshots"));
    }
}
