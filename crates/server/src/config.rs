//! Node configuration from CLI flags and environment variables.
//!
//! Every core setting has both a flag and an environment variable;
//! flags win. Durations accept humantime form (`3s`, `5m`). The typed
//! consensus and mesh configurations are derived by [`Config::raft_config`]
//! and [`Config::mesh_config`], which also validate.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use webmesh_types::{ConfigError, LogFormat, MeshConfig, RaftConfig};

/// The webmeshd command line.
#[derive(Debug, Parser)]
#[command(name = "webmeshd", about = "WebMesh node daemon", version)]
pub struct Cli {
    /// Node configuration.
    #[command(flatten)]
    pub config: Config,
}

/// Node configuration.
#[derive(Debug, Clone, clap::Args)]
pub struct Config {
    /// Unique node id in the mesh.
    #[arg(long = "node-id", env = "NODE_ID")]
    pub node_id: String,

    /// Address to listen on for raft and gRPC services.
    #[arg(
        long = "listen-address",
        env = "RAFT_LISTEN_ADDRESS",
        default_value = "0.0.0.0:9443"
    )]
    pub listen_address: SocketAddr,

    /// Address advertised to other members; defaults to the listen
    /// address.
    #[arg(long = "advertise-address", env = "ADVERTISE_ADDRESS")]
    pub advertise_address: Option<SocketAddr>,

    /// Directory for durable state.
    #[arg(
        long = "data-dir",
        env = "RAFT_DATA_DIR",
        default_value = "/var/lib/webmesh/store"
    )]
    pub data_dir: PathBuf,

    /// Run with volatile stores only.
    #[arg(long = "in-memory", env = "RAFT_IN_MEMORY")]
    pub in_memory: bool,

    /// Bootstrap a new cluster with this node.
    #[arg(long = "bootstrap", env = "BOOTSTRAP")]
    pub bootstrap: bool,

    /// Bootstrap servers as `name=addr` pairs.
    #[arg(
        long = "bootstrap-servers",
        env = "BOOTSTRAP_SERVERS",
        value_delimiter = ','
    )]
    pub bootstrap_servers: Vec<String>,

    /// Number of pooled transport connections per peer.
    #[arg(
        long = "connection-pool-count",
        env = "RAFT_CONNECTION_POOL_COUNT",
        default_value_t = 0
    )]
    pub connection_pool_count: usize,

    /// Timeout for opening transport connections.
    #[arg(
        long = "connection-timeout",
        env = "RAFT_CONNECTION_TIMEOUT",
        default_value = "3s"
    )]
    pub connection_timeout: String,

    /// Follower heartbeat timeout.
    #[arg(
        long = "heartbeat-timeout",
        env = "RAFT_HEARTBEAT_TIMEOUT",
        default_value = "3s"
    )]
    pub heartbeat_timeout: String,

    /// Base election timeout.
    #[arg(
        long = "election-timeout",
        env = "RAFT_ELECTION_TIMEOUT",
        default_value = "3s"
    )]
    pub election_timeout: String,

    /// Maximum time a proposal may wait for apply.
    #[arg(long = "apply-timeout", env = "RAFT_APPLY_TIMEOUT", default_value = "10s")]
    pub apply_timeout: String,

    /// Maximum time a proposal may wait for quorum commit.
    #[arg(
        long = "commit-timeout",
        env = "RAFT_COMMIT_TIMEOUT",
        default_value = "15s"
    )]
    pub commit_timeout: String,

    /// Maximum entries per AppendEntries RPC.
    #[arg(
        long = "max-append-entries",
        env = "RAFT_MAX_APPEND_ENTRIES",
        default_value_t = 64
    )]
    pub max_append_entries: u64,

    /// Leader lease duration.
    #[arg(
        long = "leader-lease-timeout",
        env = "RAFT_LEADER_LEASE_TIMEOUT",
        default_value = "3s"
    )]
    pub leader_lease_timeout: String,

    /// Wall-clock snapshot interval.
    #[arg(
        long = "snapshot-interval",
        env = "RAFT_SNAPSHOT_INTERVAL",
        default_value = "5m"
    )]
    pub snapshot_interval: String,

    /// Committed entries since the last snapshot that trigger one.
    #[arg(
        long = "snapshot-threshold",
        env = "RAFT_SNAPSHOT_THRESHOLD",
        default_value_t = 50
    )]
    pub snapshot_threshold: u64,

    /// Snapshot artifacts retained.
    #[arg(
        long = "snapshot-retention",
        env = "RAFT_SNAPSHOT_RETENTION",
        default_value_t = 3
    )]
    pub snapshot_retention: usize,

    /// Leadership observer channel buffer.
    #[arg(
        long = "observer-chan-buffer",
        env = "RAFT_OBSERVER_CHAN_BUFFER",
        default_value_t = 100
    )]
    pub observer_chan_buffer: usize,

    /// Log and snapshot format: json, protobuf, or protobuf+snappy.
    #[arg(long = "raft-log-format", env = "RAFT_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Prefer IPv6 addresses when resolving raft peers.
    #[arg(long = "raft-prefer-ipv6", env = "RAFT_PREFER_IPV6")]
    pub prefer_ipv6: bool,

    /// Remove this node from the configuration on shutdown.
    #[arg(long = "leave-on-shutdown", env = "LEAVE_ON_SHUTDOWN")]
    pub leave_on_shutdown: bool,

    /// Maximum time to wait for readiness at startup.
    #[arg(long = "startup-timeout", env = "STARTUP_TIMEOUT", default_value = "3m")]
    pub startup_timeout: String,

    /// Maximum time to wait for in-flight work at shutdown.
    #[arg(long = "shutdown-timeout", env = "SHUTDOWN_TIMEOUT", default_value = "1m")]
    pub shutdown_timeout: String,

    /// Mesh IPv4 prefix used by the IPAM.
    #[arg(
        long = "ipv4-prefix",
        env = "MESH_IPV4_PREFIX",
        default_value = "172.16.0.0/12"
    )]
    pub ipv4_prefix: String,

    /// Mesh IPv6 prefix node addresses derive from.
    #[arg(
        long = "ipv6-prefix",
        env = "MESH_IPV6_PREFIX",
        default_value = "fd00:dead:beef::/64"
    )]
    pub ipv6_prefix: String,

    /// Mesh DNS domain.
    #[arg(
        long = "mesh-domain",
        env = "MESH_DOMAIN",
        default_value = "webmesh.internal"
    )]
    pub mesh_domain: String,

    /// Static IPv4 assignments as `node=cidr` pairs.
    #[arg(long = "static-ipv4", env = "MESH_STATIC_IPV4", value_delimiter = ',')]
    pub static_ipv4: Vec<String>,

    /// Forward writes and membership RPCs from non-leaders to the
    /// leader.
    #[arg(long = "leader-proxy", env = "MESH_LEADER_PROXY")]
    pub leader_proxy: bool,

    /// Filter denied route CIDRs individually instead of dropping the
    /// advertising peer.
    #[arg(long = "per-route-filtering", env = "MESH_PER_ROUTE_FILTERING")]
    pub per_route_filtering: bool,

    /// Emit logs as JSON.
    #[arg(long = "log-json", env = "LOG_JSON")]
    pub log_json: bool,
}

fn parse_duration(field: &str, raw: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(raw).map_err(|e| ConfigError::Parse {
        field: field.to_string(),
        message: e.to_string(),
    })
}

impl Config {
    /// The address advertised to other members.
    pub fn advertise_address(&self) -> SocketAddr {
        self.advertise_address.unwrap_or(self.listen_address)
    }

    /// Derives the validated consensus configuration.
    pub fn raft_config(&self) -> Result<RaftConfig, ConfigError> {
        let config = RaftConfig {
            listen_address: self.listen_address.to_string(),
            data_dir: self.data_dir.clone(),
            in_memory: self.in_memory,
            connection_pool_count: self.connection_pool_count,
            connection_timeout: parse_duration("connection-timeout", &self.connection_timeout)?,
            heartbeat_timeout: parse_duration("heartbeat-timeout", &self.heartbeat_timeout)?,
            election_timeout: parse_duration("election-timeout", &self.election_timeout)?,
            apply_timeout: parse_duration("apply-timeout", &self.apply_timeout)?,
            commit_timeout: parse_duration("commit-timeout", &self.commit_timeout)?,
            max_append_entries: self.max_append_entries,
            leader_lease_timeout: parse_duration(
                "leader-lease-timeout",
                &self.leader_lease_timeout,
            )?,
            snapshot_interval: parse_duration("snapshot-interval", &self.snapshot_interval)?,
            snapshot_threshold: self.snapshot_threshold,
            snapshot_retention: self.snapshot_retention,
            observer_chan_buffer: self.observer_chan_buffer,
            log_format: self.log_format.parse::<LogFormat>()?,
            prefer_ipv6: self.prefer_ipv6,
            leave_on_shutdown: self.leave_on_shutdown,
            startup_timeout: parse_duration("startup-timeout", &self.startup_timeout)?,
            shutdown_timeout: parse_duration("shutdown-timeout", &self.shutdown_timeout)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Derives the validated mesh configuration.
    pub fn mesh_config(&self) -> Result<MeshConfig, ConfigError> {
        let mut static_ipv4 = BTreeMap::new();
        for pair in &self.static_ipv4 {
            let (node, cidr) = pair.split_once('=').ok_or_else(|| ConfigError::Parse {
                field: "static-ipv4".to_string(),
                message: format!("expected node=cidr, got {pair:?}"),
            })?;
            let prefix = cidr.parse().map_err(|_| ConfigError::Parse {
                field: "static-ipv4".to_string(),
                message: format!("malformed cidr {cidr:?}"),
            })?;
            static_ipv4.insert(node.to_string(), prefix);
        }

        let config = MeshConfig {
            ipv4_prefix: self.ipv4_prefix.parse().map_err(|_| ConfigError::Parse {
                field: "ipv4-prefix".to_string(),
                message: format!("malformed prefix {:?}", self.ipv4_prefix),
            })?,
            ipv6_prefix: self.ipv6_prefix.parse().map_err(|_| ConfigError::Parse {
                field: "ipv6-prefix".to_string(),
                message: format!("malformed prefix {:?}", self.ipv6_prefix),
            })?,
            mesh_domain: self.mesh_domain.clone(),
            static_ipv4,
            leader_proxy: self.leader_proxy,
            per_route_filtering: self.per_route_filtering,
        };
        config.validate()?;
        Ok(config)
    }

    /// The bootstrap server map (`name -> addr`), including this node.
    pub fn bootstrap_server_map(&self) -> Result<BTreeMap<String, String>, ConfigError> {
        let mut servers = BTreeMap::new();
        servers.insert(self.node_id.clone(), self.advertise_address().to_string());
        for pair in &self.bootstrap_servers {
            let (name, addr) = pair.split_once('=').ok_or_else(|| ConfigError::Parse {
                field: "bootstrap-servers".to_string(),
                message: format!("expected name=addr, got {pair:?}"),
            })?;
            servers.insert(name.to_string(), addr.to_string());
        }
        Ok(servers)
    }

    /// A configuration for tests: in-memory stores, short timeouts.
    pub fn for_test(node_id: &str, listen_address: SocketAddr) -> Self {
        Self {
            node_id: node_id.to_string(),
            listen_address,
            advertise_address: None,
            data_dir: PathBuf::from("/tmp/webmesh-test"),
            in_memory: true,
            bootstrap: false,
            bootstrap_servers: vec![],
            connection_pool_count: 0,
            connection_timeout: "3s".to_string(),
            heartbeat_timeout: "150ms".to_string(),
            election_timeout: "300ms".to_string(),
            apply_timeout: "5s".to_string(),
            commit_timeout: "5s".to_string(),
            max_append_entries: 64,
            leader_lease_timeout: "300ms".to_string(),
            snapshot_interval: "5m".to_string(),
            snapshot_threshold: 50,
            snapshot_retention: 3,
            observer_chan_buffer: 100,
            log_format: "json".to_string(),
            prefer_ipv6: false,
            leave_on_shutdown: false,
            startup_timeout: "15s".to_string(),
            shutdown_timeout: "5s".to_string(),
            ipv4_prefix: "172.16.0.0/12".to_string(),
            ipv6_prefix: "fd00:dead:beef::/64".to_string(),
            mesh_domain: "webmesh.internal".to_string(),
            static_ipv4: vec![],
            leader_proxy: false,
            per_route_filtering: false,
            log_json: false,
        }
    }
}
