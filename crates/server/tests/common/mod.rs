//! Test harness for cluster integration tests.
//!
//! Spawns real nodes on localhost ports: each runs its consensus
//! engine, registry storage, and gRPC services exactly as `webmeshd`
//! assembles them.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tonic::transport::Channel;
use tonic::Request;

use webmesh_meshdb::MeshDb;
use webmesh_proto::proto::membership_service_client::MembershipServiceClient;
use webmesh_proto::proto::JoinRequest;
use webmesh_raft::MeshRaft;
use webmesh_server::bootstrap::{bootstrap_cluster, bootstrap_node, BootstrappedNode};
use webmesh_server::config::Config;

/// A node participating in a test cluster.
pub struct TestNode {
    /// The node name.
    pub name: String,
    /// The gRPC/raft address.
    pub addr: SocketAddr,
    /// The consensus node.
    pub raft: Arc<MeshRaft>,
    /// The mesh database.
    pub db: MeshDb,
    /// The node configuration.
    pub config: Config,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    server_handle: tokio::task::JoinHandle<()>,
}

impl TestNode {
    /// Starts a node (gRPC serving, consensus idle) without forming a
    /// cluster.
    pub async fn start(name: &str, addr: SocketAddr, mutate: impl FnOnce(&mut Config)) -> Self {
        let mut config = Config::for_test(name, addr);
        mutate(&mut config);

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let mut node = bootstrap_node(&config, shutdown_rx)
            .await
            .expect("bootstrap node");
        let server = node.server.take().expect("server");
        let server_handle = tokio::spawn(async move {
            if let Err(e) = server.serve().await {
                tracing::error!(error = %e, "test server failed");
            }
        });
        wait_for_tcp(addr).await;

        Self {
            name: name.to_string(),
            addr,
            raft: node.raft,
            db: node.db,
            config,
            shutdown_tx,
            server_handle,
        }
    }

    /// True if this node currently leads.
    pub fn is_leader(&self) -> bool {
        self.raft.is_leader()
    }

    /// The leader this node observes.
    pub fn current_leader(&self) -> Option<u64> {
        self.raft.metrics().borrow().current_leader
    }

    /// The last applied log index on this node.
    pub fn last_applied(&self) -> u64 {
        self.raft
            .metrics()
            .borrow()
            .last_applied
            .map_or(0, |id| id.index)
    }

    /// Stops the node: gRPC server and consensus engine.
    pub async fn kill(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.raft.shutdown().await;
        self.server_handle.abort();
    }

    fn bootstrapped(&self) -> BootstrappedNode {
        BootstrappedNode {
            raft: self.raft.clone(),
            db: self.db.clone(),
            server: None,
        }
    }
}

/// A multi-node test cluster formed by concurrent bootstrap.
pub struct TestCluster {
    /// The nodes, in name order.
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    /// Bootstraps a cluster of `size` voters named `n1..nN`.
    pub async fn bootstrap(size: usize) -> Self {
        Self::bootstrap_with(size, |_| {}).await
    }

    /// Bootstraps a cluster with extra configuration applied to every
    /// node.
    pub async fn bootstrap_with(size: usize, mutate: impl Fn(&mut Config) + Copy) -> Self {
        assert!(size >= 1, "cluster must have at least 1 node");
        let base_port = free_port_base();

        let members: Vec<(String, SocketAddr)> = (0..size)
            .map(|i| {
                let name = format!("n{}", i + 1);
                let addr: SocketAddr = format!("127.0.0.1:{}", base_port + i as u16)
                    .parse()
                    .unwrap();
                (name, addr)
            })
            .collect();

        let mut nodes = Vec::with_capacity(size);
        for (name, addr) in &members {
            let peers: Vec<String> = members
                .iter()
                .filter(|(other, _)| other != name)
                .map(|(other, other_addr)| format!("{other}={other_addr}"))
                .collect();
            let node = TestNode::start(name, *addr, |config| {
                config.bootstrap = true;
                config.bootstrap_servers = peers.clone();
                mutate(config);
            })
            .await;
            nodes.push(node);
        }

        // Every bootstrap server initializes with the same member set;
        // elections need all transports up, so run them together.
        let mut handles = Vec::new();
        for node in &nodes {
            let bootstrapped = node.bootstrapped();
            let config = node.config.clone();
            handles.push(tokio::spawn(async move {
                bootstrap_cluster(&bootstrapped, &config)
                    .await
                    .expect("bootstrap cluster");
            }));
        }
        for handle in handles {
            handle.await.expect("bootstrap task");
        }

        let cluster = Self { nodes };
        cluster
            .wait_for_leader_agreement(Duration::from_secs(15))
            .await
            .expect("leader elected after bootstrap");
        cluster
    }

    /// Waits until all nodes agree on the same leader.
    pub async fn wait_for_leader_agreement(&self, timeout: Duration) -> Option<u64> {
        let start = tokio::time::Instant::now();
        while start.elapsed() < timeout {
            let leaders: Vec<Option<u64>> =
                self.nodes.iter().map(|n| n.current_leader()).collect();
            if let Some(first) = leaders.first().copied().flatten() {
                if leaders.iter().all(|l| *l == Some(first)) {
                    return Some(first);
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        None
    }

    /// The current leader node.
    pub fn leader(&self) -> Option<&TestNode> {
        self.nodes.iter().find(|n| n.is_leader())
    }

    /// All nodes that are not the leader.
    pub fn followers(&self) -> Vec<&TestNode> {
        self.nodes.iter().filter(|n| !n.is_leader()).collect()
    }

    /// Waits until every node has applied at least `index`.
    pub async fn wait_for_applied(&self, index: u64, timeout: Duration) -> bool {
        let start = tokio::time::Instant::now();
        while start.elapsed() < timeout {
            if self.nodes.iter().all(|n| n.last_applied() >= index) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }
}

/// Picks a wide random port range to minimize conflicts between
/// concurrently running tests.
pub fn free_port_base() -> u16 {
    42000 + (rand::random::<u16>() % 10000)
}

/// Waits until a TCP listener accepts connections at `addr`.
pub async fn wait_for_tcp(addr: SocketAddr) {
    let start = tokio::time::Instant::now();
    while start.elapsed() < Duration::from_secs(5) {
        if tokio::net::TcpStream::connect(addr).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("server at {addr} did not start listening");
}

/// Creates a membership client for a node address.
pub async fn membership_client(
    addr: SocketAddr,
) -> Result<MembershipServiceClient<Channel>, tonic::transport::Error> {
    MembershipServiceClient::connect(format!("http://{addr}")).await
}

/// A join request authenticated as the joining node itself.
pub fn authenticated_join(req: JoinRequest) -> Request<JoinRequest> {
    let id = req.id.clone();
    let mut request = Request::new(req);
    request
        .metadata_mut()
        .insert("webmesh-node-id", id.parse().expect("metadata value"));
    request
}

/// A plain join request body for a node.
pub fn join_request(name: &str, raft_addr: SocketAddr, as_observer: bool) -> JoinRequest {
    JoinRequest {
        id: name.to_string(),
        public_key: format!("{name}-key"),
        primary_endpoint: String::new(),
        wireguard_endpoints: vec![format!("127.0.0.1:5{}", 1000 + name.len())],
        zone_awareness_id: String::new(),
        features: vec![],
        as_observer,
        assigned_ipv4: String::new(),
        routes: vec![],
        raft_address: raft_addr.to_string(),
    }
}
