//! The combined mesh gRPC server.
//!
//! Hosts every service of a node on one listener: the membership front
//! door, the storage proxy for leader-forwarded writes, and the raft
//! transport. Supports graceful shutdown via a watch channel.

use std::net::SocketAddr;
use std::sync::Arc;

use tonic::transport::Server;
use tracing::info;

use webmesh_meshdb::MeshDb;
use webmesh_proto::proto::membership_service_server::MembershipServiceServer;
use webmesh_proto::proto::raft_service_server::RaftServiceServer;
use webmesh_proto::proto::storage_proxy_service_server::StorageProxyServiceServer;
use webmesh_raft::services::{RaftServiceImpl, StorageProxyServiceImpl};
use webmesh_raft::MeshRaft;
use webmesh_types::MeshConfig;

use crate::ipam::Ipam;
use crate::membership::MembershipServiceImpl;

/// The mesh node gRPC server.
#[derive(bon::Builder)]
#[builder(on(_, required))]
pub struct MeshServer {
    /// The raft consensus node.
    raft: Arc<MeshRaft>,
    /// The mesh database over the consensus-backed storage.
    db: MeshDb,
    /// The address allocator.
    ipam: Arc<dyn Ipam>,
    /// Mesh configuration.
    mesh: MeshConfig,
    /// Listen address for all services.
    addr: SocketAddr,
    /// Shutdown signal receiver. When `true` is sent, the server stops.
    #[builder(default)]
    shutdown_rx: Option<tokio::sync::watch::Receiver<bool>>,
}

impl MeshServer {
    /// Starts serving. Blocks until shutdown is signalled (or forever
    /// when no receiver was provided).
    ///
    /// # Errors
    ///
    /// Returns an error if the listener fails to bind or the transport
    /// fails while serving.
    pub async fn serve(self) -> Result<(), tonic::transport::Error> {
        let membership = MembershipServiceImpl::new(
            self.raft.clone(),
            self.db.clone(),
            self.ipam.clone(),
            self.mesh.clone(),
        );
        let storage_proxy = StorageProxyServiceImpl::new(self.raft.clone());
        let raft_service = RaftServiceImpl::new(self.raft.clone());

        info!(addr = %self.addr, "starting mesh gRPC server");
        let router = Server::builder()
            .add_service(MembershipServiceServer::new(membership))
            .add_service(StorageProxyServiceServer::new(storage_proxy))
            .add_service(RaftServiceServer::new(raft_service));

        if let Some(mut shutdown_rx) = self.shutdown_rx {
            router
                .serve_with_shutdown(self.addr, async move {
                    let _ = shutdown_rx.wait_for(|v| *v).await;
                    info!("shutdown signal received, stopping gRPC server");
                })
                .await
        } else {
            router.serve(self.addr).await
        }
    }
}
