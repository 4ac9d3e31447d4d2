//! WebMesh node daemon.
//!
//! Launches a mesh node: consensus, replicated registry storage, and
//! the gRPC services for membership and leader-forwarded writes.
//!
//! # Usage
//!
//! ```bash
//! # Bootstrap a three node cluster (run one per machine)
//! webmeshd --node-id n1 --bootstrap \
//!   --bootstrap-servers n2=10.0.0.2:9443,n3=10.0.0.3:9443 \
//!   --listen-address 0.0.0.0:9443 --data-dir /var/lib/webmesh/store
//!
//! # Start a node that joins later via the membership service
//! NODE_ID=n4 RAFT_DATA_DIR=/var/lib/webmesh/store webmeshd
//! ```

use clap::Parser;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use webmesh_server::config::Cli;
use webmesh_server::{bootstrap, shutdown};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = cli.config;

    init_logging(config.log_json);

    tracing::info!(
        node = %config.node_id,
        listen = %config.listen_address,
        data_dir = %config.data_dir.display(),
        in_memory = config.in_memory,
        "starting webmesh node"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let node = bootstrap::bootstrap_node(&config, shutdown_rx).await?;

    if config.bootstrap {
        bootstrap::bootstrap_cluster(&node, &config).await?;
    }

    let server = node.server.expect("server present after bootstrap");
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.serve().await {
            tracing::error!(error = %e, "gRPC server failed");
        }
    });

    shutdown::shutdown_signal().await;
    tracing::info!("shutting down");

    let _ = shutdown_tx.send(true);
    if let Err(e) = node.raft.shutdown().await {
        tracing::warn!(error = %e, "raft shutdown reported an error");
    }
    let _ = server_handle.await;

    Ok(())
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}
