//! Built-in IPAM.
//!
//! Allocates IPv4 addresses from the mesh prefix by scanning the
//! allocations currently present in peer records, honoring static
//! assignments. A single mutex serializes allocation so concurrent
//! joins never hand out the same address. Release is a no-op because
//! allocations are derived from peer records, which the membership
//! service deletes on leave.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use async_trait::async_trait;
use ipnet::{Ipv4Net, Ipv6Net};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use webmesh_meshdb::MeshDb;

use crate::error::ServiceError;

/// The address allocation contract the membership service drives.
#[async_trait]
pub trait Ipam: Send + Sync + 'static {
    /// Allocates a free /32 for `node_id` inside `subnet`.
    async fn allocate(&self, subnet: Ipv4Net, node_id: &str) -> Result<Ipv4Net, ServiceError>;

    /// Releases an allocation.
    async fn release(&self, ip: Ipv4Net) -> Result<(), ServiceError>;
}

/// IPAM implementation backed by the mesh database.
pub struct BuiltinIpam {
    db: MeshDb,
    static_ipv4: BTreeMap<String, Ipv4Net>,
    datamux: Mutex<()>,
}

impl BuiltinIpam {
    /// Creates the IPAM over the mesh database with the given static
    /// assignments.
    pub fn new(db: MeshDb, static_ipv4: BTreeMap<String, Ipv4Net>) -> Self {
        Self {
            db,
            static_ipv4,
            datamux: Mutex::new(()),
        }
    }

    fn is_static_allocation(&self, prefix: &Ipv4Net) -> bool {
        self.static_ipv4.values().any(|v| v == prefix)
    }

    async fn allocate_v4(
        &self,
        subnet: Ipv4Net,
        node_id: &str,
    ) -> Result<Ipv4Net, ServiceError> {
        let nodes = self.db.peers().list().await?;
        let allocated: BTreeSet<Ipv4Net> =
            nodes.iter().filter_map(|n| n.private_ipv4).collect();

        let mut candidate = u32::from(subnet.network()).wrapping_add(1);
        let broadcast = u32::from(subnet.broadcast());
        while candidate < broadcast {
            let prefix = Ipv4Net::new(Ipv4Addr::from(candidate), 32)
                .map_err(ServiceError::internal)?;
            if !allocated.contains(&prefix) && !self.is_static_allocation(&prefix) {
                return Ok(prefix);
            }
            candidate = candidate.wrapping_add(1);
        }
        Err(ServiceError::internal(format!(
            "no more addresses in {subnet} for {node_id}"
        )))
    }
}

#[async_trait]
impl Ipam for BuiltinIpam {
    async fn allocate(&self, subnet: Ipv4Net, node_id: &str) -> Result<Ipv4Net, ServiceError> {
        let _guard = self.datamux.lock().await;
        if let Some(assigned) = self.static_ipv4.get(node_id) {
            return Ok(*assigned);
        }
        self.allocate_v4(subnet, node_id).await
    }

    async fn release(&self, _ip: Ipv4Net) -> Result<(), ServiceError> {
        Ok(())
    }
}

/// Derives a node's IPv6 address inside the mesh prefix from the hash
/// of its id: the prefix bits come from the mesh, the host bits from
/// the leading bytes of `SHA-256(node_id)`. Deterministic, so every
/// member computes the same address without coordination.
pub fn derive_ipv6(prefix: &Ipv6Net, node_id: &str) -> Ipv6Net {
    let digest = Sha256::digest(node_id.as_bytes());
    let mut hash_bytes = [0u8; 16];
    hash_bytes.copy_from_slice(&digest[..16]);
    let hash = u128::from_be_bytes(hash_bytes);

    let host_bits = 128 - u32::from(prefix.prefix_len());
    let host_mask = if host_bits == 128 {
        u128::MAX
    } else {
        (1u128 << host_bits) - 1
    };
    let network = u128::from(prefix.network());
    let addr = std::net::Ipv6Addr::from(network | (hash & host_mask));
    // /128: the prefix length is always valid.
    Ipv6Net::new(addr, 128).expect("valid /128")
}
