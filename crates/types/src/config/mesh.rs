//! Mesh-level configuration.

use std::collections::BTreeMap;

use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Environment variable for the mesh IPv4 prefix.
pub const IPV4_PREFIX_ENV: &str = "MESH_IPV4_PREFIX";
/// Environment variable for the mesh IPv6 prefix.
pub const IPV6_PREFIX_ENV: &str = "MESH_IPV6_PREFIX";
/// Environment variable for the mesh domain.
pub const MESH_DOMAIN_ENV: &str = "MESH_DOMAIN";
/// Environment variable for enabling the leader proxy.
pub const LEADER_PROXY_ENV: &str = "MESH_LEADER_PROXY";
/// Environment variable for per-route ACL filtering.
pub const PER_ROUTE_FILTERING_ENV: &str = "MESH_PER_ROUTE_FILTERING";

/// Mesh-wide settings applied at bootstrap plus per-node behavior knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// IPv4 prefix the IPAM allocates from. Written to the registry at
    /// bootstrap and immutable afterwards.
    pub ipv4_prefix: Ipv4Net,
    /// IPv6 prefix node addresses are derived from.
    pub ipv6_prefix: Ipv6Net,
    /// DNS domain of the mesh.
    pub mesh_domain: String,
    /// Static IPv4 assignments by node id, honored by the built-in IPAM.
    pub static_ipv4: BTreeMap<String, Ipv4Net>,
    /// Forward writes and membership RPCs from non-leaders to the leader
    /// instead of returning a routing error.
    pub leader_proxy: bool,
    /// Filter individual denied route CIDRs out of the reachability map
    /// instead of dropping the advertising peer entirely.
    pub per_route_filtering: bool,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            ipv4_prefix: "172.16.0.0/12".parse().expect("valid default prefix"),
            ipv6_prefix: "fd00:dead:beef::/64".parse().expect("valid default prefix"),
            mesh_domain: "webmesh.internal".to_string(),
            static_ipv4: BTreeMap::new(),
            leader_proxy: false,
            per_route_filtering: false,
        }
    }
}

impl MeshConfig {
    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if a static assignment falls
    /// outside the mesh prefix or the domain is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mesh_domain.is_empty() {
            return Err(ConfigError::Validation {
                message: "mesh_domain must not be empty".to_string(),
            });
        }
        for (node, assignment) in &self.static_ipv4 {
            if !self.ipv4_prefix.contains(&assignment.addr()) {
                return Err(ConfigError::Validation {
                    message: format!(
                        "static assignment {assignment} for {node} is outside mesh prefix {}",
                        self.ipv4_prefix
                    ),
                });
            }
            if assignment.prefix_len() != 32 {
                return Err(ConfigError::Validation {
                    message: format!(
                        "static assignment {assignment} for {node} must be a /32"
                    ),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = MeshConfig::default();
        config.validate().expect("defaults valid");
        assert_eq!(config.ipv4_prefix.to_string(), "172.16.0.0/12");
        assert_eq!(config.mesh_domain, "webmesh.internal");
    }

    #[test]
    fn test_rejects_static_outside_prefix() {
        let mut config = MeshConfig::default();
        config
            .static_ipv4
            .insert("n7".to_string(), "10.0.0.50/32".parse().unwrap());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_non_host_static() {
        let mut config = MeshConfig::default();
        config
            .static_ipv4
            .insert("n7".to_string(), "172.16.0.0/24".parse().unwrap());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_accepts_static_inside_prefix() {
        let mut config = MeshConfig::default();
        config
            .static_ipv4
            .insert("n7".to_string(), "172.16.0.50/32".parse().unwrap());
        config.validate().expect("valid static assignment");
    }
}
