//! Conversions between domain types and their wire representations.

use webmesh_types::{FeaturePort, WireGuardPeer};

use crate::proto;

impl From<&FeaturePort> for proto::FeaturePort {
    fn from(value: &FeaturePort) -> Self {
        proto::FeaturePort {
            feature: value.feature.clone(),
            port: i32::from(value.port),
        }
    }
}

impl From<&proto::FeaturePort> for FeaturePort {
    fn from(value: &proto::FeaturePort) -> Self {
        FeaturePort {
            feature: value.feature.clone(),
            port: u16::try_from(value.port).unwrap_or_default(),
        }
    }
}

impl From<&WireGuardPeer> for proto::WireGuardPeer {
    fn from(value: &WireGuardPeer) -> Self {
        proto::WireGuardPeer {
            id: value.id.clone(),
            public_key: value.public_key.clone(),
            zone_awareness_id: value.zone_awareness_id.clone(),
            primary_endpoint: value.primary_endpoint.clone(),
            wireguard_endpoints: value.wireguard_endpoints.clone(),
            address_ipv4: value.address_ipv4.clone(),
            address_ipv6: value.address_ipv6.clone(),
            allowed_ips: value.allowed_ips.clone(),
        }
    }
}

impl From<&proto::WireGuardPeer> for WireGuardPeer {
    fn from(value: &proto::WireGuardPeer) -> Self {
        WireGuardPeer {
            id: value.id.clone(),
            public_key: value.public_key.clone(),
            zone_awareness_id: value.zone_awareness_id.clone(),
            primary_endpoint: value.primary_endpoint.clone(),
            wireguard_endpoints: value.wireguard_endpoints.clone(),
            address_ipv4: value.address_ipv4.clone(),
            address_ipv6: value.address_ipv6.clone(),
            allowed_ips: value.allowed_ips.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_port_roundtrip() {
        let domain = FeaturePort {
            feature: "mesh-dns".to_string(),
            port: 5353,
        };
        let wire: proto::FeaturePort = (&domain).into();
        let back: FeaturePort = (&wire).into();
        assert_eq!(domain, back);
    }

    #[test]
    fn test_wireguard_peer_roundtrip() {
        let domain = WireGuardPeer {
            id: "n1".to_string(),
            public_key: "key".to_string(),
            primary_endpoint: "203.0.113.1:51820".to_string(),
            wireguard_endpoints: vec!["203.0.113.1:51820".to_string()],
            address_ipv4: "172.16.0.1/32".to_string(),
            allowed_ips: vec!["172.16.0.2/32".to_string()],
            ..Default::default()
        };
        let wire: proto::WireGuardPeer = (&domain).into();
        let back: WireGuardPeer = (&wire).into();
        assert_eq!(domain, back);
    }
}
