//! Caller identity extraction.
//!
//! The authenticated node id arrives in request metadata: the transport
//! layer fills `webmesh-node-id` from the peer's verified identity, and
//! the leader proxy carries the original caller in `proxied-for` when a
//! non-leader forwards an RPC.

use tonic::Request;

/// Metadata key carrying the authenticated node id.
pub const NODE_ID_METADATA_KEY: &str = "webmesh-node-id";

/// Metadata key set by the leader proxy with the original caller.
pub const PROXIED_FOR_METADATA_KEY: &str = "proxied-for";

/// Returns the node id the request was proxied for, if any.
pub fn proxied_for<T>(request: &Request<T>) -> Option<String> {
    request
        .metadata()
        .get(PROXIED_FOR_METADATA_KEY)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Returns the authenticated caller of the request, preferring the
/// proxied identity when present.
pub fn authenticated_caller<T>(request: &Request<T>) -> Option<String> {
    if let Some(proxied) = proxied_for(request) {
        return Some(proxied);
    }
    request
        .metadata()
        .get(NODE_ID_METADATA_KEY)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// True if the authenticated caller matches the claimed node id.
pub fn node_id_matches_context<T>(request: &Request<T>, node_id: &str) -> bool {
    authenticated_caller(request).as_deref() == Some(node_id)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn request_with(key: &'static str, value: &str) -> Request<()> {
        let mut request = Request::new(());
        request
            .metadata_mut()
            .insert(key, value.parse().expect("metadata value"));
        request
    }

    #[test]
    fn test_caller_from_node_id_metadata() {
        let request = request_with(NODE_ID_METADATA_KEY, "n1");
        assert_eq!(authenticated_caller(&request).as_deref(), Some("n1"));
        assert!(node_id_matches_context(&request, "n1"));
        assert!(!node_id_matches_context(&request, "n2"));
    }

    #[test]
    fn test_proxied_for_takes_precedence() {
        let mut request = request_with(NODE_ID_METADATA_KEY, "leader");
        request
            .metadata_mut()
            .insert(PROXIED_FOR_METADATA_KEY, "n3".parse().expect("value"));
        assert_eq!(authenticated_caller(&request).as_deref(), Some("n3"));
    }

    #[test]
    fn test_missing_identity() {
        let request = Request::new(());
        assert!(authenticated_caller(&request).is_none());
        assert!(!node_id_matches_context(&request, "n1"));
    }
}
