//! gRPC services owned by the consensus layer.

mod proxy;
mod raft;

pub use proxy::StorageProxyServiceImpl;
pub use raft::RaftServiceImpl;
