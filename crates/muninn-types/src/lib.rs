pub mod envelope;

pub use envelope::Envelope;

/// Globally unique node identity, used for ring slots and RPC origin.
pub type NodeId = String;

/// Advertised identity and endpoints of one cache node.
///
/// `port` is the node's backing-store endpoint (the store channel peers
/// connect to for direct reads and writes); `peer_port` is the gRPC port
/// for the peer cache protocol.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NodeDescriptor {
    pub node_id: NodeId,
    pub host: String,
    pub port: u16,
    pub peer_port: u16,
}

impl NodeDescriptor {
    /// Address of the node's backing store, e.g. `10.0.0.3:6379`.
    pub fn store_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// URL of the node's peer gRPC endpoint.
    pub fn peer_url(&self) -> String {
        format!("http://{}:{}", self.host, self.peer_port)
    }
}

/// Point-in-time statistics reported by a backing store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StoreStats {
    pub key_count: u64,
    pub memory_bytes: u64,
    pub memory_peak: u64,
    pub connected_clients: u64,
}

#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("no cache nodes available")]
    EmptyRing,
    /// Backing store unreachable or timed out; retriable.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    /// Backing store rejected the operation; not retriable.
    #[error("store error: {0}")]
    Store(String),
    #[error("envelope codec error: {0}")]
    Codec(String),
    /// Peer unreachable or slow; retriable.
    #[error("peer error: {0}")]
    Peer(String),
    /// Peer actively rejected the request; not retriable.
    #[error("peer rejected request: {0}")]
    PeerRejected(String),
    #[error("coordination error: {0}")]
    Coordination(String),
    #[error("operation timed out")]
    Timeout,
}

impl CacheError {
    /// Whether a single retry is worth attempting.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CacheError::StoreUnavailable(_) | CacheError::Peer(_) | CacheError::Timeout
        )
    }
}
