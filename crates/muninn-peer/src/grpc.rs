use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{OnceCell, RwLock};
use tonic::transport::{Channel, Endpoint};

use muninn_proto::v1::cache_service_client::CacheServiceClient;
use muninn_proto::v1::{HealthCheckRequest, InvalidateRequest, ReplicateRequest};
use muninn_store::{LocalStore, RedisStore};
use muninn_types::{CacheError, NodeDescriptor, NodeId};

use crate::{with_retry, PeerAck, PeerTransport, TransportConfig};

fn status_err(status: tonic::Status) -> CacheError {
    use tonic::Code;
    match status.code() {
        Code::DeadlineExceeded => CacheError::Timeout,
        Code::Unavailable | Code::Cancelled | Code::Aborted | Code::Unknown => {
            CacheError::Peer(status.message().to_string())
        }
        _ => CacheError::PeerRejected(format!("{}: {}", status.code(), status.message())),
    }
}

#[derive(Clone)]
struct PeerHandle {
    descriptor: NodeDescriptor,
    client: CacheServiceClient<Channel>,
    /// Store channel, dialed on first use and shared across clones.
    store: Arc<OnceCell<RedisStore>>,
}

/// gRPC `PeerTransport`.
///
/// One lazily-connected channel per peer with HTTP/2 keepalive, so idle
/// connections notice partitions; one Redis handle per peer for the store
/// channel. Both are dropped when membership removes the peer.
pub struct GrpcTransport {
    cfg: TransportConfig,
    peers: RwLock<HashMap<NodeId, PeerHandle>>,
}

impl GrpcTransport {
    pub fn new(cfg: TransportConfig) -> Self {
        GrpcTransport { cfg, peers: RwLock::new(HashMap::new()) }
    }

    async fn handle(&self, peer: &str) -> Result<PeerHandle, CacheError> {
        self.peers
            .read()
            .await
            .get(peer)
            .cloned()
            .ok_or_else(|| CacheError::Peer(format!("unknown peer {peer}")))
    }

    async fn store(&self, peer: &str) -> Result<RedisStore, CacheError> {
        let handle = self.handle(peer).await?;
        let store = handle
            .store
            .get_or_try_init(|| {
                let addr = handle.descriptor.store_addr();
                async move { RedisStore::connect(&addr).await }
            })
            .await?;
        Ok(store.clone())
    }
}

impl PeerTransport for GrpcTransport {
    async fn add_peer(&self, descriptor: &NodeDescriptor) -> Result<(), CacheError> {
        let endpoint = Endpoint::from_shared(descriptor.peer_url())
            .map_err(|e| CacheError::Peer(e.to_string()))?
            .connect_timeout(self.cfg.rpc_deadline)
            .timeout(self.cfg.rpc_deadline)
            .http2_keep_alive_interval(self.cfg.keepalive_interval)
            .keep_alive_timeout(self.cfg.keepalive_timeout)
            .keep_alive_while_idle(true);
        let handle = PeerHandle {
            descriptor: descriptor.clone(),
            client: CacheServiceClient::new(endpoint.connect_lazy()),
            store: Arc::new(OnceCell::new()),
        };
        self.peers
            .write()
            .await
            .insert(descriptor.node_id.clone(), handle);
        tracing::debug!(peer = %descriptor.node_id, url = %descriptor.peer_url(), "peer client ready");
        Ok(())
    }

    async fn remove_peer(&self, node_id: &str) {
        if self.peers.write().await.remove(node_id).is_some() {
            tracing::debug!(peer = node_id, "peer client dropped");
        }
    }

    async fn peer_ids(&self) -> Vec<String> {
        self.peers.read().await.keys().cloned().collect()
    }

    async fn replicate(
        &self,
        peer: &str,
        key: &str,
        envelope: Vec<u8>,
        ttl_secs: Option<u64>,
        originator: &str,
    ) -> Result<PeerAck, CacheError> {
        let handle = self.handle(peer).await?;
        with_retry(&self.cfg, "replicate", peer, || {
            let mut client = handle.client.clone();
            let req = ReplicateRequest {
                key: key.to_string(),
                value: envelope.clone(),
                ttl_secs: ttl_secs.unwrap_or(0),
                originator_node_id: originator.to_string(),
            };
            async move {
                let resp = client.replicate(req).await.map_err(status_err)?;
                let r = resp.into_inner();
                Ok(PeerAck { success: r.success, message: r.message })
            }
        })
        .await
    }

    async fn invalidate(
        &self,
        peer: &str,
        key: &str,
        originator: &str,
    ) -> Result<PeerAck, CacheError> {
        let handle = self.handle(peer).await?;
        with_retry(&self.cfg, "invalidate", peer, || {
            let mut client = handle.client.clone();
            let req = InvalidateRequest {
                key: key.to_string(),
                originator_node_id: originator.to_string(),
            };
            async move {
                let resp = client.invalidate(req).await.map_err(status_err)?;
                let r = resp.into_inner();
                Ok(PeerAck { success: r.success, message: r.message })
            }
        })
        .await
    }

    async fn health_check(&self, peer: &str, originator: &str) -> Result<PeerAck, CacheError> {
        let handle = self.handle(peer).await?;
        with_retry(&self.cfg, "health_check", peer, || {
            let mut client = handle.client.clone();
            let req = HealthCheckRequest { node_id: originator.to_string() };
            async move {
                let resp = client.health_check(req).await.map_err(status_err)?;
                let r = resp.into_inner();
                Ok(PeerAck { success: r.status == "ok", message: r.message })
            }
        })
        .await
    }

    async fn store_get(&self, peer: &str, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let store = self.store(peer).await?;
        store.get(key).await
    }

    async fn store_delete(&self, peer: &str, key: &str) -> Result<(), CacheError> {
        let store = self.store(peer).await?;
        store.delete(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str) -> NodeDescriptor {
        NodeDescriptor {
            node_id: id.to_string(),
            host: "127.0.0.1".to_string(),
            port: 6379,
            peer_port: 7100,
        }
    }

    #[tokio::test]
    async fn unknown_peer_is_an_error_without_io() {
        let transport = GrpcTransport::new(TransportConfig::default());
        let err = transport
            .replicate("ghost", "k", b"{}".to_vec(), None, "n1")
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Peer(_)));
    }

    #[tokio::test]
    async fn add_and_remove_maintain_the_client_table() {
        let transport = GrpcTransport::new(TransportConfig::default());
        transport.add_peer(&descriptor("n2")).await.unwrap();
        transport.add_peer(&descriptor("n3")).await.unwrap();

        let mut ids = transport.peer_ids().await;
        ids.sort();
        assert_eq!(ids, vec!["n2".to_string(), "n3".to_string()]);

        transport.remove_peer("n2").await;
        assert_eq!(transport.peer_ids().await, vec!["n3".to_string()]);
    }
}
