use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};

use muninn_types::{CacheError, NodeDescriptor, NodeId};

use crate::{MembershipEvent, Registry};

/// In-process `Registry` shared by every node of a test cluster.
///
/// Single-node deployments can use it too: the local node registers against
/// it and simply never sees peers.
#[derive(Clone)]
pub struct MemRegistry {
    members: Arc<RwLock<HashMap<NodeId, NodeDescriptor>>>,
    tx: broadcast::Sender<MembershipEvent>,
}

impl MemRegistry {
    pub fn new(event_capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(event_capacity.max(1));
        MemRegistry { members: Arc::new(RwLock::new(HashMap::new())), tx }
    }
}

impl Default for MemRegistry {
    fn default() -> Self {
        Self::new(64)
    }
}

impl Registry for MemRegistry {
    async fn register(&self, descriptor: &NodeDescriptor) -> Result<(), CacheError> {
        self.members
            .write()
            .await
            .insert(descriptor.node_id.clone(), descriptor.clone());
        let _ = self.tx.send(MembershipEvent::Added { descriptor: descriptor.clone() });
        Ok(())
    }

    async fn unregister(&self, node_id: &str) -> Result<(), CacheError> {
        if self.members.write().await.remove(node_id).is_some() {
            let _ = self.tx.send(MembershipEvent::Removed { node_id: node_id.to_string() });
        }
        Ok(())
    }

    async fn members(&self) -> Result<HashMap<NodeId, NodeDescriptor>, CacheError> {
        Ok(self.members.read().await.clone())
    }

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.tx.subscribe()
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
            peer_port: 7000,
        }
    }

    #[tokio::test]
    async fn register_appears_in_snapshot_and_stream() {
        let registry = MemRegistry::default();
        let mut events = registry.subscribe();

        registry.register(&descriptor("n1")).await.unwrap();

        let members = registry.members().await.unwrap();
        assert_eq!(members.len(), 1);
        assert!(members.contains_key("n1"));

        match events.recv().await.unwrap() {
            MembershipEvent::Added { descriptor } => assert_eq!(descriptor.node_id, "n1"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unregister_emits_removed_once() {
        let registry = MemRegistry::default();
        registry.register(&descriptor("n1")).await.unwrap();

        let mut events = registry.subscribe();
        registry.unregister("n1").await.unwrap();
        registry.unregister("n1").await.unwrap();

        match events.recv().await.unwrap() {
            MembershipEvent::Removed { node_id } => assert_eq!(node_id, "n1"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(events.try_recv().is_err());
        assert!(registry.members().await.unwrap().is_empty());
    }
}
