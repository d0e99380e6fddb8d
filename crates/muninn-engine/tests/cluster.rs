//! Multi-node scenarios on an in-process cluster: every engine gets its own
//! `MemStore`, and a loopback transport routes peer calls straight into the
//! other engines' callee paths.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinSet;

use muninn_coord::{MemRegistry, Registry};
use muninn_engine::{run_membership, CacheEngine, EngineConfig};
use muninn_peer::{PeerAck, PeerTransport};
use muninn_store::{LocalStore, MemStore};
use muninn_types::{CacheError, Envelope, NodeDescriptor, NodeId};

type TestEngine = CacheEngine<MemStore, LoopbackTransport>;

#[derive(Clone)]
struct NodeHandle {
    engine: Arc<TestEngine>,
    store: MemStore,
    up: Arc<AtomicBool>,
}

#[derive(Clone, Default)]
struct Cluster {
    nodes: Arc<std::sync::RwLock<HashMap<NodeId, NodeHandle>>>,
}

impl Cluster {
    fn node(&self, id: &str) -> Option<NodeHandle> {
        self.nodes.read().unwrap().get(id).cloned()
    }

    fn live_node(&self, id: &str) -> Result<NodeHandle, CacheError> {
        let node = self
            .node(id)
            .ok_or_else(|| CacheError::Peer(format!("unknown node {id}")))?;
        if !node.up.load(Ordering::SeqCst) {
            return Err(CacheError::Peer(format!("node {id} is down")));
        }
        Ok(node)
    }

    fn set_up(&self, id: &str, up: bool) {
        if let Some(node) = self.node(id) {
            node.up.store(up, Ordering::SeqCst);
        }
    }
}

/// Routes peer RPCs into the target engine's callee paths and the store
/// channel into the target's `MemStore`. A node marked down fails every
/// call, which is what a partition looks like to the caller.
struct LoopbackTransport {
    cluster: Cluster,
    peers: std::sync::RwLock<HashSet<NodeId>>,
}

impl LoopbackTransport {
    fn new(cluster: Cluster) -> Self {
        LoopbackTransport { cluster, peers: std::sync::RwLock::new(HashSet::new()) }
    }

    fn known(&self, peer: &str) -> Result<(), CacheError> {
        if self.peers.read().unwrap().contains(peer) {
            Ok(())
        } else {
            Err(CacheError::Peer(format!("unknown peer {peer}")))
        }
    }
}

impl PeerTransport for LoopbackTransport {
    async fn add_peer(&self, descriptor: &NodeDescriptor) -> Result<(), CacheError> {
        self.peers.write().unwrap().insert(descriptor.node_id.clone());
        Ok(())
    }

    async fn remove_peer(&self, node_id: &str) {
        self.peers.write().unwrap().remove(node_id);
    }

    async fn peer_ids(&self) -> Vec<String> {
        self.peers.read().unwrap().iter().cloned().collect()
    }

    async fn replicate(
        &self,
        peer: &str,
        key: &str,
        envelope: Vec<u8>,
        ttl_secs: Option<u64>,
        originator: &str,
    ) -> Result<PeerAck, CacheError> {
        self.known(peer)?;
        let node = self.cluster.live_node(peer)?;
        let outcome = node.engine.apply_replicate(key, &envelope, ttl_secs, originator).await?;
        Ok(PeerAck { success: true, message: outcome.message().to_string() })
    }

    async fn invalidate(
        &self,
        peer: &str,
        key: &str,
        originator: &str,
    ) -> Result<PeerAck, CacheError> {
        self.known(peer)?;
        let node = self.cluster.live_node(peer)?;
        node.engine.apply_invalidate(key, originator).await?;
        Ok(PeerAck { success: true, message: "ok".to_string() })
    }

    async fn health_check(&self, peer: &str, _originator: &str) -> Result<PeerAck, CacheError> {
        self.known(peer)?;
        self.cluster.live_node(peer)?;
        Ok(PeerAck { success: true, message: "ok".to_string() })
    }

    async fn store_get(&self, peer: &str, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.known(peer)?;
        let node = self.cluster.live_node(peer)?;
        node.store.get(key).await
    }

    async fn store_delete(&self, peer: &str, key: &str) -> Result<(), CacheError> {
        self.known(peer)?;
        let node = self.cluster.live_node(peer)?;
        node.store.delete(key).await
    }
}

fn descriptor(id: &str) -> NodeDescriptor {
    NodeDescriptor {
        node_id: id.to_string(),
        host: "127.0.0.1".to_string(),
        port: 0,
        peer_port: 0,
    }
}

async fn start_cluster(ids: &[&str]) -> (Cluster, HashMap<String, Arc<TestEngine>>) {
    let cluster = Cluster::default();
    let mut engines = HashMap::new();
    for id in ids {
        let store = MemStore::new();
        let transport = Arc::new(LoopbackTransport::new(cluster.clone()));
        let engine = Arc::new(CacheEngine::new(
            EngineConfig::new(*id),
            Arc::new(store.clone()),
            transport,
        ));
        cluster.nodes.write().unwrap().insert(
            id.to_string(),
            NodeHandle { engine: engine.clone(), store, up: Arc::new(AtomicBool::new(true)) },
        );
        engines.insert(id.to_string(), engine);
    }
    for engine in engines.values() {
        for id in ids {
            engine.add_member(&descriptor(id)).await;
        }
    }
    (cluster, engines)
}

async fn eventually<F, Fut>(mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if cond().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread")]
async fn set_on_one_node_reads_from_every_node() {
    let (_cluster, engines) = start_cluster(&["n1", "n2", "n3"]).await;

    engines["n1"].set("k", json!("v1"), None).await.unwrap();

    for id in ["n1", "n2", "n3"] {
        assert_eq!(engines[id].get("k").await.unwrap(), Some(json!("v1")));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn later_write_wins_everywhere() {
    let (_cluster, engines) = start_cluster(&["n1", "n2", "n3"]).await;

    engines["n1"].set("k", json!("old"), None).await.unwrap();
    // Make sure the second write lands on a later wall-clock millisecond.
    tokio::time::sleep(Duration::from_millis(5)).await;
    engines["n2"].set("k", json!("new"), None).await.unwrap();

    for id in ["n1", "n2", "n3"] {
        assert_eq!(engines[id].get("k").await.unwrap(), Some(json!("new")));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn reversed_delivery_still_converges() {
    let (_cluster, engines) = start_cluster(&["n1", "n2", "n3"]).await;

    // n3 sees the writes out of order; the timestamp rule decides anyway.
    let newer = Envelope::new(2000, json!("new")).encode().unwrap();
    let older = Envelope::new(1000, json!("old")).encode().unwrap();
    engines["n3"].apply_replicate("k", &newer, None, "n2").await.unwrap();
    engines["n3"].apply_replicate("k", &older, None, "n1").await.unwrap();

    assert_eq!(engines["n3"].get("k").await.unwrap(), Some(json!("new")));
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_propagates_to_every_node() {
    let (cluster, engines) = start_cluster(&["n1", "n2", "n3"]).await;

    engines["n1"].set("k", json!("v"), None).await.unwrap();
    engines["n2"].delete("k").await.unwrap();

    for id in ["n1", "n2", "n3"] {
        assert_eq!(engines[id].get("k").await.unwrap(), None);
        // Gone from the backing stores, not just masked.
        assert_eq!(cluster.node(id).unwrap().store.get("k").await.unwrap(), None);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn survives_a_dead_node_and_catches_up_after_restart() {
    let (cluster, engines) = start_cluster(&["n1", "n2", "n3"]).await;

    engines["n1"].set("k", json!("v"), None).await.unwrap();

    cluster.set_up("n2", false);
    assert_eq!(engines["n1"].get("k").await.unwrap(), Some(json!("v")));
    assert_eq!(engines["n3"].get("k").await.unwrap(), Some(json!("v")));

    // Writes keep succeeding while a peer is down.
    engines["n1"].set("k2", json!("v2"), None).await.unwrap();
    assert_eq!(engines["n3"].get("k2").await.unwrap(), Some(json!("v2")));

    // After the node returns, a fresh write reaches it again.
    cluster.set_up("n2", true);
    engines["n1"].set("k3", json!("v3"), None).await.unwrap();
    assert!(cluster.node("n2").unwrap().store.get("k3").await.unwrap().is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn replica_set_shrinking_mid_flight_is_tolerated() {
    let (_cluster, engines) = start_cluster(&["n1", "n2", "n3"]).await;

    engines["n1"].set("k", json!("v"), None).await.unwrap();
    engines["n1"].remove_member("n3").await;

    assert_eq!(engines["n1"].get("k").await.unwrap(), Some(json!("v")));
    engines["n1"].set("k", json!("v2"), None).await.unwrap();
    assert_eq!(engines["n1"].get("k").await.unwrap(), Some(json!("v2")));
}

#[tokio::test(flavor = "multi_thread")]
async fn single_node_cluster_works_without_peers() {
    let (_cluster, engines) = start_cluster(&["solo"]).await;

    engines["solo"].set("k", json!(1), Some(0)).await.unwrap();
    assert_eq!(engines["solo"].get("k").await.unwrap(), Some(json!(1)));
    engines["solo"].delete("k").await.unwrap();
    assert_eq!(engines["solo"].get("k").await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn ttl_expires_on_every_node() {
    let (_cluster, engines) = start_cluster(&["n1", "n2", "n3"]).await;

    engines["n1"].set("k", json!("v"), Some(5)).await.unwrap();

    tokio::time::advance(Duration::from_secs(2)).await;
    for id in ["n1", "n2", "n3"] {
        assert_eq!(engines[id].get("k").await.unwrap(), Some(json!("v")));
    }

    tokio::time::advance(Duration::from_secs(5)).await;
    for id in ["n1", "n2", "n3"] {
        assert_eq!(engines[id].get("k").await.unwrap(), None);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn freshest_replica_beats_a_legacy_copy() {
    let (cluster, engines) = start_cluster(&["n1", "n2", "n3"]).await;

    engines["n1"].set("k", json!("wrapped"), None).await.unwrap();
    // One replica holds an unwrapped legacy payload; it counts as
    // timestamp 0 and loses to any wrapped value.
    cluster.node("n2").unwrap().store.set("k", b"legacy".to_vec(), None).await.unwrap();

    for id in ["n1", "n2", "n3"] {
        assert_eq!(engines[id].get("k").await.unwrap(), Some(json!("wrapped")));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_sets_are_readable_everywhere() {
    let (_cluster, engines) = start_cluster(&["n1", "n2", "n3"]).await;
    let ids = ["n1", "n2", "n3"];

    let mut writers = JoinSet::new();
    for w in 0..10usize {
        let engine = engines[ids[w % 3]].clone();
        writers.spawn(async move {
            for i in 0..20 {
                tokio::time::sleep(Duration::from_millis(rand::random::<u64>() % 5)).await;
                let key = format!("key-{w}-{i}");
                engine.set(&key, json!(i), None).await.unwrap();
            }
        });
    }
    while let Some(joined) = writers.join_next().await {
        joined.unwrap();
    }

    for w in 0..10usize {
        for i in 0..20 {
            let key = format!("key-{w}-{i}");
            for engine in engines.values() {
                assert_eq!(engine.get(&key).await.unwrap(), Some(json!(i)), "key {key}");
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn membership_task_tracks_the_registry() {
    let cluster = Cluster::default();
    let store = MemStore::new();
    let transport = Arc::new(LoopbackTransport::new(cluster.clone()));
    let engine = Arc::new(CacheEngine::new(
        EngineConfig::new("n1"),
        Arc::new(store.clone()),
        transport,
    ));
    cluster.nodes.write().unwrap().insert(
        "n1".to_string(),
        NodeHandle { engine: engine.clone(), store, up: Arc::new(AtomicBool::new(true)) },
    );

    let registry = Arc::new(MemRegistry::default());
    registry.register(&descriptor("n1")).await.unwrap();

    let task = tokio::spawn(run_membership(engine.clone(), registry.clone()));

    eventually(|| {
        let engine = engine.clone();
        async move { engine.members().await.contains(&"n1".to_string()) }
    })
    .await;

    registry.register(&descriptor("n2")).await.unwrap();
    eventually(|| {
        let engine = engine.clone();
        async move { engine.members().await.contains(&"n2".to_string()) }
    })
    .await;

    registry.unregister("n2").await.unwrap();
    eventually(|| {
        let engine = engine.clone();
        async move { !engine.members().await.contains(&"n2".to_string()) }
    })
    .await;

    task.abort();
}
