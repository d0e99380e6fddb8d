use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinSet;

use muninn_coord::{MembershipEvent, Registry};
use muninn_peer::PeerTransport;
use muninn_ring::HashRing;
use muninn_store::LocalStore;
use muninn_types::{CacheError, Envelope, NodeDescriptor, NodeId, StoreStats};

use crate::config::EngineConfig;
use crate::metrics::{OpCounters, OpSnapshot};

/// What a callee did with an incoming replica write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaOutcome {
    Applied,
    /// The existing envelope had an older-or-equal timestamp. Equal
    /// timestamps skip too: first-writer-wins under equal clocks. Callers
    /// acknowledge a skip as success.
    SkippedOlder,
}

impl ReplicaOutcome {
    pub fn applied(&self) -> bool {
        matches!(self, ReplicaOutcome::Applied)
    }

    pub fn message(&self) -> &'static str {
        match self {
            ReplicaOutcome::Applied => "applied",
            ReplicaOutcome::SkippedOlder => "skipped: older",
        }
    }
}

/// Combined engine statistics: backing store plus operation counters.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub store: StoreStats,
    pub ops: OpSnapshot,
}

fn validate_key(key: &str) -> Result<(), CacheError> {
    if key.is_empty() {
        return Err(CacheError::InvalidArgument("key must not be empty".into()));
    }
    Ok(())
}

fn wall_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The distributed cache orchestrator.
///
/// Placement comes from the hash ring, persistence from the local store,
/// peer I/O from the transport. Membership events reshape the ring and the
/// transport's client table through [`CacheEngine::handle_membership_event`];
/// the ring starts empty and the host seeds at least the local node before
/// serving (degraded single-node operation when coordination is down).
pub struct CacheEngine<S, T> {
    cfg: EngineConfig,
    store: Arc<S>,
    transport: Arc<T>,
    ring: Arc<RwLock<HashRing>>,
    counters: Arc<OpCounters>,
    /// Last issued envelope timestamp; SETs are strictly monotonic per node.
    clock: AtomicU64,
}

impl<S: LocalStore, T: PeerTransport> CacheEngine<S, T> {
    pub fn new(cfg: EngineConfig, store: Arc<S>, transport: Arc<T>) -> Self {
        let ring = HashRing::new(cfg.ring_virtual_slots);
        CacheEngine {
            cfg,
            store,
            transport,
            ring: Arc::new(RwLock::new(ring)),
            counters: Arc::new(OpCounters::new()),
            clock: AtomicU64::new(0),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.cfg.node_id
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Current ring membership, self included.
    pub async fn members(&self) -> Vec<NodeId> {
        self.ring.read().await.members()
    }

    /// Wall-clock milliseconds, bumped past the last issued timestamp so two
    /// SETs on this node can never tie.
    fn next_timestamp(&self) -> u64 {
        let wall = wall_ms();
        let mut last = self.clock.load(Ordering::Relaxed);
        loop {
            let next = wall.max(last + 1);
            match self.clock.compare_exchange_weak(
                last,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(observed) => last = observed,
            }
        }
    }

    // -----------------------------------------------------------------------
    // Client operations
    // -----------------------------------------------------------------------

    /// Store `value` under `key`, replicate broadly, resolve conflicts by
    /// timestamp. Succeeds when the local replica or any peer took the write.
    pub async fn set(&self, key: &str, value: Value, ttl_secs: Option<u64>) -> Result<(), CacheError> {
        validate_key(key)?;
        self.counters.record_set();

        let envelope = Envelope::new(self.next_timestamp(), value);
        let bytes = envelope.encode()?;

        let (targets, members) = {
            let ring = self.ring.read().await;
            if ring.is_empty() {
                return Err(CacheError::EmptyRing);
            }
            (ring.replicas_for(key, self.cfg.replica_factor), ring.members())
        };
        let peers: Vec<NodeId> = members
            .into_iter()
            .filter(|id| *id != self.cfg.node_id)
            .collect();

        let mut local_ok = false;
        let mut local_err = None;
        if targets.iter().any(|t| *t == self.cfg.node_id) {
            match self.local_set(key, &bytes, ttl_secs).await {
                Ok(()) => local_ok = true,
                Err(e) => {
                    tracing::error!(key, error = %e, "local replica write failed");
                    local_err = Some(e);
                }
            }
        }

        // Replicate to every peer, not only placement targets: replication
        // is deliberately broader than placement so reads from any node see
        // the value even if placement later shifts. Remote targets ride the
        // same conflict-checked path, which keeps a node's stored timestamp
        // from ever moving backwards.
        let acked = Arc::new(AtomicUsize::new(0));
        let mut fanout: JoinSet<()> = JoinSet::new();
        for peer in &peers {
            let transport = self.transport.clone();
            let counters = self.counters.clone();
            let acked = acked.clone();
            let peer = peer.clone();
            let key = key.to_string();
            let bytes = bytes.clone();
            let originator = self.cfg.node_id.clone();
            fanout.spawn(async move {
                match transport.replicate(&peer, &key, bytes, ttl_secs, &originator).await {
                    Ok(ack) if ack.success => {
                        acked.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(ack) => {
                        counters.record_peer_failure();
                        tracing::warn!(peer = %peer, key, message = %ack.message, "peer refused replicate");
                    }
                    Err(e) => {
                        counters.record_peer_failure();
                        tracing::warn!(peer = %peer, key, error = %e, "replicate failed");
                    }
                }
            });
        }
        self.drain_fanout(fanout, "replicate", key).await;

        // Second shot after a delay, covering peers that missed the first
        // round (slow membership propagation, brief partitions).
        self.spawn_secondary_replicate(key.to_string(), peers.clone(), bytes, ttl_secs);

        if local_ok || acked.load(Ordering::Relaxed) > 0 {
            Ok(())
        } else {
            Err(local_err.unwrap_or_else(|| CacheError::Peer("no replica acknowledged the write".into())))
        }
    }

    /// Read `key` from every placement replica and return the freshest value.
    pub async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        validate_key(key)?;
        self.counters.record_get();

        let targets = {
            let ring = self.ring.read().await;
            if ring.is_empty() {
                return Err(CacheError::EmptyRing);
            }
            ring.replicas_for(key, self.cfg.replica_factor)
        };

        let mut reads: JoinSet<Result<Option<Vec<u8>>, CacheError>> = JoinSet::new();
        for target in &targets {
            if *target == self.cfg.node_id {
                let store = self.store.clone();
                let key = key.to_string();
                reads.spawn(async move {
                    match store.get(&key).await {
                        Err(e) if e.is_transient() => store.get(&key).await,
                        other => other,
                    }
                });
            } else {
                let transport = self.transport.clone();
                let target = target.clone();
                let key = key.to_string();
                reads.spawn(async move { transport.store_get(&target, &key).await });
            }
        }

        let total = targets.len();
        let mut errors = 0usize;
        let mut last_err = None;
        let mut best: Option<Envelope> = None;
        let drained = tokio::time::timeout(self.cfg.fanout_deadline, async {
            while let Some(joined) = reads.join_next().await {
                match joined {
                    Ok(Ok(Some(bytes))) => {
                        let env = Envelope::decode(&bytes);
                        if best.as_ref().map(|b| env.timestamp > b.timestamp).unwrap_or(true) {
                            best = Some(env);
                        }
                    }
                    Ok(Ok(None)) => {}
                    Ok(Err(e)) => {
                        tracing::debug!(key, error = %e, "replica read failed");
                        errors += 1;
                        last_err = Some(e);
                    }
                    Err(e) => {
                        errors += 1;
                        last_err = Some(CacheError::Peer(e.to_string()));
                    }
                }
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(key, "read fan-out hit deadline");
        }

        // Unreachable replicas are tolerated; only a fully-failed read
        // surfaces as an error.
        if best.is_none() && errors == total {
            self.counters.record_miss();
            return Err(last_err.unwrap_or(CacheError::Timeout));
        }
        match best {
            Some(env) => {
                self.counters.record_hit();
                Ok(Some(env.data))
            }
            None => {
                self.counters.record_miss();
                Ok(None)
            }
        }
    }

    /// Delete `key` from all known members and invalidate everywhere.
    /// Idempotent; deletes are unconditional and not timestamped.
    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        validate_key(key)?;
        self.counters.record_delete();

        let members = {
            let ring = self.ring.read().await;
            if ring.is_empty() {
                return Err(CacheError::EmptyRing);
            }
            // The delete set is all known members, not just placement
            // replicas: stale copies must not resurface.
            ring.members()
        };
        let peers: Vec<NodeId> = members
            .iter()
            .filter(|id| **id != self.cfg.node_id)
            .cloned()
            .collect();

        let mut local_ok = false;
        if members.iter().any(|m| *m == self.cfg.node_id) {
            match self.local_delete(key).await {
                Ok(()) => local_ok = true,
                Err(e) => tracing::error!(key, error = %e, "local delete failed"),
            }
        }

        let acked = Arc::new(AtomicUsize::new(0));
        let mut fanout: JoinSet<()> = JoinSet::new();
        for peer in &peers {
            // Direct store-channel delete plus Invalidate to the peer's
            // engine; either acknowledgment counts.
            let transport = self.transport.clone();
            let acked_direct = acked.clone();
            let peer_id = peer.clone();
            let key_owned = key.to_string();
            fanout.spawn(async move {
                match transport.store_delete(&peer_id, &key_owned).await {
                    Ok(()) => {
                        acked_direct.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        tracing::debug!(peer = %peer_id, key = %key_owned, error = %e, "direct delete failed")
                    }
                }
            });

            let transport = self.transport.clone();
            let counters = self.counters.clone();
            let acked = acked.clone();
            let peer_id = peer.clone();
            let key_owned = key.to_string();
            let originator = self.cfg.node_id.clone();
            fanout.spawn(async move {
                match transport.invalidate(&peer_id, &key_owned, &originator).await {
                    Ok(ack) if ack.success => {
                        acked.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(ack) => {
                        counters.record_peer_failure();
                        tracing::warn!(peer = %peer_id, key = %key_owned, message = %ack.message, "peer refused invalidate");
                    }
                    Err(e) => {
                        counters.record_peer_failure();
                        tracing::warn!(peer = %peer_id, key = %key_owned, error = %e, "invalidate failed");
                    }
                }
            });
        }
        self.drain_fanout(fanout, "invalidate", key).await;

        self.spawn_secondary_invalidate(key.to_string(), peers.clone());

        if local_ok || acked.load(Ordering::Relaxed) > 0 {
            Ok(())
        } else {
            Err(CacheError::Peer("no replica acknowledged the delete".into()))
        }
    }

    pub async fn stats(&self) -> Result<CacheStats, CacheError> {
        let store = self.store.stats().await?;
        Ok(CacheStats { store, ops: self.counters.snapshot() })
    }

    /// Whether the backing store answers.
    pub async fn healthy(&self) -> bool {
        self.store.stats().await.is_ok()
    }

    pub fn counters(&self) -> &OpCounters {
        &self.counters
    }

    // -----------------------------------------------------------------------
    // Callee-side paths (dispatched by the peer RPC server)
    // -----------------------------------------------------------------------

    /// Apply an incoming replica write under the conflict rule: a wrapped
    /// existing envelope with an older-or-equal timestamp wins and the write
    /// is skipped.
    pub async fn apply_replicate(
        &self,
        key: &str,
        incoming: &[u8],
        ttl_secs: Option<u64>,
        originator: &str,
    ) -> Result<ReplicaOutcome, CacheError> {
        validate_key(key)?;
        let incoming_ts = Envelope::decode(incoming).timestamp;
        if let Some(existing) = self.local_get(key).await? {
            let current = Envelope::decode(&existing);
            if current.timestamp > 0 && current.timestamp >= incoming_ts {
                self.counters.record_replicate_skipped();
                tracing::debug!(
                    key,
                    originator,
                    current = current.timestamp,
                    incoming = incoming_ts,
                    "replica skipped"
                );
                return Ok(ReplicaOutcome::SkippedOlder);
            }
        }
        self.local_set(key, incoming, ttl_secs).await?;
        self.counters.record_replicate_applied();
        tracing::debug!(key, originator, timestamp = incoming_ts, "replica applied");
        Ok(ReplicaOutcome::Applied)
    }

    /// Unconditionally drop `key` from the local store.
    pub async fn apply_invalidate(&self, key: &str, originator: &str) -> Result<(), CacheError> {
        validate_key(key)?;
        self.local_delete(key).await?;
        self.counters.record_invalidate();
        tracing::debug!(key, originator, "invalidated");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Membership
    // -----------------------------------------------------------------------

    pub async fn handle_membership_event(&self, event: MembershipEvent) {
        match event {
            MembershipEvent::Added { descriptor } => self.add_member(&descriptor).await,
            MembershipEvent::Removed { node_id } => self.remove_member(&node_id).await,
        }
    }

    pub async fn add_member(&self, descriptor: &NodeDescriptor) {
        {
            self.ring.write().await.add_node(&descriptor.node_id);
        }
        // The local node is never a peer client of itself.
        if descriptor.node_id != self.cfg.node_id {
            if let Err(e) = self.transport.add_peer(descriptor).await {
                tracing::warn!(peer = %descriptor.node_id, error = %e, "failed to prepare peer client");
            }
        }
        tracing::info!(node = %descriptor.node_id, "member added");
    }

    pub async fn remove_member(&self, node_id: &str) {
        if node_id == self.cfg.node_id {
            // A registry hiccup must not take the local node out of its own
            // ring; the session maintainer re-registers on its own.
            tracing::debug!("ignoring membership removal of the local node");
            return;
        }
        {
            self.ring.write().await.remove_node(node_id);
        }
        self.transport.remove_peer(node_id).await;
        tracing::info!(node = node_id, "member removed");
    }

    /// Reconcile the ring against a full membership snapshot.
    pub async fn sync_members(&self, members: &HashMap<NodeId, NodeDescriptor>) {
        for descriptor in members.values() {
            self.add_member(descriptor).await;
        }
        let current = { self.ring.read().await.members() };
        for id in current {
            if id != self.cfg.node_id && !members.contains_key(&id) {
                self.remove_member(&id).await;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn drain_fanout(&self, mut fanout: JoinSet<()>, op: &'static str, key: &str) {
        let drained = tokio::time::timeout(self.cfg.fanout_deadline, async {
            while fanout.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(op, key, "fan-out hit deadline; aborting stragglers");
            fanout.abort_all();
        }
    }

    fn spawn_secondary_replicate(
        &self,
        key: String,
        peers: Vec<NodeId>,
        bytes: Vec<u8>,
        ttl_secs: Option<u64>,
    ) {
        if peers.is_empty() {
            return;
        }
        let transport = self.transport.clone();
        let originator = self.cfg.node_id.clone();
        let delay = self.cfg.secondary_replicate_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            for peer in peers {
                let transport = transport.clone();
                let key = key.clone();
                let bytes = bytes.clone();
                let originator = originator.clone();
                tokio::spawn(async move {
                    if let Err(e) = transport.replicate(&peer, &key, bytes, ttl_secs, &originator).await {
                        tracing::debug!(peer = %peer, key = %key, error = %e, "secondary replicate failed");
                    }
                });
            }
        });
    }

    fn spawn_secondary_invalidate(&self, key: String, peers: Vec<NodeId>) {
        if peers.is_empty() {
            return;
        }
        let transport = self.transport.clone();
        let originator = self.cfg.node_id.clone();
        let delay = self.cfg.secondary_invalidate_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            for peer in peers {
                let transport = transport.clone();
                let key = key.clone();
                let originator = originator.clone();
                tokio::spawn(async move {
                    if let Err(e) = transport.invalidate(&peer, &key, &originator).await {
                        tracing::debug!(peer = %peer, key = %key, error = %e, "secondary invalidate failed");
                    }
                });
            }
        });
    }

    // Local store access with a single retry on transient failures.

    async fn local_get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        match self.store.get(key).await {
            Err(e) if e.is_transient() => self.store.get(key).await,
            other => other,
        }
    }

    async fn local_set(&self, key: &str, bytes: &[u8], ttl_secs: Option<u64>) -> Result<(), CacheError> {
        match self.store.set(key, bytes.to_vec(), ttl_secs).await {
            Err(e) if e.is_transient() => {
                tracing::warn!(key, error = %e, "local store write failed; retrying once");
                self.store.set(key, bytes.to_vec(), ttl_secs).await
            }
            other => other,
        }
    }

    async fn local_delete(&self, key: &str) -> Result<(), CacheError> {
        match self.store.delete(key).await {
            Err(e) if e.is_transient() => self.store.delete(key).await,
            other => other,
        }
    }
}

/// Seed the engine from the registry and keep consuming membership deltas.
///
/// One task serializes all ring mutation. If coordination is unreachable at
/// boot the engine keeps whatever the host seeded (typically a self-only
/// ring) and catches up when events start flowing.
pub async fn run_membership<S, T, R>(engine: Arc<CacheEngine<S, T>>, registry: Arc<R>)
where
    S: LocalStore,
    T: PeerTransport,
    R: Registry,
{
    let mut events = registry.subscribe();
    match registry.members().await {
        Ok(members) => engine.sync_members(&members).await,
        Err(e) => {
            tracing::warn!(error = %e, "coordination unreachable; continuing with seeded ring")
        }
    }
    loop {
        match events.recv().await {
            Ok(event) => engine.handle_membership_event(event).await,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "membership events lagged; resyncing");
                if let Ok(members) = registry.members().await {
                    engine.sync_members(&members).await;
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
