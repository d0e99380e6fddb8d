use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use etcd_client::{Client, EventType, GetOptions, PutOptions, WatchOptions};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;

use muninn_types::{CacheError, NodeDescriptor, NodeId};

use crate::{diff_members, MembershipEvent, Registry};

fn coord_err(e: etcd_client::Error) -> CacheError {
    CacheError::Coordination(e.to_string())
}

#[derive(Debug, Clone)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,
    /// Directory containing one session-bound child per live node.
    pub base_path: String,
    pub session_ttl_secs: i64,
    /// Snapshot re-read cadence while the watch is down.
    pub poll_interval: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max_attempts: u32,
    pub event_capacity: usize,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        EtcdConfig {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            base_path: "/redis-cache/nodes".to_string(),
            session_ttl_secs: 5,
            poll_interval: Duration::from_secs(2),
            reconnect_base: Duration::from_secs(1),
            reconnect_max_attempts: 10,
            event_capacity: 64,
        }
    }
}

impl EtcdConfig {
    fn member_key(&self, node_id: &str) -> String {
        format!("{}/{}", self.base_path.trim_end_matches('/'), node_id)
    }

    fn backoff_after(&self, failures: u32) -> Duration {
        let shift = failures
            .saturating_sub(1)
            .min(self.reconnect_max_attempts.saturating_sub(1));
        self.reconnect_base.saturating_mul(1u32 << shift.min(20))
    }
}

/// Session-bound membership registry on etcd.
///
/// Registrations are leased: the lease is kept alive from a background task,
/// so a crash or partition expires the registration without any cleanup from
/// this process. A second background task maintains the event stream:
/// watching the membership prefix when it can, polling snapshots when it
/// cannot, and re-diffing the full member list after every reconnect so no
/// delta is lost.
pub struct EtcdRegistry {
    client: Client,
    cfg: EtcdConfig,
    tx: broadcast::Sender<MembershipEvent>,
    lease: Arc<RwLock<Option<i64>>>,
    session_task: Mutex<Option<JoinHandle<()>>>,
    stream_task: JoinHandle<()>,
}

impl EtcdRegistry {
    pub async fn connect(cfg: EtcdConfig) -> Result<Self, CacheError> {
        let client = Client::connect(cfg.endpoints.clone(), None)
            .await
            .map_err(coord_err)?;
        let (tx, _) = broadcast::channel(cfg.event_capacity.max(1));
        let stream_task = tokio::spawn(membership_stream(
            client.clone(),
            cfg.clone(),
            tx.clone(),
        ));
        Ok(EtcdRegistry {
            client,
            cfg,
            tx,
            lease: Arc::new(RwLock::new(None)),
            session_task: Mutex::new(None),
            stream_task,
        })
    }
}

impl Drop for EtcdRegistry {
    fn drop(&mut self) {
        self.stream_task.abort();
        if let Ok(mut guard) = self.session_task.try_lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
    }
}

impl Registry for EtcdRegistry {
    async fn register(&self, descriptor: &NodeDescriptor) -> Result<(), CacheError> {
        let session = Session::establish(self.client.clone(), &self.cfg, descriptor).await?;
        *self.lease.write().await = Some(session.lease_id);
        tracing::info!(
            node_id = %descriptor.node_id,
            lease_id = session.lease_id,
            "registered with coordination service"
        );

        let task = tokio::spawn(maintain_session(
            session,
            self.client.clone(),
            self.cfg.clone(),
            descriptor.clone(),
            self.lease.clone(),
        ));
        if let Some(previous) = self.session_task.lock().await.replace(task) {
            previous.abort();
        }
        Ok(())
    }

    async fn unregister(&self, node_id: &str) -> Result<(), CacheError> {
        if let Some(task) = self.session_task.lock().await.take() {
            task.abort();
        }
        let mut client = self.client.clone();
        client
            .delete(self.cfg.member_key(node_id), None)
            .await
            .map_err(coord_err)?;
        if let Some(lease_id) = self.lease.write().await.take() {
            // Best effort: the lease would expire on its own anyway.
            let _ = client.lease_revoke(lease_id).await;
        }
        tracing::info!(node_id, "unregistered from coordination service");
        Ok(())
    }

    async fn members(&self) -> Result<HashMap<NodeId, NodeDescriptor>, CacheError> {
        let mut client = self.client.clone();
        read_members(&mut client, &self.cfg).await
    }

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.tx.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Session: leased registration + keepalive
// ---------------------------------------------------------------------------

struct Session {
    lease_id: i64,
    keeper: etcd_client::LeaseKeeper,
    responses: etcd_client::LeaseKeepAliveStream,
}

impl Session {
    async fn establish(
        client: Client,
        cfg: &EtcdConfig,
        descriptor: &NodeDescriptor,
    ) -> Result<Session, CacheError> {
        let mut client = client;
        let lease = client
            .lease_grant(cfg.session_ttl_secs, None)
            .await
            .map_err(coord_err)?;
        let key = cfg.member_key(&descriptor.node_id);
        // A stale child from an expired session must go before re-registering,
        // so exactly one descriptor per node id is ever live.
        client.delete(key.clone(), None).await.map_err(coord_err)?;
        let payload = serde_json::to_vec(descriptor)
            .map_err(|e| CacheError::Coordination(e.to_string()))?;
        client
            .put(key, payload, Some(PutOptions::new().with_lease(lease.id())))
            .await
            .map_err(coord_err)?;
        let (keeper, responses) = client
            .lease_keep_alive(lease.id())
            .await
            .map_err(coord_err)?;
        Ok(Session { lease_id: lease.id(), keeper, responses })
    }

    /// Tick keepalives until the session is lost.
    async fn keep(mut self, session_ttl_secs: i64) {
        let tick = Duration::from_secs((session_ttl_secs as u64 / 2).max(1));
        let mut ticker = tokio::time::interval(tick);
        loop {
            ticker.tick().await;
            if self.keeper.keep_alive().await.is_err() {
                return;
            }
            match self.responses.message().await {
                Ok(Some(resp)) if resp.ttl() > 0 => {}
                _ => return,
            }
        }
    }
}

async fn maintain_session(
    first: Session,
    client: Client,
    cfg: EtcdConfig,
    descriptor: NodeDescriptor,
    lease: Arc<RwLock<Option<i64>>>,
) {
    let mut session = Some(first);
    let mut failures: u32 = 0;
    loop {
        if let Some(s) = session.take() {
            s.keep(cfg.session_ttl_secs).await;
            tracing::warn!(node_id = %descriptor.node_id, "coordination session lost");
            failures = 1;
        }
        tokio::time::sleep(cfg.backoff_after(failures)).await;
        match Session::establish(client.clone(), &cfg, &descriptor).await {
            Ok(s) => {
                *lease.write().await = Some(s.lease_id);
                tracing::info!(node_id = %descriptor.node_id, lease_id = s.lease_id, "re-registered");
                session = Some(s);
                failures = 0;
            }
            Err(e) => {
                failures += 1;
                tracing::warn!(error = %e, failures, "re-registration failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Membership stream: Watching <-> Polling
// ---------------------------------------------------------------------------

async fn membership_stream(
    client: Client,
    cfg: EtcdConfig,
    tx: broadcast::Sender<MembershipEvent>,
) {
    let mut known: HashMap<NodeId, NodeDescriptor> = HashMap::new();
    let mut failures: u32 = 0;
    loop {
        if failures > 0 {
            // Watch is down: poll snapshots for the whole backoff window so
            // membership keeps moving even while reconnection is failing.
            poll_for(client.clone(), &cfg, &tx, &mut known, cfg.backoff_after(failures)).await;
        }

        let mut watch_client = client.clone();
        match watch_client
            .watch(cfg.base_path.clone(), Some(WatchOptions::new().with_prefix()))
            .await
        {
            Ok((_watcher, mut stream)) => {
                failures = 0;
                // Anything that changed while away is synthesized from a diff.
                resync(client.clone(), &cfg, &tx, &mut known).await;
                tracing::info!(base_path = %cfg.base_path, "membership watch established");
                loop {
                    match stream.message().await {
                        Ok(Some(resp)) => apply_watch_response(&resp, &tx, &mut known),
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!(error = %e, "membership watch error");
                            break;
                        }
                    }
                }
                failures = 1;
                tracing::warn!("membership watch lost; entering polling mode");
            }
            Err(e) => {
                failures += 1;
                tracing::warn!(error = %e, failures, "failed to establish membership watch");
            }
        }
    }
}

fn apply_watch_response(
    resp: &etcd_client::WatchResponse,
    tx: &broadcast::Sender<MembershipEvent>,
    known: &mut HashMap<NodeId, NodeDescriptor>,
) {
    for event in resp.events() {
        let Some(kv) = event.kv() else { continue };
        let Ok(key) = kv.key_str() else { continue };
        let node_id = key.rsplit('/').next().unwrap_or(key).to_string();
        match event.event_type() {
            EventType::Put => match serde_json::from_slice::<NodeDescriptor>(kv.value()) {
                Ok(descriptor) => {
                    known.insert(node_id, descriptor.clone());
                    let _ = tx.send(MembershipEvent::Added { descriptor });
                }
                Err(e) => {
                    tracing::warn!(key, error = %e, "ignoring malformed member record")
                }
            },
            EventType::Delete => {
                known.remove(&node_id);
                let _ = tx.send(MembershipEvent::Removed { node_id });
            }
        }
    }
}

async fn resync(
    client: Client,
    cfg: &EtcdConfig,
    tx: &broadcast::Sender<MembershipEvent>,
    known: &mut HashMap<NodeId, NodeDescriptor>,
) {
    let mut client = client;
    match read_members(&mut client, cfg).await {
        Ok(current) => {
            for event in diff_members(known, &current) {
                let _ = tx.send(event);
            }
            *known = current;
        }
        Err(e) => tracing::warn!(error = %e, "membership snapshot failed"),
    }
}

async fn poll_for(
    client: Client,
    cfg: &EtcdConfig,
    tx: &broadcast::Sender<MembershipEvent>,
    known: &mut HashMap<NodeId, NodeDescriptor>,
    window: Duration,
) {
    let deadline = tokio::time::Instant::now() + window;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return;
        }
        let step = cfg.poll_interval.min(remaining);
        tokio::time::sleep(step).await;
        resync(client.clone(), cfg, tx, known).await;
        if tokio::time::Instant::now() >= deadline {
            return;
        }
    }
}

async fn read_members(
    client: &mut Client,
    cfg: &EtcdConfig,
) -> Result<HashMap<NodeId, NodeDescriptor>, CacheError> {
    let resp = client
        .get(cfg.base_path.clone(), Some(GetOptions::new().with_prefix()))
        .await
        .map_err(coord_err)?;
    let mut members = HashMap::new();
    for kv in resp.kvs() {
        let Ok(key) = kv.key_str() else { continue };
        let node_id = key.rsplit('/').next().unwrap_or(key);
        match serde_json::from_slice::<NodeDescriptor>(kv.value()) {
            Ok(descriptor) => {
                members.insert(node_id.to_string(), descriptor);
            }
            Err(e) => tracing::warn!(key, error = %e, "skipping malformed member record"),
        }
    }
    Ok(members)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_key_joins_base_and_id() {
        let cfg = EtcdConfig::default();
        assert_eq!(cfg.member_key("n1"), "/redis-cache/nodes/n1");

        let trailing = EtcdConfig { base_path: "/x/".to_string(), ..EtcdConfig::default() };
        assert_eq!(trailing.member_key("n1"), "/x/n1");
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let cfg = EtcdConfig::default();
        assert_eq!(cfg.backoff_after(1), Duration::from_secs(1));
        assert_eq!(cfg.backoff_after(2), Duration::from_secs(2));
        assert_eq!(cfg.backoff_after(4), Duration::from_secs(8));
        // Capped at reconnect_max_attempts doublings.
        assert_eq!(cfg.backoff_after(100), cfg.backoff_after(cfg.reconnect_max_attempts));
    }
}
