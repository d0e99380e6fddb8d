//! Typed, retrying, timeout-bounded RPC to cache peers.
//!
//! The engine talks to peers through the [`PeerTransport`] trait: the three
//! cache RPCs plus the store channel (direct access to a peer's backing
//! store, used for replica reads on GET and direct writes on SET/DELETE).
//! [`GrpcTransport`] is the production implementation; tests wire engines
//! together with an in-process implementation instead.

pub mod grpc;

use std::future::Future;
use std::time::Duration;

use muninn_types::{CacheError, NodeDescriptor};

pub use grpc::GrpcTransport;

/// Outcome of a single peer RPC.
#[derive(Debug, Clone)]
pub struct PeerAck {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Per-attempt RPC deadline.
    pub rpc_deadline: Duration,
    /// Attempts per peer per operation.
    pub max_retries: u32,
    /// Backoff before attempt `n` is `retry_backoff_base * n`.
    pub retry_backoff_base: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            rpc_deadline: Duration::from_secs(3),
            max_retries: 3,
            retry_backoff_base: Duration::from_millis(500),
            keepalive_interval: Duration::from_secs(10),
            keepalive_timeout: Duration::from_secs(5),
        }
    }
}

/// Peer-facing side of the cache protocol.
///
/// One cached client per peer, created lazily on first send and dropped on
/// membership removal. A failure against one peer never fails the caller's
/// fan-out; callers aggregate acks themselves.
pub trait PeerTransport: Send + Sync + 'static {
    /// Make `descriptor` reachable. Cheap; connections are established
    /// lazily on first send. Re-adding a peer refreshes its descriptor.
    fn add_peer(&self, descriptor: &NodeDescriptor)
        -> impl Future<Output = Result<(), CacheError>> + Send;

    /// Drop the cached client (and store channel) for `node_id`.
    fn remove_peer(&self, node_id: &str) -> impl Future<Output = ()> + Send;

    /// Ids of every currently reachable peer.
    fn peer_ids(&self) -> impl Future<Output = Vec<String>> + Send;

    fn replicate(
        &self,
        peer: &str,
        key: &str,
        envelope: Vec<u8>,
        ttl_secs: Option<u64>,
        originator: &str,
    ) -> impl Future<Output = Result<PeerAck, CacheError>> + Send;

    fn invalidate(
        &self,
        peer: &str,
        key: &str,
        originator: &str,
    ) -> impl Future<Output = Result<PeerAck, CacheError>> + Send;

    fn health_check(
        &self,
        peer: &str,
        originator: &str,
    ) -> impl Future<Output = Result<PeerAck, CacheError>> + Send;

    /// Store channel: read `key` straight from the peer's backing store.
    fn store_get(
        &self,
        peer: &str,
        key: &str,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, CacheError>> + Send;

    /// Store channel: delete `key` straight from the peer's backing store.
    fn store_delete(
        &self,
        peer: &str,
        key: &str,
    ) -> impl Future<Output = Result<(), CacheError>> + Send;
}

/// Run `op` up to `cfg.max_retries` times with progressive backoff.
///
/// Only transient errors are retried; a peer that actively rejects the
/// request fails immediately (the caller logs and skips that peer).
pub async fn with_retry<T, F, Fut>(
    cfg: &TransportConfig,
    op_name: &'static str,
    peer: &str,
    mut op: F,
) -> Result<T, CacheError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CacheError>>,
{
    let attempts = cfg.max_retries.max(1);
    let mut last = None;
    for attempt in 0..attempts {
        if attempt > 0 {
            tokio::time::sleep(cfg.retry_backoff_base * attempt).await;
        }
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() => {
                tracing::debug!(op = op_name, peer, attempt, error = %e, "peer attempt failed");
                last = Some(e);
            }
            Err(e) => {
                tracing::debug!(op = op_name, peer, error = %e, "peer rejected operation");
                return Err(e);
            }
        }
    }
    Err(last.unwrap_or(CacheError::Timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick_config() -> TransportConfig {
        TransportConfig { retry_backoff_base: Duration::from_millis(10), ..Default::default() }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&quick_config(), "test", "n2", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(CacheError::Peer("connection refused".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&quick_config(), "test", "n2", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CacheError::Timeout) }
        })
        .await;
        assert!(matches!(result, Err(CacheError::Timeout)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rejection_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&quick_config(), "test", "n2", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CacheError::PeerRejected("bad request".into())) }
        })
        .await;
        assert!(matches!(result, Err(CacheError::PeerRejected(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
