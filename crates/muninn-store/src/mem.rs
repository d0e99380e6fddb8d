use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

use muninn_types::{CacheError, StoreStats};

use crate::traits::LocalStore;

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.map(|t| t <= Instant::now()).unwrap_or(false)
    }
}

struct MemInner {
    data: HashMap<String, Entry>,
    memory_bytes: u64,
    memory_peak: u64,
}

/// In-memory `LocalStore` with per-key TTL.
///
/// Expired entries are dropped lazily on read; pair with a [`crate::TtlSweeper`]
/// to reclaim entries nobody reads. Byte accounting counts key and value
/// lengths, with a high-water mark kept for `memory_peak`.
#[derive(Clone)]
pub struct MemStore {
    inner: Arc<RwLock<MemInner>>,
}

fn entry_size(key: &str, value: &[u8]) -> u64 {
    (key.len() + value.len()) as u64
}

impl MemStore {
    pub fn new() -> Self {
        MemStore {
            inner: Arc::new(RwLock::new(MemInner {
                data: HashMap::new(),
                memory_bytes: 0,
                memory_peak: 0,
            })),
        }
    }

    /// Drop every expired entry; returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let mut g = self.inner.write().await;
        let expired: Vec<String> = g
            .data
            .iter()
            .filter(|(_, e)| e.is_expired())
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            if let Some(e) = g.data.remove(key) {
                g.memory_bytes -= entry_size(key, &e.value);
            }
        }
        expired.len()
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalStore for MemStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        {
            let g = self.inner.read().await;
            match g.data.get(key) {
                None => return Ok(None),
                Some(e) if !e.is_expired() => return Ok(Some(e.value.clone())),
                Some(_) => {}
            }
        }
        // Expired: upgrade to a write lock and drop it. Re-check after the
        // lock switch; a concurrent set may have refreshed the key.
        let mut g = self.inner.write().await;
        if g.data.get(key).map(|e| e.is_expired()).unwrap_or(false) {
            if let Some(e) = g.data.remove(key) {
                g.memory_bytes -= entry_size(key, &e.value);
            }
        }
        Ok(g.data.get(key).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl_secs: Option<u64>) -> Result<(), CacheError> {
        let expires_at = ttl_secs
            .filter(|t| *t > 0)
            .map(|t| Instant::now() + Duration::from_secs(t));
        let mut g = self.inner.write().await;
        if let Some(old) = g.data.remove(key) {
            g.memory_bytes -= entry_size(key, &old.value);
        }
        g.memory_bytes += entry_size(key, &value);
        g.memory_peak = g.memory_peak.max(g.memory_bytes);
        g.data.insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut g = self.inner.write().await;
        if let Some(e) = g.data.remove(key) {
            g.memory_bytes -= entry_size(key, &e.value);
        }
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats, CacheError> {
        let g = self.inner.read().await;
        Ok(StoreStats {
            key_count: g.data.values().filter(|e| !e.is_expired()).count() as u64,
            memory_bytes: g.memory_bytes,
            memory_peak: g.memory_peak,
            connected_clients: 1,
        })
    }
}
