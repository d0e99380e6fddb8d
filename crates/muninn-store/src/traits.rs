use std::future::Future;

use muninn_types::{CacheError, StoreStats};

/// Per-node key-value backing store.
///
/// Values are opaque bytes (the store knows nothing about envelopes) and
/// keys are stored raw, without any node prefixing. Time-based expiry is the
/// store's own business; callers only hand over an optional TTL.
///
/// Methods use RPITIT (`-> impl Future + Send`) so implementations stay free
/// of an `async-trait` dependency and generic callers can `.await` across
/// thread boundaries.
pub trait LocalStore: Send + Sync + 'static {
    fn get(&self, key: &str)
        -> impl Future<Output = Result<Option<Vec<u8>>, CacheError>> + Send;

    /// Store `value` under `key`. `ttl_secs == None` and `ttl_secs == Some(0)`
    /// both mean the key never expires.
    fn set(&self, key: &str, value: Vec<u8>, ttl_secs: Option<u64>)
        -> impl Future<Output = Result<(), CacheError>> + Send;

    /// Remove `key`. Deleting an absent key succeeds.
    fn delete(&self, key: &str)
        -> impl Future<Output = Result<(), CacheError>> + Send;

    fn stats(&self)
        -> impl Future<Output = Result<StoreStats, CacheError>> + Send;
}
