use muninn_types::{CacheError, StoreStats};

use crate::traits::LocalStore;

fn redis_err(e: redis::RedisError) -> CacheError {
    if e.is_io_error() || e.is_timeout() || e.is_connection_dropped() {
        CacheError::StoreUnavailable(e.to_string())
    } else {
        CacheError::Store(e.to_string())
    }
}

/// `LocalStore` backed by a Redis instance.
///
/// Doubles as the store channel: peers open a `RedisStore` against another
/// node's advertised `host:port` for direct reads and writes. The connection
/// manager reconnects on its own, so a handle stays usable across store
/// restarts.
#[derive(Clone)]
pub struct RedisStore {
    conn: redis::aio::ConnectionManager,
}

impl RedisStore {
    /// Connect to `endpoint` (`host:port`, with or without the `redis://`
    /// scheme).
    pub async fn connect(endpoint: &str) -> Result<Self, CacheError> {
        let url = if endpoint.contains("://") {
            endpoint.to_string()
        } else {
            format!("redis://{endpoint}")
        };
        let client = redis::Client::open(url).map_err(redis_err)?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| CacheError::StoreUnavailable(e.to_string()))?;
        Ok(RedisStore { conn })
    }

    pub async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(())
    }
}

impl LocalStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl_secs: Option<u64>) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        // ttl of zero means no expiry: plain SET, no EX argument.
        let _: () = match ttl_secs.filter(|t| *t > 0) {
            Some(ttl) => redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(ttl)
                .query_async(&mut conn)
                .await
                .map_err(redis_err)?,
            None => redis::cmd("SET")
                .arg(key)
                .arg(value)
                .query_async(&mut conn)
                .await
                .map_err(redis_err)?,
        };
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats, CacheError> {
        let mut conn = self.conn.clone();
        let key_count: u64 = redis::cmd("DBSIZE")
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        let info: String = redis::cmd("INFO")
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(StoreStats {
            key_count,
            memory_bytes: info_field(&info, "used_memory").unwrap_or(0),
            memory_peak: info_field(&info, "used_memory_peak").unwrap_or(0),
            connected_clients: info_field(&info, "connected_clients").unwrap_or(0),
        })
    }
}

/// Pull a numeric `field:value` line out of an INFO dump.
fn info_field(info: &str, field: &str) -> Option<u64> {
    info.lines()
        .find_map(|line| line.strip_prefix(field)?.strip_prefix(':'))
        .and_then(|v| v.trim().parse().ok())
}
