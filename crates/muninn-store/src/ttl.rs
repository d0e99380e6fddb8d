use std::time::Duration;

use crate::mem::MemStore;

/// Background eviction loop for [`MemStore`].
///
/// Lazy expiry on read already hides expired entries from callers; this task
/// reclaims the memory of entries nobody reads again. Spawn `run` on the
/// runtime and abort the task on shutdown.
pub struct TtlSweeper {
    store: MemStore,
    interval: Duration,
}

impl TtlSweeper {
    pub fn new(store: MemStore, interval: Duration) -> Self {
        TtlSweeper { store, interval }
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let purged = self.store.purge_expired().await;
            if purged > 0 {
                tracing::debug!(purged, "evicted expired entries");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::LocalStore;

    #[tokio::test(start_paused = true)]
    async fn sweeper_reclaims_expired_entries() {
        let store = MemStore::new();
        store.set("k", vec![0u8; 64], Some(1)).await.unwrap();

        let sweeper = TtlSweeper::new(store.clone(), Duration::from_millis(100));
        let handle = tokio::spawn(sweeper.run());

        tokio::time::advance(Duration::from_secs(2)).await;
        // Sleeping under the paused clock lets the sweeper ticks run.
        tokio::time::sleep(Duration::from_millis(250)).await;

        let s = store.stats().await.unwrap();
        assert_eq!(s.key_count, 0);
        assert_eq!(s.memory_bytes, 0);

        handle.abort();
    }
}
