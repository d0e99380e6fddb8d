use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic operation counters, updated on every engine operation. These feed
/// the monitoring surface; exporting them is the host process's concern.
#[derive(Default)]
pub struct OpCounters {
    sets: AtomicU64,
    gets: AtomicU64,
    deletes: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    replicates_applied: AtomicU64,
    replicates_skipped: AtomicU64,
    invalidates: AtomicU64,
    peer_failures: AtomicU64,
}

impl OpCounters {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_get(&self) {
        self.gets.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_replicate_applied(&self) {
        self.replicates_applied.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_replicate_skipped(&self) {
        self.replicates_skipped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_invalidate(&self) {
        self.invalidates.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_peer_failure(&self) {
        self.peer_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time snapshot of all counters.
    pub fn snapshot(&self) -> OpSnapshot {
        OpSnapshot {
            sets: self.sets.load(Ordering::Relaxed),
            gets: self.gets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            replicates_applied: self.replicates_applied.load(Ordering::Relaxed),
            replicates_skipped: self.replicates_skipped.load(Ordering::Relaxed),
            invalidates: self.invalidates.load(Ordering::Relaxed),
            peer_failures: self.peer_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct OpSnapshot {
    pub sets: u64,
    pub gets: u64,
    pub deletes: u64,
    pub hits: u64,
    pub misses: u64,
    pub replicates_applied: u64,
    pub replicates_skipped: u64,
    pub invalidates: u64,
    pub peer_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_ops() {
        let counters = OpCounters::new();
        counters.record_set();
        counters.record_get();
        counters.record_get();
        counters.record_hit();
        counters.record_miss();

        let snap = counters.snapshot();
        assert_eq!(snap.sets, 1);
        assert_eq!(snap.gets, 2);
        assert_eq!(snap.hits, 1);
        assert_eq!(snap.misses, 1);
        assert_eq!(snap.deletes, 0);
    }
}
