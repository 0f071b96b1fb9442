//! Metrics hooks for the coalescing cache.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Callbacks fired by `CoalesceCacheManager`.
///
/// Every method has a no-op default, so implementors only override what they
/// export.
pub trait CoalesceMetrics: Send + Sync {
    /// Served from `cache:<key>` without touching the lock.
    fn record_hit(&self, _key: &str, _duration: Duration) {}

    fn record_miss(&self, _key: &str) {}

    /// This caller won the lock and ran the loader.
    fn record_load(&self, _key: &str, _duration: Duration) {}

    /// This caller waited on another loader and got its result.
    fn record_coalesced(&self, _key: &str, _duration: Duration) {}

    fn record_timeout(&self, _key: &str, _waited: Duration) {}

    fn record_error(&self, _key: &str, _error: &str) {}

    fn record_eviction(&self, _key: &str) {}
}

/// Default no-op metrics.
pub struct NoOpMetrics;

impl CoalesceMetrics for NoOpMetrics {}

/// Counter-backed metrics. Cheap to clone; clones share counters.
#[derive(Clone, Default)]
pub struct CacheStats {
    inner: Arc<Counters>,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    coalesced: AtomicU64,
    timeouts: AtomicU64,
    errors: AtomicU64,
    evictions: AtomicU64,
}

/// Point-in-time copy of [`CacheStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub loads: u64,
    pub coalesced: u64,
    pub timeouts: u64,
    pub errors: u64,
    pub evictions: u64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let c = &self.inner;
        StatsSnapshot {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            loads: c.loads.load(Ordering::Relaxed),
            coalesced: c.coalesced.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
        }
    }
}

impl CoalesceMetrics for CacheStats {
    fn record_hit(&self, _key: &str, _duration: Duration) {
        self.inner.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self, _key: &str) {
        self.inner.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_load(&self, _key: &str, _duration: Duration) {
        self.inner.loads.fetch_add(1, Ordering::Relaxed);
    }

    fn record_coalesced(&self, _key: &str, _duration: Duration) {
        self.inner.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    fn record_timeout(&self, _key: &str, _waited: Duration) {
        self.inner.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    fn record_error(&self, _key: &str, _error: &str) {
        self.inner.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn record_eviction(&self, _key: &str) {
        self.inner.evictions.fetch_add(1, Ordering::Relaxed);
    }
}
