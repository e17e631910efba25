use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lookup counters owned by a cache instance.
///
/// Each recorded outcome also bumps `total_requests`. Updates use relaxed
/// ordering, so concurrent snapshots may be momentarily inconsistent.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    total_requests: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub total_requests: u64,
    pub hit_rate: f64,
    pub error_rate: f64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);
        let total_requests = self.total_requests.load(Ordering::Relaxed);

        let rate = |count: u64| {
            if total_requests == 0 {
                0.0
            } else {
                count as f64 / total_requests as f64
            }
        };

        MetricsSnapshot {
            hits,
            misses,
            errors,
            total_requests,
            hit_rate: rate(hits),
            error_rate: rate(errors),
        }
    }
}
