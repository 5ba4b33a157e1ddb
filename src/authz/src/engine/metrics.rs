//! Engine metrics with Prometheus text export

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Upper bounds of the latency buckets in microseconds; one overflow bucket follows
const LATENCY_BOUNDS_US: [u64; 16] = [
    100, 250, 500, 1_000, 2_500, 5_000, 10_000, 25_000, 50_000, 100_000, 250_000, 500_000,
    1_000_000, 2_500_000, 5_000_000, 10_000_000,
];

const BUCKETS: usize = LATENCY_BOUNDS_US.len() + 1;

/// Point-in-time metrics snapshot
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineMetrics {
    /// Total number of authorize calls
    pub total_requests: u64,

    pub allowed_decisions: u64,
    pub denied_decisions: u64,

    /// Policy set cache hits and misses
    pub cache_hits: u64,
    pub cache_misses: u64,

    /// Cache backend errors answered from the store instead
    pub cache_fallbacks: u64,

    /// Calls denied because the store could not load candidates
    pub store_errors: u64,

    /// Candidates skipped after an evaluation error
    pub skipped_candidates: u64,

    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
    pub avg_latency_ms: f64,
}

impl EngineMetrics {
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }

    pub fn allow_rate(&self) -> f64 {
        let total = self.allowed_decisions + self.denied_decisions;
        if total == 0 {
            0.0
        } else {
            self.allowed_decisions as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct Counters {
    total_requests: AtomicU64,
    allowed_decisions: AtomicU64,
    denied_decisions: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_fallbacks: AtomicU64,
    store_errors: AtomicU64,
    skipped_candidates: AtomicU64,
}

/// Fixed-bucket latency histogram updated with atomic adds
struct LatencyHistogram {
    buckets: [AtomicU64; BUCKETS],
    count: AtomicU64,
    sum_us: AtomicU64,
    max_us: AtomicU64,
}

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
            max_us: AtomicU64::new(0),
        }
    }

    fn record(&self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        let bucket = LATENCY_BOUNDS_US.partition_point(|bound| *bound < micros);
        self.buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(micros, Ordering::Relaxed);
        self.max_us.fetch_max(micros, Ordering::Relaxed);
    }

    fn counts(&self) -> [u64; BUCKETS] {
        std::array::from_fn(|i| self.buckets[i].load(Ordering::Relaxed))
    }

    /// Upper bound of the bucket holding the `p` quantile, capped by the
    /// largest latency seen
    fn percentile_ms(counts: &[u64; BUCKETS], max_us: u64, p: f64) -> f64 {
        let total: u64 = counts.iter().sum();
        if total == 0 {
            return 0.0;
        }
        let rank = ((total as f64) * p).ceil().max(1.0) as u64;
        let mut seen = 0;
        for (i, count) in counts.iter().enumerate() {
            seen += count;
            if seen >= rank {
                let bound = LATENCY_BOUNDS_US.get(i).copied().unwrap_or(max_us);
                return bound.min(max_us) as f64 / 1000.0;
            }
        }
        max_us as f64 / 1000.0
    }

    fn reset(&self) {
        for bucket in &self.buckets {
            bucket.store(0, Ordering::Relaxed);
        }
        self.count.store(0, Ordering::Relaxed);
        self.sum_us.store(0, Ordering::Relaxed);
        self.max_us.store(0, Ordering::Relaxed);
    }
}

/// Metrics collector shared by every authorize call
///
/// Counters and latency buckets are plain atomics; recording never blocks.
pub struct MetricsCollector {
    counters: Counters,
    latency: LatencyHistogram,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            counters: Counters::default(),
            latency: LatencyHistogram::new(),
        }
    }

    pub fn record_cache_hit(&self) {
        self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_fallback(&self) {
        self.counters.cache_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_error(&self) {
        self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped_candidate(&self) {
        self.record_skipped_candidates(1);
    }

    pub fn record_skipped_candidates(&self, count: u64) {
        self.counters
            .skipped_candidates
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_decision(&self, allowed: bool) {
        self.counters.total_requests.fetch_add(1, Ordering::Relaxed);
        if allowed {
            self.counters.allowed_decisions.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.denied_decisions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_latency(&self, latency: Duration) {
        self.latency.record(latency);
    }

    pub fn get_metrics(&self) -> EngineMetrics {
        let counts = self.latency.counts();
        let max_us = self.latency.max_us.load(Ordering::Relaxed);
        let samples = self.latency.count.load(Ordering::Relaxed);
        let avg_latency_ms = if samples == 0 {
            0.0
        } else {
            self.latency.sum_us.load(Ordering::Relaxed) as f64 / samples as f64 / 1000.0
        };

        let c = &self.counters;
        EngineMetrics {
            total_requests: c.total_requests.load(Ordering::Relaxed),
            allowed_decisions: c.allowed_decisions.load(Ordering::Relaxed),
            denied_decisions: c.denied_decisions.load(Ordering::Relaxed),
            cache_hits: c.cache_hits.load(Ordering::Relaxed),
            cache_misses: c.cache_misses.load(Ordering::Relaxed),
            cache_fallbacks: c.cache_fallbacks.load(Ordering::Relaxed),
            store_errors: c.store_errors.load(Ordering::Relaxed),
            skipped_candidates: c.skipped_candidates.load(Ordering::Relaxed),
            latency_p50_ms: LatencyHistogram::percentile_ms(&counts, max_us, 0.50),
            latency_p95_ms: LatencyHistogram::percentile_ms(&counts, max_us, 0.95),
            latency_p99_ms: LatencyHistogram::percentile_ms(&counts, max_us, 0.99),
            avg_latency_ms,
        }
    }

    pub fn reset(&self) {
        let c = &self.counters;
        for counter in [
            &c.total_requests,
            &c.allowed_decisions,
            &c.denied_decisions,
            &c.cache_hits,
            &c.cache_misses,
            &c.cache_fallbacks,
            &c.store_errors,
            &c.skipped_candidates,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.latency.reset();
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let metrics = self.get_metrics();

        let mut text = format!(
            r#"# HELP authz_requests_total Total number of authorization requests
# TYPE authz_requests_total counter
authz_requests_total {}

# HELP authz_allowed_total Number of allowed decisions
# TYPE authz_allowed_total counter
authz_allowed_total {}

# HELP authz_denied_total Number of denied decisions
# TYPE authz_denied_total counter
authz_denied_total {}

# HELP authz_cache_hits_total Policy set cache hits
# TYPE authz_cache_hits_total counter
authz_cache_hits_total {}

# HELP authz_cache_misses_total Policy set cache misses
# TYPE authz_cache_misses_total counter
authz_cache_misses_total {}

# HELP authz_cache_fallbacks_total Cache errors answered from the store
# TYPE authz_cache_fallbacks_total counter
authz_cache_fallbacks_total {}

# HELP authz_store_errors_total Calls denied because candidates could not be loaded
# TYPE authz_store_errors_total counter
authz_store_errors_total {}

# HELP authz_skipped_candidates_total Candidates skipped after an evaluation error
# TYPE authz_skipped_candidates_total counter
authz_skipped_candidates_total {}

# HELP authz_latency_seconds Request latency
# TYPE authz_latency_seconds histogram
"#,
            metrics.total_requests,
            metrics.allowed_decisions,
            metrics.denied_decisions,
            metrics.cache_hits,
            metrics.cache_misses,
            metrics.cache_fallbacks,
            metrics.store_errors,
            metrics.skipped_candidates,
        );

        let counts = self.latency.counts();
        let mut cumulative = 0;
        for (bound, count) in LATENCY_BOUNDS_US.iter().zip(counts.iter()) {
            cumulative += count;
            text.push_str(&format!(
                "authz_latency_seconds_bucket{{le=\"{}\"}} {}\n",
                *bound as f64 / 1_000_000.0,
                cumulative
            ));
        }
        cumulative += counts[BUCKETS - 1];
        text.push_str(&format!(
            "authz_latency_seconds_bucket{{le=\"+Inf\"}} {}\n",
            cumulative
        ));
        text.push_str(&format!(
            "authz_latency_seconds_sum {}\n",
            self.latency.sum_us.load(Ordering::Relaxed) as f64 / 1_000_000.0
        ));
        text.push_str(&format!("authz_latency_seconds_count {}\n", cumulative));
        text
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
