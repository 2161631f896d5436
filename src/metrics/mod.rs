//! Per-process counters and the aggregated snapshot served by the Metrics
//! Stream.
//!
//! Follows the teacher's counter discipline from `connection::pool`: plain
//! `AtomicU64`s read independently, no attempt at a frozen cross-counter
//! snapshot (the spec calls this unnecessary and costly).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Counters owned by the Router: per-namespace request/error counts and a
/// rolling window of fan-out latencies used to derive percentiles.
#[derive(Debug, Default)]
pub struct RouterMetrics {
    pub requests: AtomicU64,
    pub errors: AtomicU64,
    latencies: std::sync::Mutex<LatencyWindow>,
}

/// Fixed-capacity ring buffer of recent fan-out latencies, in
/// microseconds. Old samples fall off as new ones arrive; percentiles are
/// computed over whatever is currently held.
struct LatencyWindow {
    samples: Vec<u64>,
    next: usize,
    capacity: usize,
}

impl Default for LatencyWindow {
    fn default() -> Self {
        Self {
            samples: Vec::new(),
            next: 0,
            capacity: 1024,
        }
    }
}

impl LatencyWindow {
    fn record(&mut self, micros: u64) {
        if self.samples.len() < self.capacity {
            self.samples.push(micros);
        } else {
            self.samples[self.next] = micros;
            self.next = (self.next + 1) % self.capacity;
        }
    }

    fn percentile(&self, p: f64) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
        sorted[idx]
    }
}

impl RouterMetrics {
    pub fn record_request(&self, elapsed: Duration) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.latencies.lock().expect("latency window lock poisoned").record(elapsed.as_micros() as u64);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn percentiles_micros(&self) -> (u64, u64, u64) {
        let window = self.latencies.lock().expect("latency window lock poisoned");
        (window.percentile(0.50), window.percentile(0.90), window.percentile(0.99))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NamespaceStats {
    pub name: String,
    pub key_count: u64,
    pub hit_rate: f64,
    pub qps: f64,
    pub memory_bytes: u64,
    pub max_memory_mb: Option<u64>,
    pub max_keys: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub endpoint: String,
    pub healthy: bool,
    pub key_count: u64,
    pub memory_bytes: u64,
    pub memory_limit_mb: Option<u64>,
    pub hit_rate: f64,
    /// Raw request-volume terms behind `hit_rate` (hits, misses), carried
    /// alongside the ratio so the cluster-wide aggregate in
    /// `SnapshotBuilder::build` can weight by traffic rather than by
    /// resident key count.
    pub hits: u64,
    pub misses: u64,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub total_qps: f64,
    pub p50_micros: u64,
    pub p90_micros: u64,
    pub p99_micros: u64,
    pub hit_rate: f64,
    pub memory_bytes: u64,
    pub health_score: u8,
    pub namespaces: Vec<NamespaceStats>,
    pub workers: Vec<WorkerStats>,
}

/// Approximates a key's footprint as key bytes plus value bytes plus a
/// fixed per-entry overhead, the way the teacher's `storage::memory`
/// module estimates table sizes without a precise allocator accounting.
pub const ENTRY_OVERHEAD_BYTES: u64 = 48;

pub fn approximate_entry_bytes(key: &str, value: &str) -> u64 {
    key.len() as u64 + value.len() as u64 + ENTRY_OVERHEAD_BYTES
}

/// Folds worker- and router-level counters into one published snapshot.
/// `window_seconds` is the interval between ticks, used to turn counters
/// into approximate QPS.
pub struct SnapshotBuilder {
    pub window: Duration,
    pub since: Instant,
}

impl SnapshotBuilder {
    pub fn build(
        router: &RouterMetrics,
        namespaces: Vec<NamespaceStats>,
        workers: Vec<WorkerStats>,
        window_requests: u64,
        window_seconds: f64,
    ) -> MetricsSnapshot {
        let (p50, p90, p99) = router.percentiles_micros();
        let total_hits: u64 = workers.iter().map(|w| w.hits).sum();
        let total_requests: u64 = workers.iter().map(|w| w.hits + w.misses).sum();
        let memory_bytes: u64 = workers.iter().map(|w| w.memory_bytes).sum();
        let hit_rate = if total_requests == 0 { 0.0 } else { total_hits as f64 / total_requests as f64 };
        let healthy_workers = workers.iter().filter(|w| w.healthy).count();
        let health_score = if workers.is_empty() {
            100
        } else {
            ((healthy_workers as f64 / workers.len() as f64) * 100.0).round() as u8
        };

        MetricsSnapshot {
            timestamp: chrono::Utc::now(),
            total_qps: if window_seconds > 0.0 { window_requests as f64 / window_seconds } else { 0.0 },
            p50_micros: p50,
            p90_micros: p90,
            p99_micros: p99,
            hit_rate,
            memory_bytes,
            health_score,
            namespaces,
            workers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_percentiles_over_known_samples() {
        let router = RouterMetrics::default();
        for ms in [10u64, 20, 30, 40, 50, 60, 70, 80, 90, 100] {
            router.record_request(Duration::from_millis(ms));
        }
        let (p50, _, p99) = router.percentiles_micros();
        assert_eq!(p50, 50_000);
        assert_eq!(p99, 100_000);
    }

    #[test]
    fn health_score_is_full_when_all_workers_are_healthy() {
        let router = RouterMetrics::default();
        let workers = vec![
            WorkerStats {
                endpoint: "w1".into(),
                healthy: true,
                key_count: 0,
                memory_bytes: 0,
                memory_limit_mb: None,
                hit_rate: 0.0,
                hits: 0,
                misses: 0,
                uptime_seconds: 0,
            },
            WorkerStats {
                endpoint: "w2".into(),
                healthy: true,
                key_count: 0,
                memory_bytes: 0,
                memory_limit_mb: None,
                hit_rate: 0.0,
                hits: 0,
                misses: 0,
                uptime_seconds: 0,
            },
        ];
        let snap = SnapshotBuilder::build(&router, Vec::new(), workers, 0, 5.0);
        assert_eq!(snap.health_score, 100);
    }

    #[test]
    fn health_score_drops_with_unhealthy_workers() {
        let router = RouterMetrics::default();
        let workers = vec![
            WorkerStats {
                endpoint: "w1".into(),
                healthy: true,
                key_count: 0,
                memory_bytes: 0,
                memory_limit_mb: None,
                hit_rate: 0.0,
                hits: 0,
                misses: 0,
                uptime_seconds: 0,
            },
            WorkerStats {
                endpoint: "w2".into(),
                healthy: false,
                key_count: 0,
                memory_bytes: 0,
                memory_limit_mb: None,
                hit_rate: 0.0,
                hits: 0,
                misses: 0,
                uptime_seconds: 0,
            },
        ];
        let snap = SnapshotBuilder::build(&router, Vec::new(), workers, 0, 5.0);
        assert_eq!(snap.health_score, 50);
    }

    /// A worker holding few keys but serving heavy traffic must not be
    /// drowned out by an idle worker holding many keys: the aggregate
    /// hit rate is weighted by request volume (hits+misses), not by
    /// resident key count.
    #[test]
    fn aggregate_hit_rate_is_weighted_by_request_volume_not_key_count() {
        let router = RouterMetrics::default();
        let workers = vec![
            WorkerStats {
                endpoint: "busy".into(),
                healthy: true,
                key_count: 1,
                memory_bytes: 0,
                memory_limit_mb: None,
                hit_rate: 0.0,
                hits: 0,
                misses: 1000,
                uptime_seconds: 0,
            },
            WorkerStats {
                endpoint: "idle".into(),
                healthy: true,
                key_count: 10_000,
                memory_bytes: 0,
                memory_limit_mb: None,
                hit_rate: 1.0,
                hits: 10,
                misses: 0,
                uptime_seconds: 0,
            },
        ];
        let snap = SnapshotBuilder::build(&router, Vec::new(), workers, 0, 5.0);
        // 10 hits out of 1010 total requests, not ~1.0 as a key-count-weighted
        // average would report.
        assert!((snap.hit_rate - 10.0 / 1010.0).abs() < 1e-9);
    }
}
