//! Per-namespace token bucket rate limiting.
//!
//! Modeled on the teacher's `connection::pool` bookkeeping style: a small
//! guarded struct per key, looked up from a outer map, mutated under its
//! own lock rather than the map's.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_per_second: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(qps: u32) -> Self {
        let capacity = qps.max(1) as f64;
        Self {
            tokens: capacity,
            capacity,
            refill_per_second: capacity,
            last_refill: Instant::now(),
        }
    }

    fn try_take(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_second).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Registry of per-namespace buckets. Namespaces without a configured
/// `rate_limit_qps` are never rate limited.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` if the request may proceed. `qps` is the namespace's
    /// configured limit; `None` means unlimited.
    pub fn check(&self, namespace: &str, qps: Option<u32>) -> bool {
        let Some(qps) = qps else { return true };
        let mut buckets = self.buckets.lock().expect("rate limiter lock poisoned");
        let bucket = buckets.entry(namespace.to_string()).or_insert_with(|| Bucket::new(qps));
        if bucket.capacity != qps.max(1) as f64 {
            *bucket = Bucket::new(qps);
        }
        bucket.try_take()
    }

    /// Drops all buckets for namespaces no longer present in the current
    /// configuration, and resets buckets whose limit changed. Called on
    /// every accepted configuration reload so a namespace's limit takes
    /// effect immediately rather than waiting for the bucket to next
    /// refill from a stale capacity.
    pub fn reconcile(&self, active: &[(String, Option<u32>)]) {
        let mut buckets = self.buckets.lock().expect("rate limiter lock poisoned");
        let active_names: std::collections::HashSet<&str> = active.iter().map(|(name, _)| name.as_str()).collect();
        buckets.retain(|name, _| active_names.contains(name.as_str()));
        for (name, qps) in active {
            match qps {
                Some(qps) => {
                    let target_capacity = (*qps).max(1) as f64;
                    let needs_reset = buckets.get(name).map(|b| b.capacity != target_capacity).unwrap_or(true);
                    if needs_reset {
                        buckets.insert(name.clone(), Bucket::new(*qps));
                    }
                }
                None => {
                    buckets.remove(name);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_namespace_always_passes() {
        let limiter = RateLimiter::new();
        for _ in 0..1000 {
            assert!(limiter.check("ns", None));
        }
    }

    #[test]
    fn limited_namespace_exhausts_then_refuses() {
        let limiter = RateLimiter::new();
        let mut allowed = 0;
        for _ in 0..10 {
            if limiter.check("ns", Some(5)) {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 5);
    }

    #[test]
    fn bucket_refills_over_time() {
        let limiter = RateLimiter::new();
        for _ in 0..5 {
            assert!(limiter.check("ns", Some(5)));
        }
        assert!(!limiter.check("ns", Some(5)));
        std::thread::sleep(Duration::from_millis(250));
        assert!(limiter.check("ns", Some(5)));
    }

    #[test]
    fn reconcile_drops_namespaces_no_longer_present() {
        let limiter = RateLimiter::new();
        limiter.check("gone", Some(5));
        limiter.reconcile(&[("stays".to_string(), Some(5))]);
        assert_eq!(limiter.buckets.lock().unwrap().len(), 1);
        assert!(limiter.buckets.lock().unwrap().contains_key("stays"));
    }
}
