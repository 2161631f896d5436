//! The TTL Store: a concurrent map from string key to [`Entry`] with
//! per-entry wall-clock expiration and a background sweeper.
//!
//! Modeled on the teacher's `storage::memory::InMemoryStorage` (one guarded
//! map, handles cloned out for concurrent access) simplified to a single
//! namespace-agnostic map, since a cache entry carries no schema.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::error::CacheError;
use crate::metrics::approximate_entry_bytes;

/// Optional hard caps enforced on `Set`. Absent means unbounded.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceCaps {
    pub max_keys: Option<u64>,
    pub max_memory_bytes: Option<u64>,
}

/// One record held by a worker.
#[derive(Debug, Clone)]
pub struct Entry {
    pub value: String,
    /// Absent means immortal.
    pub expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }

    fn ttl_remaining(&self, now: Instant) -> u64 {
        match self.expires_at {
            None => 0,
            Some(at) if at <= now => 0,
            Some(at) => (at - now).as_secs(),
        }
    }
}

/// Monotone counters maintained alongside the guarded map, following the
/// same discipline the teacher's `ConnectionPool` uses for
/// `total_connections`: an atomic beside (not inside) the lock.
#[derive(Debug, Default)]
pub struct StoreCounters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub sets: AtomicU64,
    pub deletes: AtomicU64,
}

pub struct TtlStore {
    entries: RwLock<HashMap<String, Entry>>,
    counters: StoreCounters,
    caps: ResourceCaps,
    started_at: Instant,
}

impl Default for TtlStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TtlStore {
    pub fn new() -> Self {
        Self::with_caps(ResourceCaps::default())
    }

    pub fn with_caps(caps: ResourceCaps) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            counters: StoreCounters::default(),
            caps,
            started_at: Instant::now(),
        }
    }

    /// Returns a miss if the key is absent or expired. An expired entry
    /// discovered here is removed opportunistically.
    pub async fn get(&self, key: &str) -> (Option<String>, bool, u64) {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(key) {
                if !entry.is_expired(now) {
                    let value = entry.value.clone();
                    let ttl = entry.ttl_remaining(now);
                    drop(entries);
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return (Some(value), true, ttl);
                }
            } else {
                drop(entries);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return (None, false, 0);
            }
        }

        // Present but expired under the read lock: upgrade to a write lock
        // and remove it. A concurrent set() may have replaced the entry in
        // the window between releasing the read lock and acquiring the
        // write lock, so re-check before removing; a still-live entry
        // found here is a hit, not a deletion.
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                drop(entries);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                (None, false, 0)
            }
            Some(entry) => {
                let value = entry.value.clone();
                let ttl = entry.ttl_remaining(now);
                drop(entries);
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                (Some(value), true, ttl)
            }
            None => {
                drop(entries);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                (None, false, 0)
            }
        }
    }

    /// Overwrites unconditionally. `ttl_seconds == 0` means immortal.
    ///
    /// Enforces the worker's resource caps, if any: a `Set` that would push
    /// the key count or approximate memory footprint past its configured
    /// limit is rejected with `RESOURCE_EXHAUSTED` and has no effect.
    /// Overwriting an existing key never counts against `max_keys`.
    pub async fn set(&self, key: String, value: String, ttl_seconds: u64) -> Result<(), CacheError> {
        let expires_at = if ttl_seconds == 0 {
            None
        } else {
            Some(Instant::now() + Duration::from_secs(ttl_seconds))
        };

        let mut entries = self.entries.write().await;

        if let Some(max_keys) = self.caps.max_keys {
            if !entries.contains_key(&key) && entries.len() as u64 >= max_keys {
                return Err(CacheError::ResourceExhausted(format!("key count at cap ({max_keys})")));
            }
        }
        if let Some(max_bytes) = self.caps.max_memory_bytes {
            let current: u64 = entries
                .iter()
                .filter(|(k, _)| *k != &key)
                .map(|(k, e)| approximate_entry_bytes(k, &e.value))
                .sum();
            let projected = current + approximate_entry_bytes(&key, &value);
            if projected > max_bytes {
                return Err(CacheError::ResourceExhausted(format!("memory at cap ({max_bytes} bytes)")));
            }
        }

        entries.insert(key, Entry { value, expires_at });
        drop(entries);
        self.counters.sets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Idempotent: returns whether the key was present.
    pub async fn delete(&self, key: &str) -> bool {
        let mut entries = self.entries.write().await;
        let existed = entries.remove(key).is_some();
        drop(entries);
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        existed
    }

    /// Current entry count, including not-yet-swept expired entries.
    pub async fn size(&self) -> u64 {
        self.entries.read().await.len() as u64
    }

    /// Approximate memory footprint of all currently-held entries,
    /// including not-yet-swept expired ones.
    pub async fn memory_bytes(&self) -> u64 {
        self.entries
            .read()
            .await
            .iter()
            .map(|(k, e)| approximate_entry_bytes(k, &e.value))
            .sum()
    }

    pub fn stats(&self) -> (u64, u64, u64, u64) {
        (
            self.counters.hits.load(Ordering::Relaxed),
            self.counters.misses.load(Ordering::Relaxed),
            self.counters.sets.load(Ordering::Relaxed),
            self.counters.deletes.load(Ordering::Relaxed),
        )
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Whole-second TTL remainder; 0 if absent, expired, or immortal.
    pub async fn ttl(&self, key: &str) -> u64 {
        let now = Instant::now();
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(entry) if !entry.is_expired(now) => entry.ttl_remaining(now),
            _ => 0,
        }
    }

    /// Discards all entries. Counters are NOT reset.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    /// Deletes all currently-expired entries. Intended to run on a fixed
    /// cadence from a background task (see [`spawn_sweeper`]).
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }
}

/// Spawns the background sweeper. The returned handle may be aborted on
/// shutdown; dropping it does not stop the task (matches `tokio::spawn`'s
/// usual detached-by-default behavior).
pub fn spawn_sweeper(store: Arc<TtlStore>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let removed = store.sweep().await;
            if removed > 0 {
                tracing::debug!(removed, "ttl sweeper removed expired entries");
            }
        }
    })
}
