//! Router-to-Worker connection pool.
//!
//! Generalizes the teacher's `connection::pool::ConnectionPool` (a queue of
//! reusable connections guarded by a lock, with idle/lifetime expiry) from
//! a pool of equivalent pooled connections to a pool of *named* channels,
//! one per worker endpoint, each carrying the state machine the spec
//! describes: `absent → connecting → ready → broken → draining → closed`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::CacheError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Ready,
    Broken,
    Draining,
    Closed,
}

/// A channel to one worker endpoint. The underlying transport is a
/// `reqwest::Client`, which pools its own HTTP/1.1 connections; the state
/// machine here tracks the *logical* channel's health across requests, not
/// the TCP connection itself.
pub struct WorkerChannel {
    pub endpoint: String,
    pub client: reqwest::Client,
    state: Mutex<ChannelState>,
}

impl WorkerChannel {
    fn new(endpoint: String) -> Self {
        Self {
            endpoint,
            client: reqwest::Client::new(),
            state: Mutex::new(ChannelState::Connecting),
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock().expect("channel lock poisoned")
    }

    pub fn mark_ready(&self) {
        *self.state.lock().expect("channel lock poisoned") = ChannelState::Ready;
    }

    pub fn mark_broken(&self) {
        *self.state.lock().expect("channel lock poisoned") = ChannelState::Broken;
    }

    fn mark_draining(&self) {
        *self.state.lock().expect("channel lock poisoned") = ChannelState::Draining;
    }

    fn mark_closed(&self) {
        *self.state.lock().expect("channel lock poisoned") = ChannelState::Closed;
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.endpoint)
    }
}

/// One channel per worker endpoint, created lazily on first use. Channels
/// for endpoints dropped by reconfiguration are pruned after a drain
/// window rather than torn down immediately, so in-flight requests that
/// already chose that endpoint can finish.
pub struct WorkerPool {
    channels: Mutex<HashMap<String, Arc<WorkerChannel>>>,
    drain_grace: Duration,
}

impl WorkerPool {
    pub fn new(drain_grace: Duration) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            drain_grace,
        }
    }

    /// Returns the channel for `endpoint`, creating and marking it `Ready`
    /// if this is the first request to land on it. A channel previously
    /// marked `Broken` transitions back through `Connecting` on this call,
    /// matching the spec's `broken → connecting` transition on next use.
    pub fn channel_for(self: &Arc<Self>, endpoint: &str) -> Arc<WorkerChannel> {
        let mut channels = self.channels.lock().expect("pool lock poisoned");
        if let Some(existing) = channels.get(endpoint) {
            if existing.state() == ChannelState::Broken {
                existing.mark_ready();
            }
            return existing.clone();
        }
        let channel = Arc::new(WorkerChannel::new(endpoint.to_string()));
        channel.mark_ready();
        channels.insert(endpoint.to_string(), channel.clone());
        channel
    }

    /// Schedules pruning for every pooled endpoint absent from
    /// `live_endpoints`: marks it `Draining` immediately, then after the
    /// drain grace removes it from the pool entirely (`draining → closed`).
    pub fn prune_removed(self: &Arc<Self>, live_endpoints: &[String]) {
        let live: std::collections::HashSet<&str> = live_endpoints.iter().map(String::as_str).collect();
        let to_drain: Vec<Arc<WorkerChannel>> = {
            let channels = self.channels.lock().expect("pool lock poisoned");
            channels
                .values()
                .filter(|c| !live.contains(c.endpoint.as_str()) && c.state() != ChannelState::Draining)
                .cloned()
                .collect()
        };

        for channel in to_drain {
            channel.mark_draining();
            let pool = self.clone();
            let endpoint = channel.endpoint.clone();
            let grace = self.drain_grace;
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                channel.mark_closed();
                pool.channels.lock().expect("pool lock poisoned").remove(&endpoint);
                tracing::debug!(endpoint, "worker channel closed after drain");
            });
        }
    }

    pub fn len(&self) -> usize {
        self.channels.lock().expect("pool lock poisoned").len()
    }
}

/// Maps a reqwest transport error to the taxonomy, distinguishing
/// retriable transport failures from everything else.
pub fn classify_transport_error(endpoint: &str, err: &reqwest::Error) -> CacheError {
    if err.is_timeout() {
        CacheError::DeadlineExceeded
    } else {
        CacheError::Transport {
            endpoint: endpoint.to_string(),
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_use_creates_a_ready_channel() {
        let pool = Arc::new(WorkerPool::new(Duration::from_millis(10)));
        let channel = pool.channel_for("w1:9000");
        assert_eq!(channel.state(), ChannelState::Ready);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn repeated_use_reuses_the_same_channel() {
        let pool = Arc::new(WorkerPool::new(Duration::from_millis(10)));
        let a = pool.channel_for("w1:9000");
        let b = pool.channel_for("w1:9000");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn broken_channel_is_reconnected_on_next_use() {
        let pool = Arc::new(WorkerPool::new(Duration::from_millis(10)));
        let channel = pool.channel_for("w1:9000");
        channel.mark_broken();
        assert_eq!(channel.state(), ChannelState::Broken);
        let reused = pool.channel_for("w1:9000");
        assert_eq!(reused.state(), ChannelState::Ready);
    }

    #[tokio::test]
    async fn pruned_endpoint_is_removed_after_drain_grace() {
        let pool = Arc::new(WorkerPool::new(Duration::from_millis(20)));
        pool.channel_for("w1:9000");
        pool.prune_removed(&[]);
        assert_eq!(pool.len(), 1);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn live_endpoint_is_not_pruned() {
        let pool = Arc::new(WorkerPool::new(Duration::from_millis(10)));
        let channel = pool.channel_for("w1:9000");
        pool.prune_removed(&["w1:9000".to_string()]);
        assert_eq!(channel.state(), ChannelState::Ready);
        assert_eq!(pool.len(), 1);
    }
}
