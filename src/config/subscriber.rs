//! Turns a [`ConfigSource`] into a stream of validated [`ConfigSnapshot`]s,
//! published atomically via an `arc_swap::ArcSwap` — the single-writer,
//! many-reader pointer the pack's `spark2026` workspace reaches for exactly
//! this pattern, replacing a hand-rolled atomic pointer.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::ConfigDocument;
use super::ConfigSnapshot;
use super::source::ConfigSource;
use crate::error::CacheError;

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Applies +/-20% jitter to a backoff delay so that many routers watching
/// the same flaky source don't all retry in lockstep.
fn jitter(delay: Duration) -> Duration {
    let factor = rand::random::<f64>() * 0.4 + 0.8; // 0.8 .. 1.2
    delay.mul_f64(factor)
}

/// Watches a configuration source and keeps the most recently accepted
/// snapshot available lock-free via [`Subscriber::current`].
pub struct Subscriber {
    source: Arc<dyn ConfigSource>,
    snapshot: Arc<ArcSwap<ConfigSnapshot>>,
    version: AtomicU64,
    stop_tx: std::sync::Mutex<Option<oneshot::Sender<()>>>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

fn parse_and_validate(contents: &str, version: u64) -> Result<ConfigSnapshot, CacheError> {
    let doc: ConfigDocument =
        serde_json::from_str(contents).map_err(|e| CacheError::Config(format!("malformed configuration JSON: {e}")))?;
    ConfigSnapshot::from_document(doc, version)
}

impl Subscriber {
    pub fn new(source: Arc<dyn ConfigSource>) -> Self {
        Self {
            source,
            snapshot: Arc::new(ArcSwap::from_pointee(ConfigSnapshot::empty())),
            version: AtomicU64::new(0),
            stop_tx: std::sync::Mutex::new(None),
            task: std::sync::Mutex::new(None),
        }
    }

    /// Begins watching. `on_update` is invoked once on initial load and
    /// again for every subsequently accepted snapshot, always serially.
    /// If the initial load fails, the error is returned and nothing is
    /// published.
    pub async fn start<F>(&self, mut on_update: F) -> Result<(), CacheError>
    where
        F: FnMut(Arc<ConfigSnapshot>) + Send + 'static,
    {
        let initial_contents = self.source.read().await?;
        let initial = parse_and_validate(&initial_contents, 1)?;
        self.version.store(1, Ordering::SeqCst);
        let initial = Arc::new(initial);
        self.snapshot.store(initial.clone());
        on_update(initial);

        let mut change_events = self.source.watch().await;
        let source = self.source.clone();
        let snapshot_ptr = self.snapshot.clone();
        let version_counter = Arc::new(AtomicU64::new(1));
        let (stop_tx, mut stop_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            // Backoff applied to re-establishing `watch()` itself when the
            // underlying subscription dies; reset once an event is
            // actually delivered so a long-lived, occasionally-flaky watch
            // doesn't keep climbing toward the cap forever.
            let mut watch_backoff = BACKOFF_BASE;

            'outer: loop {
                let mut delivered_event = false;

                loop {
                    tokio::select! {
                        biased;
                        _ = &mut stop_rx => break 'outer,
                        event = change_events.recv() => {
                            let Some(()) = event else { break };
                            delivered_event = true;
                            match Self::read_with_backoff(source.as_ref(), &mut stop_rx).await {
                                Some(contents) => {
                                    let next_version = version_counter.load(Ordering::SeqCst) + 1;
                                    match parse_and_validate(&contents, next_version) {
                                        Ok(snap) => {
                                            version_counter.store(next_version, Ordering::SeqCst);
                                            let snap = Arc::new(snap);
                                            snapshot_ptr.store(snap.clone());
                                            on_update(snap);
                                        }
                                        Err(e) => {
                                            tracing::error!(error = %e, "rejected invalid configuration snapshot, keeping previous");
                                        }
                                    }
                                }
                                None => break 'outer, // stop requested while reconnecting
                            }
                        }
                    }
                }

                // The watch stream closed (the "watch disconnection" case):
                // back off, then re-subscribe and keep going.
                if delivered_event {
                    watch_backoff = BACKOFF_BASE;
                }
                let jittered = jitter(watch_backoff);
                tracing::warn!(delay = ?jittered, "configuration watch stream closed, reconnecting");
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break 'outer,
                    _ = tokio::time::sleep(jittered) => {}
                }
                watch_backoff = (watch_backoff * 2).min(BACKOFF_CAP);
                change_events = source.watch().await;
            }
        });

        *self.stop_tx.lock().expect("subscriber lock poisoned") = Some(stop_tx);
        *self.task.lock().expect("subscriber lock poisoned") = Some(handle);
        Ok(())
    }

    /// Retries `source.read()` with exponential backoff (base 1s, cap 30s,
    /// ±20% jitter to avoid synchronized reconnect storms across routers)
    /// until it succeeds or a stop signal arrives.
    async fn read_with_backoff(source: &dyn ConfigSource, stop_rx: &mut oneshot::Receiver<()>) -> Option<String> {
        let mut delay = BACKOFF_BASE;
        loop {
            match source.read().await {
                Ok(contents) => return Some(contents),
                Err(e) => {
                    let jittered = jitter(delay);
                    tracing::warn!(error = %e, delay = ?jittered, "configuration source read failed, retrying");
                    tokio::select! {
                        biased;
                        _ = &mut *stop_rx => return None,
                        _ = tokio::time::sleep(jittered) => {}
                    }
                    delay = (delay * 2).min(BACKOFF_CAP);
                }
            }
        }
    }

    /// Lock-free read of the most recently published snapshot.
    pub fn current(&self) -> Arc<ConfigSnapshot> {
        self.snapshot.load_full()
    }

    /// Terminates the watch; an in-flight `on_update` is allowed to
    /// complete.
    pub async fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().expect("subscriber lock poisoned").take() {
            let _ = tx.send(());
        }
        let handle = self.task.lock().expect("subscriber lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl ConfigSnapshot {
    /// The snapshot a fresh `Subscriber` holds before `start()` completes
    /// its initial load: zero namespaces, zero workers. Never published to
    /// `on_update` — only ever observable via `current()` in that narrow
    /// window, which in practice doesn't exist since `start()` blocks on
    /// the initial load before returning.
    fn empty() -> Self {
        Self {
            version: 0,
            namespaces: Vec::new(),
            dashboard: super::DashboardConfig {
                password: String::new(),
                refresh_interval: 5,
            },
            workers: Vec::new(),
            key_to_namespace: std::collections::HashMap::new(),
        }
    }
}
