//! Interface abstraction over the external configuration source (§9 design
//! note): a minimal `watch()` / `read()` pair the Subscriber can be built
//! against, independent of whatever keyed configuration store a given
//! deployment uses. A file-backed and an in-memory implementation are
//! provided; the latter is the test double.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::IntervalStream;

use crate::error::CacheError;

/// A source that produces discrete change events and, on demand, the
/// current contents.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Current raw contents (a JSON document, per the configuration
    /// artifact contract).
    async fn read(&self) -> Result<String, CacheError>;

    /// Subscribes to change notifications. Each item means "contents may
    /// have changed, call `read()` again" — the event itself carries no
    /// payload, matching the abstract "keyed configuration source" model.
    async fn watch(&self) -> mpsc::Receiver<()>;
}

/// Polls a file's modification time on a fixed cadence and notifies on
/// change. Grounded in the teacher's persistence layer's discipline of
/// treating the filesystem as the source of truth for durable state
/// (`storage::persistence`), simplified here to read-only polling.
pub struct FileConfigSource {
    path: PathBuf,
    poll_interval: Duration,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            path: path.into(),
            poll_interval,
        }
    }
}

#[async_trait]
impl ConfigSource for FileConfigSource {
    async fn read(&self) -> Result<String, CacheError> {
        tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| CacheError::Config(format!("reading {}: {e}", self.path.display())))
    }

    async fn watch(&self) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(8);
        let path = self.path.clone();
        let interval = self.poll_interval;
        tokio::spawn(async move {
            let mut last_modified = tokio::fs::metadata(&path).await.ok().and_then(|m| m.modified().ok());
            let mut ticks = IntervalStream::new(tokio::time::interval(interval));
            while ticks.next().await.is_some() {
                let modified = match tokio::fs::metadata(&path).await {
                    Ok(meta) => meta.modified().ok(),
                    Err(_) => None,
                };
                if modified != last_modified {
                    last_modified = modified;
                    if tx.send(()).await.is_err() {
                        break;
                    }
                }
            }
        });
        rx
    }
}

/// In-memory test double: content is pushed directly via [`push`], no
/// filesystem or network involved.
pub struct InMemoryConfigSource {
    content: Mutex<String>,
    notify: broadcast::Sender<()>,
    /// Lets tests simulate the watch subscription dying out from under the
    /// Subscriber, independent of the `notify` channel used for real
    /// configuration-change events.
    kill: broadcast::Sender<()>,
}

impl InMemoryConfigSource {
    pub fn new(initial: impl Into<String>) -> Arc<Self> {
        let (notify, _) = broadcast::channel(16);
        let (kill, _) = broadcast::channel(16);
        Arc::new(Self {
            content: Mutex::new(initial.into()),
            notify,
            kill,
        })
    }

    /// Publishes new contents and notifies any active watcher.
    pub async fn push(&self, contents: impl Into<String>) {
        *self.content.lock().await = contents.into();
        let _ = self.notify.send(());
    }

    /// Test hook: force-closes every currently active `watch()` subscription,
    /// simulating a dropped connection to the external configuration source.
    pub fn disconnect_watch(&self) {
        let _ = self.kill.send(());
    }
}

#[async_trait]
impl ConfigSource for InMemoryConfigSource {
    async fn read(&self) -> Result<String, CacheError> {
        Ok(self.content.lock().await.clone())
    }

    async fn watch(&self) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(16);
        let mut sub = self.notify.subscribe();
        let mut kill = self.kill.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = kill.recv() => break,
                    event = sub.recv() => {
                        match event {
                            Ok(()) => {
                                if tx.send(()).await.is_err() {
                                    break;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
        });
        rx
    }
}
