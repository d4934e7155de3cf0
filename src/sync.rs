//! Sync coordinator: applies inbound remote pushes to the local cache.
//!
//! One always-subscribed task per known collection key, held for the life of
//! the engine. The coordinator is a pure reactive relay with no state machine:
//!
//! - a `null` snapshot (path never written, or freshly cleared) is ignored, so
//!   a collection created purely locally is never clobbered by an "empty"
//!   remote state;
//! - any other snapshot overwrites the local cache entry wholesale and is
//!   broadcast to observers.
//!
//! Observers attach through the [`ObserverRegistry`], an explicit
//! subscription seam owned by the coordinator, so components (and tests) hook
//! in without any process-global signal channel.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::LocalCache;
use crate::remote::{RemoteError, RemoteMirror};

/// An applied remote update: the affected collection key and the new value.
#[derive(Debug, Clone)]
pub struct SyncUpdate {
    pub key: String,
    pub value: Value,
}

/// Registry of "remote value changed" observers.
///
/// Any number of listeners may attach; dropping a receiver detaches it.
/// Slow observers that fall more than the channel capacity behind lose the
/// oldest updates (they are expected to re-read the cache anyway).
pub struct ObserverRegistry {
    tx: broadcast::Sender<SyncUpdate>,
}

impl ObserverRegistry {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SyncUpdate> {
        self.tx.subscribe()
    }

    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub(crate) fn publish(&self, update: SyncUpdate) {
        // A send error just means nobody is listening right now.
        let _ = self.tx.send(update);
    }
}

impl Default for ObserverRegistry {
    fn default() -> Self {
        Self::new(64)
    }
}

/// Relays remote pushes into the local cache and notifies observers.
pub struct SyncCoordinator {
    cache: Arc<LocalCache>,
    observers: Arc<ObserverRegistry>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncCoordinator {
    pub fn new(cache: Arc<LocalCache>, observers: Arc<ObserverRegistry>) -> Self {
        Self {
            cache,
            observers,
            tasks: Vec::new(),
        }
    }

    #[must_use]
    pub fn observers(&self) -> &Arc<ObserverRegistry> {
        &self.observers
    }

    /// Open one subscription per key and start the relay tasks.
    pub async fn start(
        &mut self,
        mirror: &Arc<dyn RemoteMirror>,
        keys: &[String],
    ) -> Result<(), RemoteError> {
        for key in keys {
            let mut snapshots = mirror.subscribe(key).await?;
            let cache = self.cache.clone();
            let observers = self.observers.clone();
            let key = key.clone();

            let task = tokio::spawn(async move {
                while let Some(snapshot) = snapshots.recv().await {
                    match snapshot {
                        None => {
                            debug!(key, "Null snapshot ignored; local value preserved");
                        }
                        Some(value) => match cache.set(&key, value.clone()) {
                            Ok(()) => {
                                debug!(key, "Remote push applied to local cache");
                                observers.publish(SyncUpdate {
                                    key: key.clone(),
                                    value,
                                });
                            }
                            Err(e) => {
                                warn!(key, error = %e, "Could not apply remote push locally");
                            }
                        },
                    }
                }
                debug!(key, "Subscription ended");
            });
            self.tasks.push(task);
        }
        info!(collections = keys.len(), "Sync coordinator subscribed");
        Ok(())
    }

    /// Abort all relay tasks (engine shutdown).
    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}
