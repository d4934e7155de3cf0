//! In-memory remote mirror.
//!
//! Full-fidelity, in-process implementation of [`RemoteMirror`]: per-path
//! subscriber fan-out with the current value delivered first, mirror-generated
//! child ids on push, and disconnect hooks fired by
//! [`trigger_disconnect`](InMemoryMirror::trigger_disconnect). Several engine
//! instances sharing one `Arc<InMemoryMirror>` behave like several clients of
//! one remote database, which is exactly what the integration tests need.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use super::{RemoteError, RemoteMirror, Snapshots};
use crate::record;

const SUBSCRIBER_BUFFER: usize = 256;

#[derive(Default)]
pub struct InMemoryMirror {
    data: DashMap<String, Value>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<Option<Value>>>>>,
    hooks: Mutex<HashMap<String, Value>>,
}

impl InMemoryMirror {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn notify(&self, path: &str, value: Option<&Value>) {
        let mut subs = self.subscribers.lock();
        if let Some(senders) = subs.get_mut(path) {
            // Only a closed channel detaches a subscriber. A full buffer
            // drops this snapshot; the next one overwrites it anyway.
            senders.retain(|tx| match tx.try_send(value.cloned()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(path, "Subscriber buffer full; snapshot dropped");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }
    }

    /// Simulate this client vanishing: apply and clear every registered
    /// disconnect hook, as the real backend would server-side.
    pub async fn trigger_disconnect(&self) {
        let hooks: Vec<(String, Value)> = {
            let mut guard = self.hooks.lock();
            guard.drain().collect()
        };
        for (path, mut value) in hooks {
            debug!(path = %path, "Firing disconnect hook");
            super::restamp_last_seen(&mut value);
            self.data.insert(path.clone(), value.clone());
            self.notify(&path, Some(&value));
        }
    }

    /// Number of live subscriptions for a path (test observability).
    #[must_use]
    pub fn subscriber_count(&self, path: &str) -> usize {
        self.subscribers
            .lock()
            .get(path)
            .map_or(0, |senders| senders.iter().filter(|tx| !tx.is_closed()).count())
    }
}

#[async_trait]
impl RemoteMirror for InMemoryMirror {
    async fn save(&self, path: &str, value: &Value) -> Result<(), RemoteError> {
        // A null write clears the path, and subscribers see a null snapshot.
        if value.is_null() {
            self.data.remove(path);
            self.notify(path, None);
        } else {
            self.data.insert(path.to_string(), value.clone());
            self.notify(path, Some(value));
        }
        Ok(())
    }

    async fn push(&self, path: &str, value: &Value) -> Result<String, RemoteError> {
        let id = record::generate_id();
        let mut child = value.clone();
        if let Some(map) = child.as_object_mut() {
            map.insert(
                "serverTime".to_string(),
                Value::from(Utc::now().timestamp_millis()),
            );
        }

        let updated = {
            let mut entry = self
                .data
                .entry(path.to_string())
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(serde_json::Map::new());
            }
            if let Some(map) = entry.as_object_mut() {
                map.insert(id.clone(), child);
            }
            entry.clone()
        };

        self.notify(path, Some(&updated));
        Ok(id)
    }

    async fn fetch_once(&self, path: &str) -> Result<Option<Value>, RemoteError> {
        Ok(self.data.get(path).map(|v| v.clone()))
    }

    async fn subscribe(&self, path: &str) -> Result<Snapshots, RemoteError> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let current = self.data.get(path).map(|v| v.clone());
        // Initial snapshot mirrors the remote's behavior: delivered
        // immediately, null when the path was never written.
        let _ = tx.try_send(current);
        self.subscribers
            .lock()
            .entry(path.to_string())
            .or_default()
            .push(tx);
        Ok(Snapshots::new(rx))
    }

    async fn on_disconnect_save(&self, path: &str, value: &Value) -> Result<(), RemoteError> {
        self.hooks.lock().insert(path.to_string(), value.clone());
        Ok(())
    }

    async fn cancel_disconnect(&self, path: &str) -> Result<(), RemoteError> {
        self.hooks.lock().remove(path);
        Ok(())
    }
}
