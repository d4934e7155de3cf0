//! Remote mirror: the path-addressed, push-based remote database seam.
//!
//! Each collection key maps 1:1 to a path in the mirror. The mirror supports
//! whole-path overwrite, append-under-a-path (the mirror generates the child
//! id), fetch-once, push subscriptions, and disconnect hooks: a value
//! pre-registered to be written server-side if this client vanishes without
//! an explicit sign-off.
//!
//! Authentication and connection configuration are an external concern: the
//! engine receives a ready handle (or none, for offline-degraded operation).

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

pub use memory::InMemoryMirror;
pub use redis::RedisMirror;

#[derive(Error, Debug, Clone)]
pub enum RemoteError {
    /// No mirror is configured; the engine is running offline-degraded.
    #[error("remote mirror is not configured")]
    Offline,
    #[error("remote backend error: {0}")]
    Backend(String),
    /// The subscription or replication channel ended before settling.
    #[error("remote channel closed")]
    Closed,
}

/// A push subscription to one path.
///
/// The first delivered snapshot is the path's current value (`None` when the
/// path has never been written); every subsequent one reflects a change. The
/// outer `None` from [`recv`](Self::recv) means the subscription itself ended.
pub struct Snapshots {
    rx: mpsc::Receiver<Option<Value>>,
}

impl Snapshots {
    #[must_use]
    pub fn new(rx: mpsc::Receiver<Option<Value>>) -> Self {
        Self { rx }
    }

    pub async fn recv(&mut self) -> Option<Option<Value>> {
        self.rx.recv().await
    }
}

/// The external real-time database every collection is mirrored against.
#[async_trait]
pub trait RemoteMirror: Send + Sync {
    /// Overwrite the entire value at `path`.
    async fn save(&self, path: &str, value: &Value) -> Result<(), RemoteError>;

    /// Append `value` under `path`; the mirror generates and returns the
    /// child id and stamps a `serverTime` field on the stored child.
    async fn push(&self, path: &str, value: &Value) -> Result<String, RemoteError>;

    /// Fetch the current value at `path`, `None` when never written.
    async fn fetch_once(&self, path: &str) -> Result<Option<Value>, RemoteError>;

    /// Subscribe to pushes for `path`.
    async fn subscribe(&self, path: &str) -> Result<Snapshots, RemoteError>;

    /// Register a value to be written at `path` if this client disconnects
    /// without an explicit sign-off. Re-registering replaces the hook.
    /// A `lastSeen` field in the payload is re-stamped with the actual
    /// disconnect time when the hook fires.
    async fn on_disconnect_save(&self, path: &str, value: &Value) -> Result<(), RemoteError>;

    /// Drop any disconnect hook registered for `path` (graceful sign-off).
    async fn cancel_disconnect(&self, path: &str) -> Result<(), RemoteError>;
}

/// Re-stamp a hook payload's `lastSeen` field with the current time.
///
/// Hooks are registered long before they fire; the marker written on
/// disconnect should carry the disconnect time, not the registration time.
pub(crate) fn restamp_last_seen(value: &mut Value) {
    if let Some(map) = value.as_object_mut() {
        if map.contains_key("lastSeen") {
            map.insert(
                "lastSeen".to_string(),
                Value::from(chrono::Utc::now().timestamp_millis()),
            );
        }
    }
}
