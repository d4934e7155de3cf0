//! Engine facade and lifecycle.
//!
//! The [`SyncEngine`] is the explicit context object that owns every
//! component: the local cache, the optional remote mirror handle, the write
//! and sync coordinators, the presence coordinator and the blob store.
//! Nothing in the crate touches ambient global state; the UI layer holds one
//! engine and calls through it.
//!
//! # Lifecycle
//!
//! ```text
//! Created → Connecting → Ready | Offline → ShuttingDown
//! ```
//!
//! `Offline` is the degraded mode entered when no remote URL is configured or
//! the mirror cannot be reached at startup: the cache and blob store operate
//! normally, every remote call becomes a logged no-op, and nothing is queued
//! for later delivery.
//!
//! # Example
//!
//! ```rust,no_run
//! use fieldsync::{SyncConfig, SyncEngine};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SyncConfig {
//!     remote_url: Some("redis://localhost:6379".into()),
//!     collections: vec!["reports".into(), "logs".into()],
//!     ..Default::default()
//! };
//! let mut engine = SyncEngine::new(config)?;
//! engine.start().await?;
//!
//! engine.add_to_collection("reports", json!({"id": "r-1", "title": "Shift report"}))?;
//! let reports = engine.get_collection("reports");
//! assert_eq!(reports.len(), 1);
//!
//! engine.shutdown(None).await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::assist::{NoAssist, TextAssist};
use crate::blob::{BlobError, BlobStore};
use crate::cache::{CacheError, LocalCache};
use crate::config::SyncConfig;
use crate::presence::PresenceCoordinator;
use crate::record::UserIdentity;
use crate::remote::{RedisMirror, RemoteError, RemoteMirror};
use crate::sync::{ObserverRegistry, SyncCoordinator, SyncUpdate};
use crate::writer::{Replication, WriteCoordinator};

/// Engine lifecycle state, broadcast over a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Just created, not yet started.
    Created,
    /// Connecting to the remote mirror and opening stores.
    Connecting,
    /// Running with a live mirror.
    Ready,
    /// Running locally; remote calls are logged no-ops.
    Offline,
    /// Graceful shutdown in progress.
    ShuttingDown,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Ready => write!(f, "Ready"),
            Self::Offline => write!(f, "Offline"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
        }
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error("engine not started")]
    NotStarted,
}

/// The local-first sync engine.
pub struct SyncEngine {
    config: SyncConfig,
    state: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,
    cache: Arc<LocalCache>,
    /// Test/embedding injection point; used instead of `remote_url` when set.
    injected_mirror: Option<Arc<dyn RemoteMirror>>,
    mirror: Option<Arc<dyn RemoteMirror>>,
    redis_mirror: Option<Arc<RedisMirror>>,
    writer: Option<WriteCoordinator>,
    sync: Option<SyncCoordinator>,
    presence: Option<PresenceCoordinator>,
    blobs: Option<BlobStore>,
    assist: Arc<dyn TextAssist>,
    hook_reaper: Option<JoinHandle<()>>,
}

impl SyncEngine {
    /// Create the engine and open (or restore) the local cache.
    ///
    /// The engine starts in `Created` state; call [`start`](Self::start) to
    /// connect and subscribe.
    pub fn new(config: SyncConfig) -> Result<Self, CacheError> {
        let cache = Arc::new(LocalCache::open(
            config.cache_path.clone(),
            config.cache_max_bytes,
        )?);
        let (state, state_rx) = watch::channel(EngineState::Created);
        Ok(Self {
            config,
            state,
            state_rx,
            cache,
            injected_mirror: None,
            mirror: None,
            redis_mirror: None,
            writer: None,
            sync: None,
            presence: None,
            blobs: None,
            assist: Arc::new(NoAssist),
            hook_reaper: None,
        })
    }

    /// Inject a mirror handle, bypassing `remote_url`.
    #[must_use]
    pub fn with_mirror(mut self, mirror: Arc<dyn RemoteMirror>) -> Self {
        self.injected_mirror = Some(mirror);
        self
    }

    /// Attach a text-assist provider. Without one, every assist call fails
    /// as unavailable and callers fall back to their originals.
    #[must_use]
    pub fn with_assist(mut self, assist: Arc<dyn TextAssist>) -> Self {
        self.assist = assist;
        self
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self.state(), EngineState::Ready | EngineState::Offline)
    }

    /// Connect (or degrade offline), open the blob store, and subscribe to
    /// every known collection.
    #[tracing::instrument(skip(self), fields(collections = self.config.collections.len()))]
    pub async fn start(&mut self) -> Result<(), EngineError> {
        info!("Starting sync engine");
        let _ = self.state.send(EngineState::Connecting);

        // Phase 1: resolve the mirror handle. Failure to reach the remote is
        // not fatal; the engine runs offline-degraded instead.
        let mirror: Option<Arc<dyn RemoteMirror>> = if let Some(m) = self.injected_mirror.clone()
        {
            Some(m)
        } else if let Some(url) = self.config.remote_url.clone() {
            match RedisMirror::connect(&url, &self.config.remote_prefix, self.config.heartbeat_ttl())
                .await
            {
                Ok(m) => {
                    let m = Arc::new(m);
                    self.redis_mirror = Some(m.clone());
                    Some(m)
                }
                Err(e) => {
                    warn!(error = %e, "Remote mirror unreachable; continuing offline");
                    None
                }
            }
        } else {
            info!("No remote mirror configured; running offline");
            None
        };
        self.mirror = mirror.clone();

        // Phase 2: the blob store. This one is local and load-bearing, so a
        // failure here is fatal.
        self.blobs = Some(BlobStore::open(&self.config.blob_db_path).await?);

        // Phase 3: coordinators.
        self.writer = Some(WriteCoordinator::new(self.cache.clone(), mirror.clone()));

        let mut sync = SyncCoordinator::new(
            self.cache.clone(),
            Arc::new(ObserverRegistry::default()),
        );
        if let Some(ref m) = mirror {
            if let Err(e) = sync.start(m, &self.config.collections).await {
                warn!(error = %e, "Could not subscribe to remote collections");
            }
        }
        self.sync = Some(sync);

        self.presence = Some(PresenceCoordinator::new(
            mirror.clone(),
            self.config.presence_path.clone(),
            self.config.presence_stale_after(),
        ));

        // Phase 4: disconnect-hook reaper for the Redis emulation.
        if let Some(redis) = self.redis_mirror.clone() {
            let interval = self.config.heartbeat_ttl();
            self.hook_reaper = Some(tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    if let Err(e) = redis.reap_disconnected().await {
                        warn!(error = %e, "Disconnect-hook reap failed");
                    }
                }
            }));
        }

        let next = if self.mirror.is_some() {
            EngineState::Ready
        } else {
            EngineState::Offline
        };
        let _ = self.state.send(next);
        info!(state = %next, "Sync engine started");
        Ok(())
    }

    /// Graceful shutdown: sign off presence (when a user is given), end the
    /// subscriptions, and release the stores.
    pub async fn shutdown(&mut self, user: Option<&UserIdentity>) {
        let _ = self.state.send(EngineState::ShuttingDown);

        if let (Some(user), Some(presence)) = (user, self.presence.as_ref()) {
            if let Err(e) = presence.mark_offline(user).await {
                warn!(error = %e, "Presence sign-off failed");
            }
        }
        if let Some(mut sync) = self.sync.take() {
            sync.stop();
        }
        if let Some(reaper) = self.hook_reaper.take() {
            reaper.abort();
        }
        if let Some(redis) = self.redis_mirror.take() {
            redis.shutdown().await;
        }
        if let Some(blobs) = self.blobs.take() {
            blobs.close().await;
        }
        self.writer = None;
        self.presence = None;
        self.mirror = None;
        info!("Sync engine shut down");
    }

    fn writer(&self) -> Result<&WriteCoordinator, EngineError> {
        self.writer.as_ref().ok_or(EngineError::NotStarted)
    }

    // --- Collection operations ---

    /// Commit `value` under `key` locally and replicate best-effort.
    #[tracing::instrument(skip(self, value))]
    pub fn save(&self, key: &str, value: Value) -> Result<Replication, EngineError> {
        Ok(self.writer()?.save(key, value)?)
    }

    /// Prepend `item` to the collection (most-recent-first).
    #[tracing::instrument(skip(self, item))]
    pub fn add_to_collection(&self, key: &str, item: Value) -> Result<Replication, EngineError> {
        Ok(self.writer()?.add_to_collection(key, item)?)
    }

    /// Replace the record matching `item`'s id; silent no-op on a miss.
    #[tracing::instrument(skip(self, item))]
    pub fn update_in_collection(&self, key: &str, item: Value) -> Result<Replication, EngineError> {
        Ok(self.writer()?.update_in_collection(key, item)?)
    }

    /// Remove records matching `id`, returning the new collection.
    #[tracing::instrument(skip(self))]
    pub fn delete_from_collection(
        &self,
        key: &str,
        id: &str,
    ) -> Result<(Vec<Value>, Replication), EngineError> {
        Ok(self.writer()?.delete_from_collection(key, id)?)
    }

    /// Current local value for `key`, whatever was last written or pushed.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.cache.get(key)
    }

    /// Current local collection for `key`, defaulting to empty.
    #[must_use]
    pub fn get_collection(&self, key: &str) -> Vec<Value> {
        self.cache.get_array(key)
    }

    // --- Observers ---

    /// Attach an observer to applied remote updates.
    pub fn subscribe_updates(&self) -> Result<broadcast::Receiver<SyncUpdate>, EngineError> {
        Ok(self
            .sync
            .as_ref()
            .ok_or(EngineError::NotStarted)?
            .observers()
            .subscribe())
    }

    // --- Presence ---

    /// Announce this user's session: online marker + disconnect hook.
    /// Remote failures are logged and swallowed; presence is best-effort.
    pub async fn announce_presence(&self, user: &UserIdentity) {
        if let Some(presence) = self.presence.as_ref() {
            if let Err(e) = presence.mark_online(user).await {
                warn!(error = %e, "Presence announcement failed");
            }
        }
    }

    pub fn presence(&self) -> Result<&PresenceCoordinator, EngineError> {
        self.presence.as_ref().ok_or(EngineError::NotStarted)
    }

    // --- Blob store ---

    pub fn blobs(&self) -> Result<&BlobStore, EngineError> {
        self.blobs.as_ref().ok_or(EngineError::NotStarted)
    }

    // --- Text assist ---

    /// The configured assist provider ([`NoAssist`] when none was attached).
    #[must_use]
    pub fn assist(&self) -> &Arc<dyn TextAssist> {
        &self.assist
    }

    // --- Introspection ---

    #[must_use]
    pub fn cache(&self) -> &Arc<LocalCache> {
        &self.cache
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_config(dir: &tempfile::TempDir) -> SyncConfig {
        SyncConfig {
            blob_db_path: dir.path().join("blobs.db"),
            collections: vec!["reports".into()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_created_state_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SyncEngine::new(test_config(&dir)).unwrap();
        assert_eq!(engine.state(), EngineState::Created);
        assert!(!engine.is_ready());
    }

    #[tokio::test]
    async fn test_operations_before_start_fail() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SyncEngine::new(test_config(&dir)).unwrap();
        assert!(matches!(
            engine.save("k", json!(1)),
            Err(EngineError::NotStarted)
        ));
        assert!(matches!(engine.blobs(), Err(EngineError::NotStarted)));
        assert!(matches!(
            engine.subscribe_updates(),
            Err(EngineError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn test_offline_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = SyncEngine::new(test_config(&dir)).unwrap();

        engine.start().await.unwrap();
        assert_eq!(engine.state(), EngineState::Offline);
        assert!(engine.is_ready());

        // Local operations all work without a mirror.
        engine
            .add_to_collection("reports", json!({"id": "r-1"}))
            .unwrap();
        assert_eq!(engine.get_collection("reports"), vec![json!({"id": "r-1"})]);

        engine.shutdown(None).await;
        assert_eq!(engine.state(), EngineState::ShuttingDown);
    }

    #[tokio::test]
    async fn test_state_receiver_observes_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = SyncEngine::new(test_config(&dir)).unwrap();
        let rx = engine.state_receiver();

        engine.start().await.unwrap();
        assert_eq!(*rx.borrow(), EngineState::Offline);
    }

    #[tokio::test]
    async fn test_default_assist_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SyncEngine::new(test_config(&dir)).unwrap();

        let improved =
            crate::assist::improve_or_original(engine.assist().as_ref(), "raw note", "report")
                .await;
        assert_eq!(improved, "raw note");
    }

    #[test]
    fn test_state_display() {
        assert_eq!(format!("{}", EngineState::Created), "Created");
        assert_eq!(format!("{}", EngineState::Offline), "Offline");
        assert_eq!(format!("{}", EngineState::ShuttingDown), "ShuttingDown");
    }
}
