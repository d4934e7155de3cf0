//! Configuration for the sync engine.
//!
//! # Example
//!
//! ```
//! use fieldsync::SyncConfig;
//!
//! // Minimal config: no remote URL means offline-degraded operation.
//! let config = SyncConfig::default();
//! assert!(config.remote_url.is_none());
//!
//! // Full config
//! let config = SyncConfig {
//!     remote_url: Some("redis://localhost:6379".into()),
//!     collections: vec!["reports".into(), "deviations".into(), "logs".into()],
//!     ..Default::default()
//! };
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Configuration for the sync engine.
///
/// All fields have defaults; a default config runs fully offline against an
/// in-process cache and a local blob database.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Remote mirror connection string (e.g. "redis://localhost:6379").
    /// `None` = offline-degraded: local cache and blob store keep working,
    /// every remote call becomes a logged no-op.
    #[serde(default)]
    pub remote_url: Option<String>,

    /// Key prefix namespacing this application's paths on the mirror.
    #[serde(default = "default_remote_prefix")]
    pub remote_prefix: String,

    /// Snapshot file for the local cache. `None` = memory only.
    #[serde(default)]
    pub cache_path: Option<PathBuf>,

    /// Local cache capacity in serialized bytes.
    #[serde(default = "default_cache_max_bytes")]
    pub cache_max_bytes: usize,

    /// SQLite file backing the blob store.
    #[serde(default = "default_blob_db_path")]
    pub blob_db_path: PathBuf,

    /// The known collection keys the sync coordinator subscribes to.
    #[serde(default)]
    pub collections: Vec<String>,

    /// Path prefix for per-user presence markers.
    #[serde(default = "default_presence_path")]
    pub presence_path: String,

    /// A user quiet for longer than this counts as offline.
    #[serde(default = "default_presence_stale_secs")]
    pub presence_stale_secs: u64,

    /// Heartbeat TTL for the Redis disconnect-hook emulation.
    #[serde(default = "default_heartbeat_ttl_secs")]
    pub heartbeat_ttl_secs: u64,
}

fn default_remote_prefix() -> String {
    "fieldsync:".to_string()
}

fn default_cache_max_bytes() -> usize {
    16 * 1024 * 1024 // 16 MB, generous for JSON collections
}

fn default_blob_db_path() -> PathBuf {
    PathBuf::from("./fieldsync_blobs.db")
}

fn default_presence_path() -> String {
    "status".to_string()
}

fn default_presence_stale_secs() -> u64 {
    5 * 60
}

fn default_heartbeat_ttl_secs() -> u64 {
    30
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            remote_url: None,
            remote_prefix: default_remote_prefix(),
            cache_path: None,
            cache_max_bytes: default_cache_max_bytes(),
            blob_db_path: default_blob_db_path(),
            collections: Vec::new(),
            presence_path: default_presence_path(),
            presence_stale_secs: default_presence_stale_secs(),
            heartbeat_ttl_secs: default_heartbeat_ttl_secs(),
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub fn presence_stale_after(&self) -> Duration {
        Duration::from_secs(self.presence_stale_secs)
    }

    #[must_use]
    pub fn heartbeat_ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat_ttl_secs)
    }
}
