//! Local cache: the synchronous, process-wide key→value store.
//!
//! Every named collection lives here as "whatever JSON value was last
//! written", either by a local mutation or by an applied remote push. Reads
//! and writes are synchronous from the caller's point of view; the only
//! failure modes are a value that cannot be serialized and a write that would
//! exceed the configured byte capacity, both of which propagate to the caller
//! rather than being swallowed.
//!
//! When a snapshot path is configured the full cache is rewritten to disk on
//! every set (temp file + atomic rename) and reloaded on open, so a restarted
//! process resumes from its last observed state.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("failed to serialize value for key '{key}': {source}")]
    Serialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("cache capacity exceeded: write needs {needed} bytes, limit is {limit}")]
    CapacityExceeded { needed: usize, limit: usize },
    #[error("failed to persist cache snapshot: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache snapshot at '{path}' is not valid JSON: {source}")]
    CorruptSnapshot {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug)]
struct Slot {
    value: Value,
    bytes: usize,
}

/// Synchronous key→JSON store with optional snapshot-file persistence.
#[derive(Debug)]
pub struct LocalCache {
    entries: DashMap<String, Slot>,
    size_bytes: AtomicUsize,
    max_bytes: usize,
    snapshot: Option<PathBuf>,
    /// Serializes writers: size accounting and the snapshot rewrite must see
    /// a consistent view of the map.
    write_lock: Mutex<()>,
}

impl LocalCache {
    /// Open a cache, loading the snapshot file if it exists.
    pub fn open(snapshot: Option<PathBuf>, max_bytes: usize) -> Result<Self, CacheError> {
        let cache = Self {
            entries: DashMap::new(),
            size_bytes: AtomicUsize::new(0),
            max_bytes,
            snapshot,
            write_lock: Mutex::new(()),
        };
        if let Some(path) = cache.snapshot.clone() {
            if path.exists() {
                cache.load_snapshot(&path)?;
                info!(
                    path = %path.display(),
                    keys = cache.entries.len(),
                    "Local cache restored from snapshot"
                );
            }
        }
        Ok(cache)
    }

    /// Memory-only cache, no snapshot file.
    pub fn in_memory(max_bytes: usize) -> Self {
        Self {
            entries: DashMap::new(),
            size_bytes: AtomicUsize::new(0),
            max_bytes,
            snapshot: None,
            write_lock: Mutex::new(()),
        }
    }

    fn load_snapshot(&self, path: &Path) -> Result<(), CacheError> {
        let raw = std::fs::read_to_string(path)?;
        let map: serde_json::Map<String, Value> =
            serde_json::from_str(&raw).map_err(|source| CacheError::CorruptSnapshot {
                path: path.display().to_string(),
                source,
            })?;
        let mut total = 0usize;
        for (key, value) in map {
            let bytes = Self::slot_size(&key, &value).map_err(|source| {
                CacheError::Serialize {
                    key: key.clone(),
                    source,
                }
            })?;
            total += bytes;
            self.entries.insert(key, Slot { value, bytes });
        }
        self.size_bytes.store(total, Ordering::Release);
        Ok(())
    }

    fn slot_size(key: &str, value: &Value) -> Result<usize, serde_json::Error> {
        Ok(key.len() + serde_json::to_string(value)?.len())
    }

    /// Most recent value observed for `key`, local write or remote push alike.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.get(key).map(|slot| slot.value.clone())
    }

    /// Read a collection, defaulting to empty when absent or non-array.
    #[must_use]
    pub fn get_array(&self, key: &str) -> Vec<Value> {
        match self.get(key) {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        }
    }

    /// Write `value` under `key`, replacing any previous value wholesale.
    ///
    /// Fails (leaving both the map and the snapshot untouched) when the value
    /// cannot be serialized, when the write would exceed the byte capacity,
    /// or when the snapshot file cannot be written.
    pub fn set(&self, key: &str, value: Value) -> Result<(), CacheError> {
        let bytes = Self::slot_size(key, &value).map_err(|source| CacheError::Serialize {
            key: key.to_string(),
            source,
        })?;

        let _guard = self.write_lock.lock();

        let old = self.entries.get(key).map_or(0, |slot| slot.bytes);
        let current = self.size_bytes.load(Ordering::Acquire);
        let new_total = current - old + bytes;
        if new_total > self.max_bytes {
            return Err(CacheError::CapacityExceeded {
                needed: new_total,
                limit: self.max_bytes,
            });
        }

        // Persist first so a rejected disk write never leaves the in-memory
        // map ahead of the snapshot.
        if let Some(path) = &self.snapshot {
            self.write_snapshot(path, key, &value)?;
        }

        self.entries.insert(key.to_string(), Slot { value, bytes });
        self.size_bytes.store(new_total, Ordering::Release);
        debug!(key, bytes, total = new_total, "Cache entry written");
        Ok(())
    }

    /// Rewrite the snapshot file reflecting the map plus the pending write.
    fn write_snapshot(&self, path: &Path, pending_key: &str, pending: &Value) -> Result<(), CacheError> {
        let mut map = serde_json::Map::new();
        for entry in &self.entries {
            if entry.key() != pending_key {
                map.insert(entry.key().clone(), entry.value().value.clone());
            }
        }
        map.insert(pending_key.to_string(), pending.clone());

        let serialized = serde_json::to_string(&Value::Object(map)).map_err(|source| {
            CacheError::Serialize {
                key: pending_key.to_string(),
                source,
            }
        })?;

        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, serialized)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// All keys currently held.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Approximate serialized size of everything held, in bytes.
    #[must_use]
    pub fn approx_bytes(&self) -> usize {
        self.size_bytes.load(Ordering::Acquire)
    }
}
