//! Write coordinator: the single choke point for local mutations.
//!
//! Every mutation commits to the local cache synchronously, then best-effort
//! replicates the new whole-collection value to the remote mirror. The two
//! phases have deliberately asymmetric error contracts:
//!
//! - **phase 1 (local commit)**: synchronous; failures propagate to the
//!   caller via the returned `Result`.
//! - **phase 2 (remote replication)**: fire-and-forget; failures are caught
//!   and logged here and never invalidate the committed local write. The
//!   returned [`Replication`] handle lets a caller await the outcome when it
//!   cares, but nothing retries and nothing is queued for later: once
//!   connectivity is lost, local writes keep succeeding while silently not
//!   propagating.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::cache::{CacheError, LocalCache};
use crate::record;
use crate::remote::{RemoteError, RemoteMirror};

/// Handle to a pending phase-2 remote replication.
///
/// Awaiting it is optional; dropping it detaches from an in-flight write
/// without affecting it.
#[derive(Debug)]
pub struct Replication {
    rx: Option<oneshot::Receiver<Result<(), RemoteError>>>,
}

impl Replication {
    fn pending(rx: oneshot::Receiver<Result<(), RemoteError>>) -> Self {
        Self { rx: Some(rx) }
    }

    /// The replication that never happened: no mirror is configured.
    fn offline() -> Self {
        Self { rx: None }
    }

    /// Wait for the remote write to settle.
    pub async fn wait(self) -> Result<(), RemoteError> {
        match self.rx {
            None => Err(RemoteError::Offline),
            Some(rx) => rx.await.unwrap_or(Err(RemoteError::Closed)),
        }
    }
}

/// Applies local mutations and best-effort replicates them remotely.
pub struct WriteCoordinator {
    cache: Arc<LocalCache>,
    mirror: Option<Arc<dyn RemoteMirror>>,
}

impl WriteCoordinator {
    pub fn new(cache: Arc<LocalCache>, mirror: Option<Arc<dyn RemoteMirror>>) -> Self {
        Self { cache, mirror }
    }

    /// Commit `value` under `key` locally, then replicate asynchronously.
    pub fn save(&self, key: &str, value: Value) -> Result<Replication, CacheError> {
        self.cache.set(key, value.clone())?;

        let Some(mirror) = self.mirror.clone() else {
            warn!(key, "Remote mirror not configured; change stays local");
            return Ok(Replication::offline());
        };

        let (tx, rx) = oneshot::channel();
        let key_owned = key.to_string();
        tokio::spawn(async move {
            let result = mirror.save(&key_owned, &value).await;
            if let Err(ref e) = result {
                // The local write already succeeded and stays committed.
                // No retry, no queue.
                warn!(key = %key_owned, error = %e, "Remote replication failed; local write kept");
            } else {
                debug!(key = %key_owned, "Replicated to remote mirror");
            }
            let _ = tx.send(result);
        });
        Ok(Replication::pending(rx))
    }

    /// Prepend `item` to the collection (most-recent-first ordering).
    pub fn add_to_collection(&self, key: &str, item: Value) -> Result<Replication, CacheError> {
        let mut items = self.cache.get_array(key);
        items.insert(0, item);
        self.save(key, Value::Array(items))
    }

    /// Replace the record whose `id` matches `item`'s, in place.
    ///
    /// On a miss the collection is unchanged (no error, no insertion) and
    /// the (unchanged) value is still saved and replicated.
    pub fn update_in_collection(&self, key: &str, item: Value) -> Result<Replication, CacheError> {
        let mut items = self.cache.get_array(key);
        let id = record::record_id(&item).map(str::to_owned);
        if let Some(id) = id {
            if let Some(pos) = items
                .iter()
                .position(|existing| record::record_id(existing) == Some(id.as_str()))
            {
                items[pos] = item;
            } else {
                debug!(key, id, "Update target not found; collection unchanged");
            }
        }
        self.save(key, Value::Array(items))
    }

    /// Remove every record whose `id` matches, returning the new collection.
    ///
    /// The only operation whose result the caller consumes directly instead
    /// of re-reading the cache.
    pub fn delete_from_collection(
        &self,
        key: &str,
        id: &str,
    ) -> Result<(Vec<Value>, Replication), CacheError> {
        let mut items = self.cache.get_array(key);
        items.retain(|existing| record::record_id(existing) != Some(id));
        let replication = self.save(key, Value::Array(items.clone()))?;
        Ok((items, replication))
    }

    /// Current local value of the collection, defaulting to empty.
    #[must_use]
    pub fn get_collection(&self, key: &str) -> Vec<Value> {
        self.cache.get_array(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::InMemoryMirror;
    use async_trait::async_trait;
    use serde_json::json;

    /// Mirror whose every call fails, for exercising the swallow path.
    struct FailingMirror;

    #[async_trait]
    impl RemoteMirror for FailingMirror {
        async fn save(&self, _: &str, _: &Value) -> Result<(), RemoteError> {
            Err(RemoteError::Backend("injected failure".into()))
        }
        async fn push(&self, _: &str, _: &Value) -> Result<String, RemoteError> {
            Err(RemoteError::Backend("injected failure".into()))
        }
        async fn fetch_once(&self, _: &str) -> Result<Option<Value>, RemoteError> {
            Err(RemoteError::Backend("injected failure".into()))
        }
        async fn subscribe(&self, _: &str) -> Result<crate::remote::Snapshots, RemoteError> {
            Err(RemoteError::Backend("injected failure".into()))
        }
        async fn on_disconnect_save(&self, _: &str, _: &Value) -> Result<(), RemoteError> {
            Err(RemoteError::Backend("injected failure".into()))
        }
        async fn cancel_disconnect(&self, _: &str) -> Result<(), RemoteError> {
            Err(RemoteError::Backend("injected failure".into()))
        }
    }

    fn offline_writer() -> WriteCoordinator {
        WriteCoordinator::new(Arc::new(LocalCache::in_memory(1024 * 1024)), None)
    }

    fn mirrored_writer() -> (WriteCoordinator, Arc<InMemoryMirror>) {
        let mirror = Arc::new(InMemoryMirror::new());
        let writer = WriteCoordinator::new(
            Arc::new(LocalCache::in_memory(1024 * 1024)),
            Some(mirror.clone()),
        );
        (writer, mirror)
    }

    #[tokio::test]
    async fn test_save_round_trip() {
        let writer = offline_writer();
        let value = json!({"nested": {"deep": [1, 2, 3]}});
        writer.save("config", value.clone()).unwrap();
        assert_eq!(writer.cache.get("config"), Some(value));
    }

    #[tokio::test]
    async fn test_save_replicates_to_mirror() {
        let (writer, mirror) = mirrored_writer();
        let replication = writer.save("orders", json!([{"id": "1"}])).unwrap();
        replication.wait().await.unwrap();

        let remote = mirror.fetch_once("orders").await.unwrap();
        assert_eq!(remote, Some(json!([{"id": "1"}])));
    }

    #[tokio::test]
    async fn test_add_prepends() {
        let writer = offline_writer();
        writer.add_to_collection("logs", json!({"id": "1"})).unwrap();
        writer.add_to_collection("logs", json!({"id": "2"})).unwrap();

        let items = writer.get_collection("logs");
        assert_eq!(items, vec![json!({"id": "2"}), json!({"id": "1"})]);
    }

    #[tokio::test]
    async fn test_update_replaces_in_place() {
        let writer = offline_writer();
        writer.add_to_collection("logs", json!({"id": "1", "note": "old"})).unwrap();
        writer.add_to_collection("logs", json!({"id": "2"})).unwrap();

        writer
            .update_in_collection("logs", json!({"id": "1", "note": "new"}))
            .unwrap();

        let items = writer.get_collection("logs");
        assert_eq!(items[0], json!({"id": "2"}));
        assert_eq!(items[1], json!({"id": "1", "note": "new"}));
    }

    #[tokio::test]
    async fn test_update_miss_is_a_no_op() {
        let writer = offline_writer();
        writer.add_to_collection("logs", json!({"id": "1"})).unwrap();

        writer
            .update_in_collection("logs", json!({"id": "ghost", "note": "lost"}))
            .unwrap();

        // No insertion, nothing changed.
        assert_eq!(writer.get_collection("logs"), vec![json!({"id": "1"})]);
    }

    #[tokio::test]
    async fn test_delete_returns_new_collection() {
        let writer = offline_writer();
        writer.add_to_collection("logs", json!({"id": "1"})).unwrap();
        writer.add_to_collection("logs", json!({"id": "2"})).unwrap();

        let (remaining, _) = writer.delete_from_collection("logs", "1").unwrap();
        assert_eq!(remaining, vec![json!({"id": "2"})]);
        assert_eq!(writer.get_collection("logs"), remaining);
    }

    #[tokio::test]
    async fn test_delete_missing_id_is_idempotent() {
        let writer = offline_writer();
        writer.add_to_collection("logs", json!({"id": "1"})).unwrap();

        let (remaining, _) = writer.delete_from_collection("logs", "missing-id").unwrap();
        assert_eq!(remaining, vec![json!({"id": "1"})]);
    }

    #[tokio::test]
    async fn test_offline_save_succeeds_locally() {
        let writer = offline_writer();
        let replication = writer.save("k", json!(1)).unwrap();
        assert_eq!(writer.cache.get("k"), Some(json!(1)));
        assert!(matches!(replication.wait().await, Err(RemoteError::Offline)));
    }

    #[tokio::test]
    async fn test_remote_failure_never_reaches_the_local_result() {
        let writer = WriteCoordinator::new(
            Arc::new(LocalCache::in_memory(1024 * 1024)),
            Some(Arc::new(FailingMirror)),
        );

        // Phase 1 succeeds even though phase 2 will fail.
        let replication = writer.save("k", json!({"id": "1"})).unwrap();
        assert_eq!(writer.cache.get("k"), Some(json!({"id": "1"})));

        // The failure is only visible to a caller who opts in.
        assert!(matches!(
            replication.wait().await,
            Err(RemoteError::Backend(_))
        ));
    }

    #[tokio::test]
    async fn test_replication_handle_is_debuggable() {
        let writer = offline_writer();
        let replication = writer.save("k", json!(1)).unwrap();
        assert!(format!("{replication:?}").contains("Replication"));
    }

    #[tokio::test]
    async fn test_local_capacity_error_propagates() {
        let writer = WriteCoordinator::new(Arc::new(LocalCache::in_memory(16)), None);
        let err = writer.save("k", json!("far too large for the cache")).unwrap_err();
        assert!(matches!(err, CacheError::CapacityExceeded { .. }));
    }
}
