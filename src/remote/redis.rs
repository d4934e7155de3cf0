//! Redis-backed remote mirror.
//!
//! Maps the path-addressed mirror protocol onto a plain Redis keyspace:
//!
//! - values live at `{prefix}{path}` as JSON text
//! - every write is published on `{prefix}changes:{path}`, so subscriptions
//!   are pub/sub channels with the current value delivered first
//! - saving JSON `null` deletes the key, matching the remote's "a null write
//!   clears the path" semantics
//!
//! Redis has no server-side disconnect hooks, so they are approximated
//! client-side: hooks are recorded in a per-client hash
//! (`{prefix}hooks:{client_id}`) next to a TTL'd heartbeat key refreshed by a
//! background task. [`reap_disconnected`](RedisMirror::reap_disconnected)
//! applies the hooks of any client whose heartbeat has expired; the engine
//! calls it periodically from its run loop. A client that signs off
//! gracefully cancels its hooks first, so the reaper never sees them.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{RemoteError, RemoteMirror, Snapshots};
use crate::record;

const SUBSCRIBER_BUFFER: usize = 256;

fn backend(err: redis::RedisError) -> RemoteError {
    RemoteError::Backend(err.to_string())
}

pub struct RedisMirror {
    /// Kept for opening dedicated pub/sub connections.
    client: Client,
    connection: ConnectionManager,
    prefix: String,
    client_id: String,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl RedisMirror {
    /// Connect to Redis and start the heartbeat task.
    ///
    /// `heartbeat_ttl` is the window after which an unrefreshed heartbeat
    /// counts as an ungraceful disconnect.
    pub async fn connect(
        url: &str,
        prefix: &str,
        heartbeat_ttl: Duration,
    ) -> Result<Self, RemoteError> {
        let client = Client::open(url).map_err(backend)?;
        let connection = ConnectionManager::new(client.clone())
            .await
            .map_err(backend)?;
        let client_id = uuid::Uuid::new_v4().to_string();

        let mirror = Self {
            client,
            connection,
            prefix: prefix.to_string(),
            client_id,
            heartbeat: Mutex::new(None),
        };
        mirror.start_heartbeat(heartbeat_ttl);
        info!(url, client_id = %mirror.client_id, "Connected to remote mirror");
        Ok(mirror)
    }

    fn start_heartbeat(&self, ttl: Duration) {
        let key = self.heartbeat_key(&self.client_id);
        let mut conn = self.connection.clone();
        let ttl_secs = ttl.as_secs().max(1);
        let refresh = Duration::from_secs((ttl_secs / 3).max(1));

        let handle = tokio::spawn(async move {
            loop {
                let result: Result<(), redis::RedisError> =
                    conn.set_ex(&key, 1u8, ttl_secs).await;
                if let Err(e) = result {
                    warn!(error = %e, "Heartbeat refresh failed");
                }
                tokio::time::sleep(refresh).await;
            }
        });
        *self.heartbeat.lock() = Some(handle);
    }

    #[inline]
    fn value_key(&self, path: &str) -> String {
        format!("{}{}", self.prefix, path)
    }

    #[inline]
    fn channel(&self, path: &str) -> String {
        format!("{}changes:{}", self.prefix, path)
    }

    #[inline]
    fn hooks_key(&self, client_id: &str) -> String {
        format!("{}hooks:{}", self.prefix, client_id)
    }

    #[inline]
    fn heartbeat_key(&self, client_id: &str) -> String {
        format!("{}client:{}", self.prefix, client_id)
    }

    /// Apply the disconnect hooks of every client whose heartbeat expired.
    ///
    /// Returns the number of hooks applied. Safe to call from any client;
    /// applying a hook twice just rewrites the same value.
    pub async fn reap_disconnected(&self) -> Result<usize, RemoteError> {
        let mut conn = self.connection.clone();
        let pattern = format!("{}hooks:*", self.prefix);
        let hook_keys: Vec<String> = conn.keys(&pattern).await.map_err(backend)?;

        let mut applied = 0usize;
        for hook_key in hook_keys {
            let Some(client_id) = hook_key.strip_prefix(&format!("{}hooks:", self.prefix))
            else {
                continue;
            };
            let alive: bool = conn
                .exists(self.heartbeat_key(client_id))
                .await
                .map_err(backend)?;
            if alive {
                continue;
            }

            let hooks: Vec<(String, String)> =
                conn.hgetall(&hook_key).await.map_err(backend)?;
            for (path, payload) in hooks {
                match serde_json::from_str::<Value>(&payload) {
                    Ok(mut value) => {
                        super::restamp_last_seen(&mut value);
                        self.save(&path, &value).await?;
                        applied += 1;
                    }
                    Err(e) => warn!(path, error = %e, "Skipping unparseable disconnect hook"),
                }
            }
            let _: () = conn.del(&hook_key).await.map_err(backend)?;
            info!(client_id, "Applied disconnect hooks of vanished client");
        }
        Ok(applied)
    }

    /// Graceful teardown: stop the heartbeat, drop this client's hook hash
    /// and heartbeat key.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.heartbeat.lock().take() {
            handle.abort();
        }
        let mut conn = self.connection.clone();
        let cleanup: Result<(), redis::RedisError> = async {
            let _: () = conn.del(self.hooks_key(&self.client_id)).await?;
            let _: () = conn.del(self.heartbeat_key(&self.client_id)).await?;
            Ok(())
        }
        .await;
        if let Err(e) = cleanup {
            warn!(error = %e, "Mirror shutdown cleanup failed");
        }
    }
}

impl Drop for RedisMirror {
    fn drop(&mut self) {
        if let Some(handle) = self.heartbeat.lock().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl RemoteMirror for RedisMirror {
    async fn save(&self, path: &str, value: &Value) -> Result<(), RemoteError> {
        let payload = serde_json::to_string(value)
            .map_err(|e| RemoteError::Backend(e.to_string()))?;
        let mut conn = self.connection.clone();
        if value.is_null() {
            let _: () = conn.del(self.value_key(path)).await.map_err(backend)?;
        } else {
            let _: () = conn
                .set(self.value_key(path), &payload)
                .await
                .map_err(backend)?;
        }
        let _: () = conn
            .publish(self.channel(path), payload)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn push(&self, path: &str, value: &Value) -> Result<String, RemoteError> {
        let id = record::generate_id();
        let mut child = value.clone();
        if let Some(map) = child.as_object_mut() {
            map.insert(
                "serverTime".to_string(),
                Value::from(chrono::Utc::now().timestamp_millis()),
            );
        }

        // Read-modify-write of the whole path object; the collection-level
        // overwrite model has no finer-grained primitive anyway.
        let mut parent = match self.fetch_once(path).await? {
            Some(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        parent.insert(id.clone(), child);
        self.save(path, &Value::Object(parent)).await?;
        Ok(id)
    }

    async fn fetch_once(&self, path: &str) -> Result<Option<Value>, RemoteError> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = conn.get(self.value_key(path)).await.map_err(backend)?;
        match raw {
            None => Ok(None),
            Some(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| RemoteError::Backend(format!("corrupt value at '{path}': {e}"))),
        }
    }

    async fn subscribe(&self, path: &str) -> Result<Snapshots, RemoteError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(backend)?;
        pubsub.subscribe(self.channel(path)).await.map_err(backend)?;

        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);

        // Initial snapshot before any pushed change, like the remote client.
        let current = self.fetch_once(path).await?;
        let _ = tx.try_send(current);

        let path_owned = path.to_string();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(path = %path_owned, error = %e, "Unreadable change payload");
                        continue;
                    }
                };
                let snapshot = match serde_json::from_str::<Value>(&payload) {
                    Ok(Value::Null) => None,
                    Ok(value) => Some(value),
                    Err(e) => {
                        warn!(path = %path_owned, error = %e, "Unparseable change payload");
                        continue;
                    }
                };
                if tx.send(snapshot).await.is_err() {
                    debug!(path = %path_owned, "Subscriber gone, ending pub/sub task");
                    break;
                }
            }
        });

        Ok(Snapshots::new(rx))
    }

    async fn on_disconnect_save(&self, path: &str, value: &Value) -> Result<(), RemoteError> {
        let payload = serde_json::to_string(value)
            .map_err(|e| RemoteError::Backend(e.to_string()))?;
        let mut conn = self.connection.clone();
        let _: () = conn
            .hset(self.hooks_key(&self.client_id), path, payload)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn cancel_disconnect(&self, path: &str) -> Result<(), RemoteError> {
        let mut conn = self.connection.clone();
        let _: () = conn
            .hdel(self.hooks_key(&self.client_id), path)
            .await
            .map_err(backend)?;
        Ok(())
    }
}
