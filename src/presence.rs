//! Presence markers: ephemeral per-user online/offline records.
//!
//! On session start a marker with `online=true` and a fresh timestamp is
//! written to the user's path, and a disconnect hook is registered in the
//! same call so the mirror flips it to `online=false` if the client vanishes
//! without signing off. Markers are overwritten every session, never
//! historized.
//!
//! There is no "who is online" query. Consumers read each known user's path
//! and treat `lastSeen` recency as the liveness signal; the `online` flag is
//! carried but deliberately not trusted, since a crashed client whose hook
//! never fired would otherwise look online forever.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::record::UserIdentity;
use crate::remote::{RemoteError, RemoteMirror};

/// A client quiet for longer than this counts as offline.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMarker {
    pub user_id: String,
    pub name: String,
    pub role: String,
    pub online: bool,
    /// Epoch milliseconds.
    pub last_seen: i64,
}

/// Writes and reads presence markers on the remote mirror.
pub struct PresenceCoordinator {
    mirror: Option<Arc<dyn RemoteMirror>>,
    path_prefix: String,
    stale_after: Duration,
}

impl PresenceCoordinator {
    pub fn new(
        mirror: Option<Arc<dyn RemoteMirror>>,
        path_prefix: impl Into<String>,
        stale_after: Duration,
    ) -> Self {
        Self {
            mirror,
            path_prefix: path_prefix.into(),
            stale_after,
        }
    }

    fn path(&self, user_id: &str) -> String {
        format!("{}/{}", self.path_prefix, user_id)
    }

    fn marker(user: &UserIdentity, online: bool) -> PresenceMarker {
        PresenceMarker {
            user_id: user.id.clone(),
            name: user.name.clone(),
            role: user.role.clone(),
            online,
            last_seen: Utc::now().timestamp_millis(),
        }
    }

    /// Announce this session: write the online marker and register the
    /// offline disconnect hook in the same call.
    ///
    /// The hook payload's `lastSeen` is re-stamped by the mirror when the
    /// hook fires, so the offline marker carries the disconnect time rather
    /// than the registration time.
    pub async fn mark_online(&self, user: &UserIdentity) -> Result<(), RemoteError> {
        let Some(mirror) = &self.mirror else {
            warn!(user = %user.id, "No mirror configured; presence not announced");
            return Err(RemoteError::Offline);
        };
        let path = self.path(&user.id);
        let online = json!(Self::marker(user, true));
        let offline = json!(Self::marker(user, false));

        mirror.save(&path, &online).await?;
        mirror.on_disconnect_save(&path, &offline).await?;
        debug!(user = %user.id, "Presence marked online");
        Ok(())
    }

    /// Refresh `lastSeen` for an already-announced session.
    pub async fn ping(&self, user: &UserIdentity) -> Result<(), RemoteError> {
        let Some(mirror) = &self.mirror else {
            return Err(RemoteError::Offline);
        };
        mirror
            .save(&self.path(&user.id), &json!(Self::marker(user, true)))
            .await
    }

    /// Explicit sign-off: write the offline marker and drop the hook.
    pub async fn mark_offline(&self, user: &UserIdentity) -> Result<(), RemoteError> {
        let Some(mirror) = &self.mirror else {
            return Err(RemoteError::Offline);
        };
        let path = self.path(&user.id);
        mirror.save(&path, &json!(Self::marker(user, false))).await?;
        mirror.cancel_disconnect(&path).await?;
        debug!(user = %user.id, "Presence marked offline");
        Ok(())
    }

    /// Read one user's marker.
    pub async fn fetch(&self, user_id: &str) -> Result<Option<PresenceMarker>, RemoteError> {
        let Some(mirror) = &self.mirror else {
            return Err(RemoteError::Offline);
        };
        match mirror.fetch_once(&self.path(user_id)).await? {
            None => Ok(None),
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| RemoteError::Backend(format!("malformed presence marker: {e}"))),
        }
    }

    /// Liveness heuristic: seen within the stale window, regardless of the
    /// `online` flag.
    #[must_use]
    pub fn is_recently_active(&self, marker: &PresenceMarker) -> bool {
        let age_millis = Utc::now().timestamp_millis() - marker.last_seen;
        age_millis >= 0 && (age_millis as u128) <= self.stale_after.as_millis()
    }
}
