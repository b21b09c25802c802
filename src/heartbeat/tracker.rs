//! Heartbeat lease, recycled marker and resource mapping storage.
//!
//! All state goes through the [`CoordinationBackend`] so any manager
//! instance sharing the store observes the same leases.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::{Lease, ReapReason, RecycledMarker, SessionLifecycle};
use crate::backend::{CoordinationBackend, Keyspace, LockToken};
use crate::config::HeartbeatConfig;
use crate::{AppError, Result};

/// Reads and writes per-session liveness state.
pub struct HeartbeatTracker {
    backend: Arc<dyn CoordinationBackend>,
    keys: Keyspace,
    config: HeartbeatConfig,
}

fn require_id(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(AppError::InvalidInput(format!("{kind} is required")));
    }
    Ok(())
}

impl HeartbeatTracker {
    /// Create a tracker over `backend`.
    #[must_use]
    pub fn new(
        backend: Arc<dyn CoordinationBackend>,
        keys: Keyspace,
        config: HeartbeatConfig,
    ) -> Self {
        Self {
            backend,
            keys,
            config,
        }
    }

    /// Configured heartbeat timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.config.timeout()
    }

    /// Store TTL of a lease: the timeout plus retention, so a stale lease
    /// stays observable until it is reaped.
    fn lease_ttl(&self) -> Duration {
        self.config
            .timeout()
            .saturating_add(self.config.lease_retention())
    }

    /// Refresh the lease of `session_id` to now.
    ///
    /// Returns the recorded activity timestamp.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidInput` for an empty id, or
    /// `AppError::Backend` on store failure.
    pub async fn touch(&self, session_id: &str) -> Result<DateTime<Utc>> {
        self.touch_at(session_id, Utc::now()).await
    }

    /// Refresh the lease of `session_id` to activity at `at`.
    ///
    /// The recorded timestamp never moves backwards: if the existing lease
    /// is newer than `at` (clock regression), its timestamp is kept.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidInput` for an empty id, or
    /// `AppError::Backend` on store failure.
    pub async fn touch_at(&self, session_id: &str, at: DateTime<Utc>) -> Result<DateTime<Utc>> {
        require_id("session id", session_id)?;

        let last_active = match self.lease(session_id).await? {
            Some(previous) if previous.last_active > at => previous.last_active,
            _ => at,
        };
        let lease = Lease::new(last_active, self.timeout());
        let raw = serde_json::to_string(&lease)?;

        self.backend
            .set_state(&self.keys.heartbeat(session_id), &raw, self.lease_ttl())
            .await?;
        self.backend
            .index_add(&self.keys.session_index(), session_id)
            .await?;

        debug!(session_id, %last_active, "heartbeat refreshed");
        Ok(last_active)
    }

    /// Current lease of `session_id`, if any.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Backend` on store failure or `AppError::Codec`
    /// if the stored lease is malformed.
    pub async fn lease(&self, session_id: &str) -> Result<Option<Lease>> {
        let raw = self.backend.get_state(&self.keys.heartbeat(session_id)).await?;
        raw.map(|raw| serde_json::from_str(&raw).map_err(AppError::from))
            .transpose()
    }

    /// Last recorded activity of `session_id`, if it holds a lease.
    ///
    /// # Errors
    ///
    /// See [`lease`](Self::lease).
    pub async fn last_active(&self, session_id: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.lease(session_id).await?.map(|lease| lease.last_active))
    }

    /// Delete the lease of `session_id` and drop it from the lease index.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Backend` on store failure.
    pub async fn delete_lease(&self, session_id: &str) -> Result<()> {
        self.backend
            .delete_state(&self.keys.heartbeat(session_id))
            .await?;
        self.backend
            .index_remove(&self.keys.session_index(), session_id)
            .await
    }

    /// Drop `session_id` from the lease index if it holds no lease.
    ///
    /// Returns whether the entry was pruned.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Backend` on store failure.
    pub async fn prune_index(&self, session_id: &str) -> Result<bool> {
        let index = self.keys.session_index();
        self.backend.index_remove(&index, session_id).await?;
        // A touch may land between the caller's read and the removal.
        if self.lease(session_id).await?.is_some() {
            self.backend.index_add(&index, session_id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Sessions present in the lease index.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Backend` on store failure.
    pub async fn active_sessions(&self) -> Result<Vec<String>> {
        self.backend
            .index_members(&self.keys.session_index())
            .await
    }

    /// Set the recycled marker on `session_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidInput` for an empty id, or
    /// `AppError::Backend` on store failure.
    pub async fn mark_recycled(
        &self,
        session_id: &str,
        reason: ReapReason,
    ) -> Result<DateTime<Utc>> {
        require_id("session id", session_id)?;
        let marker = RecycledMarker {
            recycled_at: Utc::now(),
            reason,
        };
        let raw = serde_json::to_string(&marker)?;
        self.backend
            .set_state(
                &self.keys.recycled(session_id),
                &raw,
                self.config.recycled_ttl(),
            )
            .await?;
        Ok(marker.recycled_at)
    }

    /// Clear the recycled marker of `session_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Backend` on store failure.
    pub async fn clear_recycled(&self, session_id: &str) -> Result<()> {
        self.backend
            .delete_state(&self.keys.recycled(session_id))
            .await
    }

    /// Recycled marker of `session_id`, if set.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Backend` on store failure or `AppError::Codec`
    /// if the stored marker is malformed.
    pub async fn recycled_marker(&self, session_id: &str) -> Result<Option<RecycledMarker>> {
        let raw = self.backend.get_state(&self.keys.recycled(session_id)).await?;
        raw.map(|raw| serde_json::from_str(&raw).map_err(AppError::from))
            .transpose()
    }

    /// Whether `session_id` must recreate its resources before reuse.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Backend` on store failure.
    pub async fn needs_restore(&self, session_id: &str) -> Result<bool> {
        if session_id.is_empty() {
            return Ok(false);
        }
        let raw = self.backend.get_state(&self.keys.recycled(session_id)).await?;
        Ok(raw.is_some())
    }

    /// Give `identity` to `session_id`, taking it from any previous owner.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidInput` for empty ids, or
    /// `AppError::Backend` on store failure.
    pub async fn bind_resource(&self, session_id: &str, identity: &str) -> Result<()> {
        require_id("session id", session_id)?;
        require_id("resource identity", identity)?;

        if let Some(previous) = self.session_for_resource(identity).await? {
            if previous != session_id {
                warn!(identity, previous, session_id, "moving resource to new session");
                self.unbind_resource(identity).await?;
            }
        }
        self.backend
            .index_add(&self.keys.resource_owner(identity), session_id)
            .await?;
        self.backend
            .index_add(&self.keys.session_resources(session_id), identity)
            .await
    }

    /// Sever `identity` from whichever session owns it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Backend` on store failure.
    pub async fn unbind_resource(&self, identity: &str) -> Result<()> {
        let owner_key = self.keys.resource_owner(identity);
        for owner in self.backend.index_members(&owner_key).await? {
            self.backend
                .index_remove(&self.keys.session_resources(&owner), identity)
                .await?;
            self.backend.index_remove(&owner_key, &owner).await?;
        }
        Ok(())
    }

    /// Resource identities owned by `session_id`, sorted.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Backend` on store failure.
    pub async fn resources(&self, session_id: &str) -> Result<Vec<String>> {
        self.backend
            .index_members(&self.keys.session_resources(session_id))
            .await
    }

    /// Session owning `identity`, if any.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Backend` on store failure.
    pub async fn session_for_resource(&self, identity: &str) -> Result<Option<String>> {
        let owners = self
            .backend
            .index_members(&self.keys.resource_owner(identity))
            .await?;
        Ok(owners.into_iter().next())
    }

    /// Record a freshly (re)created session.
    ///
    /// Binds `identities`, writes a lease and clears the recycled marker.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidInput` for empty ids, or
    /// `AppError::Backend` on store failure.
    pub async fn register_session(
        &self,
        session_id: &str,
        identities: &[String],
    ) -> Result<DateTime<Utc>> {
        require_id("session id", session_id)?;
        for identity in identities {
            self.bind_resource(session_id, identity).await?;
        }
        let last_active = self.touch(session_id).await?;
        self.clear_recycled(session_id).await?;
        info!(session_id, resources = identities.len(), "session registered");
        Ok(last_active)
    }

    /// Reclaim `session_id` through `lifecycle`.
    ///
    /// Calls the release hook; if it accepts, sets the recycled marker,
    /// deletes the lease, removes the session from the lease index and
    /// severs its resource mapping. Returns whether the session was
    /// reclaimed.
    ///
    /// # Errors
    ///
    /// Returns the hook's error, or `AppError::Backend` on store failure.
    pub async fn reap(
        &self,
        session_id: &str,
        reason: ReapReason,
        lifecycle: &dyn SessionLifecycle,
    ) -> Result<bool> {
        require_id("session id", session_id)?;

        if !lifecycle.reap_session(session_id, reason).await? {
            info!(session_id, %reason, "session manager declined reap");
            return Ok(false);
        }

        let identities = self.resources(session_id).await?;
        self.mark_recycled(session_id, reason).await?;
        self.delete_lease(session_id).await?;
        for identity in &identities {
            self.unbind_resource(identity).await?;
        }

        info!(session_id, %reason, resources = identities.len(), "session reclaimed");
        Ok(true)
    }

    /// Try to take the reap lock of `session_id` for `ttl`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Backend` on store failure.
    pub async fn try_lock_session(
        &self,
        session_id: &str,
        ttl: Duration,
    ) -> Result<Option<LockToken>> {
        self.backend
            .try_lock(&self.keys.heartbeat_lock(session_id), ttl)
            .await
    }

    /// Release the reap lock of `session_id` if still held with `token`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Backend` on store failure.
    pub async fn unlock_session(&self, session_id: &str, token: &LockToken) -> Result<bool> {
        self.backend
            .unlock(&self.keys.heartbeat_lock(session_id), token)
            .await
    }
}
