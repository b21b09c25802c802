//! Auto-touch middleware for session-using calls.
//!
//! Wrap any operation that implies "this session is alive" in
//! [`TouchSession::call`] (or [`TouchSession::call_for_resource`] when the
//! caller only knows a resource identity). The lease is refreshed on entry,
//! before the wrapped operation runs. Refresh failures are logged and
//! never fail the wrapped call.
//!
//! A recycled session is never re-leased by a touch: it goes to the
//! restore hook instead, and only
//! [`HeartbeatTracker::register_session`] leases it again.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::{HeartbeatTracker, SessionLifecycle};
use crate::Result;

/// Lease-refreshing wrapper around session operations.
#[derive(Clone)]
pub struct TouchSession {
    tracker: Arc<HeartbeatTracker>,
    lifecycle: Option<Arc<dyn SessionLifecycle>>,
}

impl TouchSession {
    /// Wrapper that only refreshes leases.
    #[must_use]
    pub fn new(tracker: Arc<HeartbeatTracker>) -> Self {
        Self {
            tracker,
            lifecycle: None,
        }
    }

    /// Also run `lifecycle`'s restore hook for recycled sessions.
    #[must_use]
    pub fn with_lifecycle(mut self, lifecycle: Arc<dyn SessionLifecycle>) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    /// Refresh `session_id`, then run `op`.
    pub async fn call<F, Fut>(&self, session_id: &str, op: F) -> Fut::Output
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        self.refresh(session_id).await;
        op().await
    }

    /// Resolve the session owning `identity`, refresh it, then run `op`.
    ///
    /// Unknown identities run `op` without touching anything.
    pub async fn call_for_resource<F, Fut>(&self, identity: &str, op: F) -> Fut::Output
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        match self.tracker.session_for_resource(identity).await {
            Ok(Some(session_id)) => self.refresh(&session_id).await,
            Ok(None) => debug!(identity, "no session owns resource; touch skipped"),
            Err(err) => debug!(identity, %err, "session lookup failed (ignored)"),
        }
        op().await
    }

    /// Refresh the lease of `session_id` unless it was recycled.
    ///
    /// Returns the recorded activity, or `None` for a recycled session,
    /// which is handed to the restore hook (if any) without a lease write.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidInput` for an empty id, the restore
    /// hook's error, or `AppError::Backend` on store failure.
    pub async fn refresh_lease(&self, session_id: &str) -> Result<Option<DateTime<Utc>>> {
        if self.tracker.needs_restore(session_id).await? {
            match &self.lifecycle {
                Some(lifecycle) => {
                    debug!(session_id, "restoring recycled session");
                    lifecycle.restore_session(session_id).await?;
                }
                None => debug!(session_id, "recycled session left unleased"),
            }
            return Ok(None);
        }
        self.tracker.touch(session_id).await.map(Some)
    }

    async fn refresh(&self, session_id: &str) {
        if let Err(err) = self.refresh_lease(session_id).await {
            debug!(session_id, %err, "touch_session failed (ignored)");
        }
    }
}
