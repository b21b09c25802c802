//! Session heartbeat leases and idle-session reaping.
//!
//! Every session-touching call refreshes a [`Lease`] through the
//! [`TouchSession`] middleware. The [`Reaper`] periodically scans the lease
//! index and reclaims sessions idle past the heartbeat timeout, arbitrating
//! between manager instances with a per-session lock. A reclaimed session
//! carries a [`RecycledMarker`] until it is registered again.

pub mod reaper;
pub mod touch;
pub mod tracker;

use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;

pub use reaper::{Reaper, ScanReport};
pub use touch::TouchSession;
pub use tracker::HeartbeatTracker;

/// Boxed future returned by [`SessionLifecycle`] hooks.
pub type LifecycleFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Liveness record for a session.
///
/// `deadline` is always `last_active + timeout` for the timeout in force
/// when the lease was written.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Lease {
    /// Most recent activity.
    pub last_active: DateTime<Utc>,
    /// Time after which the lease is stale.
    pub deadline: DateTime<Utc>,
}

impl Lease {
    /// Build a lease for activity at `last_active`.
    #[must_use]
    pub fn new(last_active: DateTime<Utc>, timeout: Duration) -> Self {
        let timeout =
            chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let deadline = last_active
            .checked_add_signed(timeout)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            last_active,
            deadline,
        }
    }

    /// Whether more than `timeout` has elapsed since `last_active` at `now`.
    #[must_use]
    pub fn is_stale_at(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        let idle = now.signed_duration_since(self.last_active);
        idle.to_std().is_ok_and(|idle| idle > timeout)
    }
}

/// Why a session's resources were reclaimed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReapReason {
    /// The reaper found the lease idle past the timeout.
    HeartbeatTimeout,
    /// The owning manager released the session on request.
    ExplicitRelease,
}

impl ReapReason {
    /// Stable string form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::ExplicitRelease => "explicit_release",
        }
    }
}

impl Display for ReapReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tombstone left on a session whose resources were reclaimed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RecycledMarker {
    /// When the session was reclaimed.
    pub recycled_at: DateTime<Utc>,
    /// Why it was reclaimed.
    pub reason: ReapReason,
}

/// Hooks the owning session manager supplies.
///
/// The reaper calls [`reap_session`](Self::reap_session) once it holds the
/// session's reap lock; the [`TouchSession`] middleware calls
/// [`restore_session`](Self::restore_session) when a touched session
/// carries a recycled marker.
pub trait SessionLifecycle: Send + Sync {
    /// Release the resources backing `session_id`.
    ///
    /// Return `false` to decline; the session then keeps its lease and
    /// no recycled marker is written.
    ///
    /// # Errors
    ///
    /// Any error aborts this reap attempt; the lease is left in place.
    fn reap_session(&self, session_id: &str, reason: ReapReason) -> LifecycleFuture<'_, bool>;

    /// Recreate the resources of a recycled session before it is used.
    ///
    /// Implementations re-register the session, which clears the marker.
    /// The default does nothing.
    ///
    /// # Errors
    ///
    /// Errors are logged by the caller and never fail the wrapped call.
    fn restore_session(&self, session_id: &str) -> LifecycleFuture<'_, ()> {
        let _ = session_id;
        Box::pin(async { Ok(()) })
    }
}
