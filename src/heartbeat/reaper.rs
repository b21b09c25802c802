//! Idle-session reaper and its background watcher.
//!
//! Each scan walks the lease index. A stale lease is only reclaimed after
//! the per-session reap lock is acquired and the lease is re-read under
//! it, so concurrent reapers (in this process or other instances sharing
//! the store) reclaim a session at most once, and a session refreshed
//! while the lock was being acquired is left alone.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::{HeartbeatTracker, ReapReason, SessionLifecycle};
use crate::config::HeartbeatConfig;
use crate::Result;

/// Per-scan counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Sessions looked at.
    pub examined: usize,
    /// Sessions reclaimed by this scan.
    pub reaped: usize,
    /// Sessions whose lease was still fresh (including after the re-check).
    pub skipped_fresh: usize,
    /// Sessions whose reap lock was held elsewhere.
    pub skipped_locked: usize,
    /// Sessions with no lease left.
    pub skipped_absent: usize,
    /// Sessions the manager declined to release.
    pub declined: usize,
    /// Sessions whose reap attempt failed.
    pub failed: usize,
}

enum Decision {
    Reaped,
    Fresh,
    Locked,
    Absent,
    Declined,
}

struct ReaperCore {
    tracker: Arc<HeartbeatTracker>,
    lifecycle: Arc<dyn SessionLifecycle>,
    lock_ttl: Duration,
}

struct WatcherHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// Scans leases and reclaims idle sessions.
pub struct Reaper {
    core: Arc<ReaperCore>,
    scan_interval: Option<Duration>,
    watcher: Mutex<Option<WatcherHandle>>,
}

impl Reaper {
    /// Create a reaper calling back into `lifecycle`.
    #[must_use]
    pub fn new(
        tracker: Arc<HeartbeatTracker>,
        lifecycle: Arc<dyn SessionLifecycle>,
        config: &HeartbeatConfig,
    ) -> Self {
        Self {
            core: Arc::new(ReaperCore {
                tracker,
                lifecycle,
                lock_ttl: config.lock_ttl(),
            }),
            scan_interval: config.scan_interval(),
            watcher: Mutex::new(None),
        }
    }

    /// TTL of the per-session reap lock.
    #[must_use]
    pub fn lock_ttl(&self) -> Duration {
        self.core.lock_ttl
    }

    /// Run one scan pass now.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Backend` if the lease index cannot be read.
    /// Failures on individual sessions are counted in
    /// [`ScanReport::failed`] instead.
    pub async fn scan_once(&self) -> Result<ScanReport> {
        self.core.scan(&CancellationToken::new()).await
    }

    /// Start the background watcher.
    ///
    /// Returns `false` when the watcher is disabled (scan interval 0) or
    /// already running. Must be called from within a Tokio runtime.
    pub fn start_watcher(&self) -> bool {
        let Some(interval) = self.scan_interval else {
            info!("heartbeat watcher disabled");
            return false;
        };

        let mut slot = self.watcher.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|w| !w.join.is_finished()) {
            debug!("heartbeat watcher already running");
            return false;
        }

        let cancel = CancellationToken::new();
        let join = tokio::spawn(
            run_watcher(Arc::clone(&self.core), interval, cancel.clone())
                .instrument(info_span!("heartbeat_watcher")),
        );
        *slot = Some(WatcherHandle { cancel, join });
        info!(?interval, "heartbeat watcher started");
        true
    }

    /// Stop the background watcher and wait for it to exit.
    ///
    /// A scan in progress finishes the session it is on (releasing that
    /// session's lock) and skips the rest. Returns whether a watcher was
    /// running.
    pub async fn stop_watcher(&self) -> bool {
        let handle = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return false;
        };

        handle.cancel.cancel();
        if let Err(err) = handle.join.await {
            warn!(%err, "heartbeat watcher ended abnormally");
        }
        info!("heartbeat watcher stopped");
        true
    }

    /// Whether the background watcher is running.
    #[must_use]
    pub fn is_watching(&self) -> bool {
        self.watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|w| !w.join.is_finished())
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        let slot = self.watcher.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = slot.take() {
            handle.cancel.cancel();
        }
    }
}

async fn run_watcher(core: Arc<ReaperCore>, interval: Duration, cancel: CancellationToken) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                info!("heartbeat watcher shutting down");
                break;
            }
            () = tokio::time::sleep(interval) => {}
        }

        match core.scan(&cancel).await {
            Ok(report) if report.reaped > 0 || report.failed > 0 => {
                info!(?report, "heartbeat scan completed");
            }
            Ok(report) => debug!(?report, "heartbeat scan completed"),
            Err(err) => error!(%err, "heartbeat scan failed"),
        }
    }
}

impl ReaperCore {
    async fn scan(&self, cancel: &CancellationToken) -> Result<ScanReport> {
        let mut report = ScanReport::default();

        for session_id in self.tracker.active_sessions().await? {
            if cancel.is_cancelled() {
                break;
            }
            report.examined += 1;
            match self.reap_if_stale(&session_id).await {
                Ok(Decision::Reaped) => report.reaped += 1,
                Ok(Decision::Fresh) => report.skipped_fresh += 1,
                Ok(Decision::Locked) => report.skipped_locked += 1,
                Ok(Decision::Absent) => report.skipped_absent += 1,
                Ok(Decision::Declined) => report.declined += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(session_id, %err, "reap attempt failed");
                }
            }
        }

        Ok(report)
    }

    async fn reap_if_stale(&self, session_id: &str) -> Result<Decision> {
        // An absent lease also goes through the lock so its index entry is
        // pruned without racing a concurrent re-registration.
        if let Some(lease) = self.tracker.lease(session_id).await? {
            if !lease.is_stale_at(Utc::now(), self.tracker.timeout()) {
                return Ok(Decision::Fresh);
            }
        }

        let acquired = tokio::time::timeout(
            self.lock_ttl,
            self.tracker.try_lock_session(session_id, self.lock_ttl),
        )
        .await;
        let token = match acquired {
            Ok(token) => token?,
            Err(_) => {
                debug!(session_id, "reap lock acquisition timed out");
                return Ok(Decision::Locked);
            }
        };
        let Some(token) = token else {
            debug!(session_id, "reap lock held by another reaper");
            return Ok(Decision::Locked);
        };

        let decision = self.reap_locked(session_id).await;

        match self.tracker.unlock_session(session_id, &token).await {
            Ok(true) => {}
            Ok(false) => debug!(session_id, "reap lock expired before release"),
            Err(err) => warn!(session_id, %err, "failed to release reap lock"),
        }

        decision
    }

    async fn reap_locked(&self, session_id: &str) -> Result<Decision> {
        // Time passed while acquiring the lock; the session may have been
        // reaped elsewhere or touched again.
        let Some(lease) = self.tracker.lease(session_id).await? else {
            if self.tracker.prune_index(session_id).await? {
                debug!(session_id, "pruned indexed session without lease");
                return Ok(Decision::Absent);
            }
            return Ok(Decision::Fresh);
        };
        if !lease.is_stale_at(Utc::now(), self.tracker.timeout()) {
            debug!(session_id, "session refreshed while acquiring reap lock");
            return Ok(Decision::Fresh);
        }

        let reaped = self
            .tracker
            .reap(session_id, ReapReason::HeartbeatTimeout, &*self.lifecycle)
            .await?;
        Ok(if reaped {
            Decision::Reaped
        } else {
            Decision::Declined
        })
    }
}
