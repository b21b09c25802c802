//! Owning-manager facade over the task controller and heartbeat reaper.
//!
//! A [`SessionSentinel`] is what a session manager embeds: one coordination
//! backend, one [`TaskController`], one [`HeartbeatTracker`] and the
//! [`Reaper`] watcher whose lifecycle is scoped to this instance.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{self, CoordinationBackend, Keyspace};
use crate::config::SentinelConfig;
use crate::heartbeat::{
    HeartbeatTracker, ReapReason, Reaper, ScanReport, SessionLifecycle, TouchSession,
};
use crate::interrupt::{task_key, TaskController, TaskState, TaskStream};
use crate::Result;

/// Session control plane for one manager instance.
pub struct SessionSentinel {
    backend: Arc<dyn CoordinationBackend>,
    tasks: TaskController,
    tracker: Arc<HeartbeatTracker>,
    reaper: Reaper,
    toucher: TouchSession,
    lifecycle: Arc<dyn SessionLifecycle>,
}

impl SessionSentinel {
    /// Validate `config`, connect its backend and assemble the sentinel.
    ///
    /// The watcher is not started; call [`start_watcher`](Self::start_watcher).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for an invalid configuration or
    /// `AppError::Backend` if the backend cannot be reached.
    pub async fn connect(
        config: &SentinelConfig,
        lifecycle: Arc<dyn SessionLifecycle>,
    ) -> Result<Self> {
        config.validate()?;
        let backend = backend::connect(&config.backend).await?;
        Ok(Self::with_backend(config, backend, lifecycle))
    }

    /// Assemble a sentinel over an existing backend.
    #[must_use]
    pub fn with_backend(
        config: &SentinelConfig,
        backend: Arc<dyn CoordinationBackend>,
        lifecycle: Arc<dyn SessionLifecycle>,
    ) -> Self {
        let keys = Keyspace::new(config.backend.namespace.clone());
        let tasks = TaskController::new(Arc::clone(&backend), keys.clone(), config.tasks.clone());
        let tracker = Arc::new(HeartbeatTracker::new(
            Arc::clone(&backend),
            keys,
            config.heartbeat.clone(),
        ));
        let reaper = Reaper::new(
            Arc::clone(&tracker),
            Arc::clone(&lifecycle),
            &config.heartbeat,
        );
        let toucher = TouchSession::new(Arc::clone(&tracker)).with_lifecycle(Arc::clone(&lifecycle));

        Self {
            backend,
            tasks,
            tracker,
            reaper,
            toucher,
            lifecycle,
        }
    }

    /// Task execution controller.
    #[must_use]
    pub fn tasks(&self) -> &TaskController {
        &self.tasks
    }

    /// Lease storage.
    #[must_use]
    pub fn tracker(&self) -> &Arc<HeartbeatTracker> {
        &self.tracker
    }

    /// Idle-session reaper.
    #[must_use]
    pub fn reaper(&self) -> &Reaper {
        &self.reaper
    }

    /// Auto-touch middleware bound to this sentinel's lifecycle hooks.
    #[must_use]
    pub fn toucher(&self) -> &TouchSession {
        &self.toucher
    }

    /// Underlying coordination backend.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn CoordinationBackend> {
        &self.backend
    }

    /// Run `producer` as the `(user_id, session_id)` task.
    ///
    /// # Errors
    ///
    /// See [`TaskController::run_and_stream`].
    pub async fn run_and_stream<T, P, S>(
        &self,
        user_id: &str,
        session_id: &str,
        producer: P,
    ) -> Result<TaskStream<T>>
    where
        T: Send + 'static,
        P: FnOnce(CancellationToken) -> S,
        S: Stream<Item = Result<T>> + Send + 'static,
    {
        self.tasks.run_and_stream(user_id, session_id, producer).await
    }

    /// Broadcast `STOP` to the `(user_id, session_id)` task.
    ///
    /// # Errors
    ///
    /// See [`TaskController::stop_chat`].
    pub async fn stop_chat(&self, user_id: &str, session_id: &str) -> Result<()> {
        self.tasks.stop_chat(user_id, session_id).await
    }

    /// State of the `(user_id, session_id)` task.
    ///
    /// # Errors
    ///
    /// See [`TaskController::get_task_state`].
    pub async fn get_task_state(&self, user_id: &str, session_id: &str) -> Result<TaskState> {
        self.tasks
            .get_task_state(&task_key(user_id, session_id))
            .await
    }

    /// Refresh the lease of `session_id`.
    ///
    /// Returns `None` without writing a lease when the session was
    /// recycled; the restore hook runs instead.
    ///
    /// # Errors
    ///
    /// See [`TouchSession::refresh_lease`].
    pub async fn touch(&self, session_id: &str) -> Result<Option<DateTime<Utc>>> {
        self.toucher.refresh_lease(session_id).await
    }

    /// Refresh `session_id` (restoring it if recycled), then run `op`.
    pub async fn touch_session<F, Fut>(&self, session_id: &str, op: F) -> Fut::Output
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        self.toucher.call(session_id, op).await
    }

    /// Whether `session_id` was reclaimed and must be recreated.
    ///
    /// # Errors
    ///
    /// See [`HeartbeatTracker::needs_restore`].
    pub async fn needs_restore(&self, session_id: &str) -> Result<bool> {
        self.tracker.needs_restore(session_id).await
    }

    /// Record a freshly created session and its resources.
    ///
    /// # Errors
    ///
    /// See [`HeartbeatTracker::register_session`].
    pub async fn register_session(
        &self,
        session_id: &str,
        identities: &[String],
    ) -> Result<DateTime<Utc>> {
        self.tracker.register_session(session_id, identities).await
    }

    /// Release `session_id` now, under its reap lock.
    ///
    /// Returns `false` if another instance holds the lock or the lifecycle
    /// declined.
    ///
    /// # Errors
    ///
    /// Returns the lifecycle's error or `AppError::Backend`.
    pub async fn release_session(&self, session_id: &str) -> Result<bool> {
        let lock_ttl = self.reaper.lock_ttl();
        let Some(token) = self.tracker.try_lock_session(session_id, lock_ttl).await? else {
            return Ok(false);
        };
        let released = self
            .tracker
            .reap(session_id, ReapReason::ExplicitRelease, &*self.lifecycle)
            .await;
        match self.tracker.unlock_session(session_id, &token).await {
            Ok(true) => {}
            Ok(false) => debug!(session_id, "release lock expired before unlock"),
            Err(err) => warn!(session_id, %err, "failed to release reap lock"),
        }
        released
    }

    /// Run one reaper scan now.
    ///
    /// # Errors
    ///
    /// See [`Reaper::scan_once`].
    pub async fn scan_once(&self) -> Result<ScanReport> {
        self.reaper.scan_once().await
    }

    /// Start the background watcher. Returns `false` if disabled or running.
    pub fn start_watcher(&self) -> bool {
        self.reaper.start_watcher()
    }

    /// Stop the background watcher. Returns whether it was running.
    pub async fn stop_watcher(&self) -> bool {
        self.reaper.stop_watcher().await
    }

    /// Stop the watcher and close the backend.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Backend` if the backend fails to close.
    pub async fn close(&self) -> Result<()> {
        self.reaper.stop_watcher().await;
        self.backend.close().await?;
        info!("session sentinel closed");
        Ok(())
    }
}
