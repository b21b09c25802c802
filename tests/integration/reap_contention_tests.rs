//! Integration tests for reap arbitration between reapers sharing a store.
//!
//! Two reapers over one backend stand in for two manager instances.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};

use session_sentinel::backend::{
    BackendFuture, CoordinationBackend, Keyspace, LocalBackend, LockToken, Subscription,
};
use session_sentinel::heartbeat::{HeartbeatTracker, Lease, Reaper};

use super::test_helpers::{test_config, RecordingLifecycle};

fn tracker_over(backend: Arc<dyn CoordinationBackend>) -> Arc<HeartbeatTracker> {
    Arc::new(HeartbeatTracker::new(
        backend,
        Keyspace::default(),
        test_config(0.0).heartbeat,
    ))
}

fn reaper_over(tracker: Arc<HeartbeatTracker>, lifecycle: Arc<RecordingLifecycle>) -> Reaper {
    Reaper::new(tracker, lifecycle, &test_config(0.0).heartbeat)
}

#[tokio::test]
async fn racing_reapers_invoke_callback_once() {
    let backend: Arc<dyn CoordinationBackend> = Arc::new(LocalBackend::new());
    let tracker = tracker_over(Arc::clone(&backend));
    tracker
        .touch_at("s1", Utc::now() - TimeDelta::seconds(30))
        .await
        .expect("touch");

    // The slow release keeps the first reaper inside its lock while the
    // second one arrives.
    let lifecycle = Arc::new(RecordingLifecycle::slow(Duration::from_millis(200)));
    let first = reaper_over(tracker_over(Arc::clone(&backend)), lifecycle.clone());
    let second = reaper_over(tracker_over(Arc::clone(&backend)), lifecycle.clone());

    let (a, b) = tokio::join!(first.scan_once(), second.scan_once());
    let a = a.expect("scan");
    let b = b.expect("scan");

    assert_eq!(lifecycle.reap_count(), 1);
    assert_eq!(a.reaped + b.reaped, 1);
    assert_eq!(
        a.skipped_locked + b.skipped_locked + a.skipped_absent + b.skipped_absent,
        1,
        "the losing reaper must skip: {a:?} / {b:?}"
    );
    assert!(tracker.needs_restore("s1").await.expect("read"));
}

#[tokio::test]
async fn racing_reapers_across_many_sessions() {
    let backend: Arc<dyn CoordinationBackend> = Arc::new(LocalBackend::new());
    let tracker = tracker_over(Arc::clone(&backend));
    for n in 0..10 {
        tracker
            .touch_at(&format!("s{n}"), Utc::now() - TimeDelta::seconds(30))
            .await
            .expect("touch");
    }
    let lifecycle = Arc::new(RecordingLifecycle::slow(Duration::from_millis(5)));
    let first = reaper_over(tracker_over(Arc::clone(&backend)), lifecycle.clone());
    let second = reaper_over(tracker_over(Arc::clone(&backend)), lifecycle.clone());

    let (a, b) = tokio::join!(first.scan_once(), second.scan_once());
    let a = a.expect("scan");
    let b = b.expect("scan");

    assert_eq!(lifecycle.reap_count(), 10);
    assert_eq!(a.reaped + b.reaped, 10);
    let mut reaped: Vec<String> = lifecycle.reaped().into_iter().map(|(id, _)| id).collect();
    reaped.sort();
    reaped.dedup();
    assert_eq!(reaped.len(), 10, "no session may be reaped twice");
}

/// Backend that records activity on a session just before its reap lock
/// is granted, reproducing a touch racing the reaper.
struct RefreshOnLock {
    inner: LocalBackend,
    refreshed: AtomicUsize,
}

impl CoordinationBackend for RefreshOnLock {
    fn set_state(&self, key: &str, value: &str, ttl: Duration) -> BackendFuture<'_, ()> {
        self.inner.set_state(key, value, ttl)
    }

    fn set_state_unless(
        &self,
        key: &str,
        current: &str,
        value: &str,
        ttl: Duration,
    ) -> BackendFuture<'_, bool> {
        self.inner.set_state_unless(key, current, value, ttl)
    }

    fn get_state(&self, key: &str) -> BackendFuture<'_, Option<String>> {
        self.inner.get_state(key)
    }

    fn delete_state(&self, key: &str) -> BackendFuture<'_, ()> {
        self.inner.delete_state(key)
    }

    fn publish(&self, channel: &str, message: &str) -> BackendFuture<'_, ()> {
        self.inner.publish(channel, message)
    }

    fn subscribe(&self, channel: &str) -> BackendFuture<'_, Subscription> {
        self.inner.subscribe(channel)
    }

    fn try_lock(&self, key: &str, ttl: Duration) -> BackendFuture<'_, Option<LockToken>> {
        let key = key.to_owned();
        Box::pin(async move {
            if let Some(session_id) = key.strip_prefix("sentinel:heartbeat_lock:") {
                let lease = Lease::new(Utc::now(), Duration::from_secs(1));
                let raw = serde_json::to_string(&lease)?;
                self.inner
                    .set_state(
                        &Keyspace::default().heartbeat(session_id),
                        &raw,
                        Duration::from_secs(60),
                    )
                    .await?;
                self.refreshed.fetch_add(1, Ordering::SeqCst);
            }
            self.inner.try_lock(&key, ttl).await
        })
    }

    fn unlock(&self, key: &str, token: &LockToken) -> BackendFuture<'_, bool> {
        self.inner.unlock(key, token)
    }

    fn index_add(&self, index: &str, member: &str) -> BackendFuture<'_, ()> {
        self.inner.index_add(index, member)
    }

    fn index_remove(&self, index: &str, member: &str) -> BackendFuture<'_, ()> {
        self.inner.index_remove(index, member)
    }

    fn index_members(&self, index: &str) -> BackendFuture<'_, Vec<String>> {
        self.inner.index_members(index)
    }

    fn close(&self) -> BackendFuture<'_, ()> {
        self.inner.close()
    }
}

#[tokio::test]
async fn session_refreshed_while_locking_is_not_reaped() {
    let backend = Arc::new(RefreshOnLock {
        inner: LocalBackend::new(),
        refreshed: AtomicUsize::new(0),
    });
    let tracker = tracker_over(backend.clone());
    tracker
        .touch_at("s1", Utc::now() - TimeDelta::seconds(30))
        .await
        .expect("touch");
    let lifecycle = Arc::new(RecordingLifecycle::default());
    let reaper = reaper_over(Arc::clone(&tracker), lifecycle.clone());

    let report = reaper.scan_once().await.expect("scan");

    assert_eq!(backend.refreshed.load(Ordering::SeqCst), 1);
    assert_eq!(report.skipped_fresh, 1);
    assert_eq!(report.reaped, 0);
    assert_eq!(lifecycle.reap_count(), 0);
    assert!(!tracker.needs_restore("s1").await.expect("read"));

    // The lock taken for the re-check was released.
    assert!(backend
        .inner
        .try_lock("sentinel:heartbeat_lock:s1", Duration::from_secs(1))
        .await
        .expect("lock")
        .is_some());
}

#[tokio::test]
async fn crashed_reaper_lock_expires() {
    let backend: Arc<dyn CoordinationBackend> = Arc::new(LocalBackend::new());
    let tracker = tracker_over(Arc::clone(&backend));
    tracker
        .touch_at("s1", Utc::now() - TimeDelta::seconds(30))
        .await
        .expect("touch");

    // A lock left behind by an instance that died mid-reap.
    let _orphan = tracker
        .try_lock_session("s1", Duration::from_millis(100))
        .await
        .expect("lock")
        .expect("acquired");
    let lifecycle = Arc::new(RecordingLifecycle::default());
    let reaper = reaper_over(Arc::clone(&tracker), lifecycle.clone());

    assert_eq!(reaper.scan_once().await.expect("scan").skipped_locked, 1);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(reaper.scan_once().await.expect("scan").reaped, 1);
    assert_eq!(lifecycle.reap_count(), 1);
}
