//! Unit tests for heartbeat leases, recycled markers and the resource map.

use std::time::Duration;

use chrono::{TimeDelta, Utc};

use session_sentinel::backend::CoordinationBackend;
use session_sentinel::heartbeat::{Lease, ReapReason, RecycledMarker};
use session_sentinel::AppError;

use super::test_helpers::{local_tracker, short_heartbeat, RecordingLifecycle};

#[test]
fn lease_deadline_is_last_active_plus_timeout() {
    let now = Utc::now();
    let lease = Lease::new(now, Duration::from_secs(90));
    assert_eq!(lease.last_active, now);
    assert_eq!(lease.deadline, now + TimeDelta::seconds(90));
}

#[test]
fn lease_is_stale_only_past_timeout() {
    let timeout = Duration::from_secs(1);
    let start = Utc::now();
    let lease = Lease::new(start, timeout);

    assert!(!lease.is_stale_at(start, timeout));
    assert!(!lease.is_stale_at(start + TimeDelta::seconds(1), timeout));
    assert!(lease.is_stale_at(start + TimeDelta::milliseconds(1001), timeout));
    // A clock that went backwards never makes a lease stale.
    assert!(!lease.is_stale_at(start - TimeDelta::seconds(30), timeout));
}

#[test]
fn recycled_marker_serializes_reason_in_snake_case() {
    let marker = RecycledMarker {
        recycled_at: Utc::now(),
        reason: ReapReason::HeartbeatTimeout,
    };
    let value = serde_json::to_value(marker).expect("serialize");
    assert_eq!(value["reason"], "heartbeat_timeout");
    assert_eq!(ReapReason::ExplicitRelease.to_string(), "explicit_release");
}

#[tokio::test]
async fn touch_writes_lease_and_indexes_session() {
    let (_, tracker) = local_tracker(short_heartbeat());

    let recorded = tracker.touch("s1").await.expect("touch");
    let lease = tracker.lease("s1").await.expect("lease").expect("present");

    assert_eq!(lease.last_active, recorded);
    assert_eq!(lease.deadline, recorded + TimeDelta::seconds(1));
    assert_eq!(tracker.active_sessions().await.expect("index"), vec!["s1"]);
    assert_eq!(tracker.last_active("s1").await.expect("read"), Some(recorded));
}

#[tokio::test]
async fn touch_never_moves_timestamp_backwards() {
    let (_, tracker) = local_tracker(short_heartbeat());
    let base = Utc::now();

    let first = tracker.touch_at("s1", base).await.expect("touch");
    let regressed = tracker
        .touch_at("s1", base - TimeDelta::seconds(60))
        .await
        .expect("touch");
    let later = tracker
        .touch_at("s1", base + TimeDelta::seconds(5))
        .await
        .expect("touch");

    assert_eq!(first, base);
    assert_eq!(regressed, base, "regressed clock must keep previous timestamp");
    assert_eq!(later, base + TimeDelta::seconds(5));
}

#[tokio::test]
async fn repeated_touches_are_monotonic() {
    let (_, tracker) = local_tracker(short_heartbeat());
    let mut previous = tracker.touch("s1").await.expect("touch");
    for _ in 0..20 {
        let next = tracker.touch("s1").await.expect("touch");
        assert!(next >= previous, "{next} < {previous}");
        previous = next;
    }
}

#[tokio::test]
async fn touch_rejects_empty_session_id() {
    let (_, tracker) = local_tracker(short_heartbeat());
    let err = tracker.touch("").await.expect_err("empty id");
    assert!(matches!(err, AppError::InvalidInput(_)));
    assert!(tracker.active_sessions().await.expect("index").is_empty());
}

#[tokio::test]
async fn malformed_lease_is_codec_error() {
    let (local, tracker) = local_tracker(short_heartbeat());
    local
        .set_state("sentinel:heartbeat:s1", "not json", Duration::from_secs(60))
        .await
        .expect("set");

    let err = tracker.lease("s1").await.expect_err("malformed");
    assert!(matches!(err, AppError::Codec(_)));
}

#[tokio::test]
async fn recycled_marker_drives_needs_restore() {
    let (_, tracker) = local_tracker(short_heartbeat());
    assert!(!tracker.needs_restore("s1").await.expect("read"));
    assert!(!tracker.needs_restore("").await.expect("read"));

    tracker
        .mark_recycled("s1", ReapReason::HeartbeatTimeout)
        .await
        .expect("mark");
    assert!(tracker.needs_restore("s1").await.expect("read"));
    let marker = tracker
        .recycled_marker("s1")
        .await
        .expect("read")
        .expect("present");
    assert_eq!(marker.reason, ReapReason::HeartbeatTimeout);

    tracker.clear_recycled("s1").await.expect("clear");
    assert!(!tracker.needs_restore("s1").await.expect("read"));
}

#[tokio::test]
async fn register_session_binds_resources_and_clears_marker() {
    let (_, tracker) = local_tracker(short_heartbeat());
    tracker
        .mark_recycled("s1", ReapReason::HeartbeatTimeout)
        .await
        .expect("mark");

    let identities = vec!["box-b".to_owned(), "box-a".to_owned()];
    tracker
        .register_session("s1", &identities)
        .await
        .expect("register");

    assert!(!tracker.needs_restore("s1").await.expect("read"));
    assert!(tracker.lease("s1").await.expect("lease").is_some());
    assert_eq!(
        tracker.resources("s1").await.expect("resources"),
        vec!["box-a", "box-b"]
    );
    assert_eq!(
        tracker.session_for_resource("box-a").await.expect("owner").as_deref(),
        Some("s1")
    );
}

#[tokio::test]
async fn binding_moves_resource_between_sessions() {
    let (_, tracker) = local_tracker(short_heartbeat());
    tracker.bind_resource("s1", "box").await.expect("bind");
    tracker.bind_resource("s2", "box").await.expect("rebind");

    assert!(tracker.resources("s1").await.expect("resources").is_empty());
    assert_eq!(tracker.resources("s2").await.expect("resources"), vec!["box"]);
    assert_eq!(
        tracker.session_for_resource("box").await.expect("owner").as_deref(),
        Some("s2")
    );

    tracker.unbind_resource("box").await.expect("unbind");
    assert_eq!(tracker.session_for_resource("box").await.expect("owner"), None);
}

#[tokio::test]
async fn reap_releases_and_tombstones_session() {
    let (_, tracker) = local_tracker(short_heartbeat());
    tracker
        .register_session("s1", &["box".to_owned()])
        .await
        .expect("register");
    let lifecycle = RecordingLifecycle::default();

    let reaped = tracker
        .reap("s1", ReapReason::ExplicitRelease, &lifecycle)
        .await
        .expect("reap");

    assert!(reaped);
    assert_eq!(
        lifecycle.reaped(),
        vec![("s1".to_owned(), ReapReason::ExplicitRelease)]
    );
    assert!(tracker.lease("s1").await.expect("lease").is_none());
    assert!(tracker.active_sessions().await.expect("index").is_empty());
    assert!(tracker.needs_restore("s1").await.expect("read"));
    assert!(tracker.resources("s1").await.expect("resources").is_empty());
    assert_eq!(tracker.session_for_resource("box").await.expect("owner"), None);
}

#[tokio::test]
async fn declined_reap_leaves_session_alone() {
    let (_, tracker) = local_tracker(short_heartbeat());
    tracker.register_session("s1", &[]).await.expect("register");
    let lifecycle = RecordingLifecycle::declining();

    let reaped = tracker
        .reap("s1", ReapReason::HeartbeatTimeout, &lifecycle)
        .await
        .expect("reap");

    assert!(!reaped);
    assert_eq!(lifecycle.reaped().len(), 1);
    assert!(tracker.lease("s1").await.expect("lease").is_some());
    assert!(!tracker.needs_restore("s1").await.expect("read"));
}

#[tokio::test]
async fn failed_reap_propagates_and_keeps_lease() {
    let (_, tracker) = local_tracker(short_heartbeat());
    tracker.register_session("s1", &[]).await.expect("register");
    let lifecycle = RecordingLifecycle::failing();

    let err = tracker
        .reap("s1", ReapReason::HeartbeatTimeout, &lifecycle)
        .await
        .expect_err("hook failure");

    assert!(matches!(err, AppError::Backend(_)));
    assert!(tracker.lease("s1").await.expect("lease").is_some());
    assert!(!tracker.needs_restore("s1").await.expect("read"));
}

#[tokio::test]
async fn session_lock_is_exclusive() {
    let (_, tracker) = local_tracker(short_heartbeat());
    let ttl = Duration::from_secs(5);

    let token = tracker
        .try_lock_session("s1", ttl)
        .await
        .expect("lock")
        .expect("acquired");
    assert!(tracker.try_lock_session("s1", ttl).await.expect("lock").is_none());
    assert!(tracker.try_lock_session("s2", ttl).await.expect("lock").is_some());

    assert!(tracker.unlock_session("s1", &token).await.expect("unlock"));
    assert!(tracker.try_lock_session("s1", ttl).await.expect("lock").is_some());
}
