//! Integration tests for terminal state writes that fail.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};

use session_sentinel::backend::{CoordinationBackend, Keyspace, LocalBackend};
use session_sentinel::config::TaskConfig;
use session_sentinel::interrupt::{TaskController, TaskState};
use session_sentinel::AppError;

use super::test_helpers::{slow_numbers, FlakyBackend};

fn broken_controller() -> (Arc<FlakyBackend>, TaskController) {
    let backend = Arc::new(FlakyBackend::default());
    backend.fail_state_writes.store(true, Ordering::SeqCst);
    let shared: Arc<dyn CoordinationBackend> = backend.clone();
    let controller = TaskController::new(shared, Keyspace::default(), TaskConfig::default());
    (backend, controller)
}

#[tokio::test]
async fn failed_terminal_write_is_surfaced_to_consumer() {
    let (backend, controller) = broken_controller();

    let items: Vec<_> = controller
        .run_task("t", slow_numbers(2, Duration::ZERO))
        .await
        .expect("admitted")
        .collect()
        .await;

    assert_eq!(items.len(), 3);
    assert!(items[..2].iter().all(Result::is_ok));
    assert!(matches!(items.last(), Some(Err(AppError::Backend(_)))));

    // RUNNING is not left behind, so the id can be admitted again.
    assert_ne!(
        controller.get_task_state("t").await.expect("state"),
        TaskState::Running
    );
    backend.fail_state_writes.store(false, Ordering::SeqCst);
    let rerun: Vec<_> = controller
        .run_task("t", slow_numbers(1, Duration::ZERO))
        .await
        .expect("admitted again")
        .collect()
        .await;
    assert_eq!(rerun.len(), 1);
    assert_eq!(
        controller.get_task_state("t").await.expect("state"),
        TaskState::Finished
    );
}

#[tokio::test]
async fn producer_error_wins_over_failed_terminal_write() {
    let (_, controller) = broken_controller();

    let items: Vec<_> = controller
        .run_task("t", |_cancel| {
            stream::iter(vec![
                Ok(1_u32),
                Err(AppError::Producer("model call failed".into())),
            ])
        })
        .await
        .expect("admitted")
        .collect()
        .await;

    assert_eq!(items.len(), 2);
    assert!(matches!(
        items.last(),
        Some(Err(AppError::Producer(msg))) if msg == "model call failed"
    ));
    assert_ne!(
        controller.get_task_state("t").await.expect("state"),
        TaskState::Running
    );
}

#[tokio::test]
async fn zero_stream_buffer_still_streams() {
    let backend: Arc<dyn CoordinationBackend> = Arc::new(LocalBackend::new());
    let config = TaskConfig {
        stream_buffer: 0,
        ..TaskConfig::default()
    };
    let controller = TaskController::new(backend, Keyspace::default(), config);

    let items: Vec<_> = controller
        .run_task("t", slow_numbers(3, Duration::ZERO))
        .await
        .expect("admitted")
        .collect()
        .await;

    assert_eq!(items.len(), 3);
    assert_eq!(
        controller.get_task_state("t").await.expect("state"),
        TaskState::Finished
    );
}
