//! Task execution controller.
//!
//! Admission, producer bridging, interrupt listening and terminal state
//! bookkeeping for streaming tasks. Each admitted execution runs as two
//! spawned tasks: a worker that drives the producer and a listener
//! subscribed to the task's interrupt channel. They coordinate through a
//! shared [`CancellationToken`] only.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{FutureExt, Stream, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::stream::TaskStream;
use super::{task_key, InterruptSignal, TaskState};
use crate::backend::{CoordinationBackend, Keyspace, Subscription};
use crate::config::TaskConfig;
use crate::{AppError, Result};

/// Cancel handles of executions running in this process, keyed by task id.
pub type LocalTasks = Arc<Mutex<HashMap<String, CancellationToken>>>;

/// How a single execution ended.
enum Outcome {
    Finished,
    Stopped,
    Failed(AppError),
}

impl Outcome {
    fn state(&self) -> TaskState {
        match self {
            Self::Finished => TaskState::Finished,
            Self::Stopped => TaskState::Stopped,
            Self::Failed(_) => TaskState::Error,
        }
    }
}

/// Runs producers with at-most-one-execution admission and remote stop.
#[derive(Clone)]
pub struct TaskController {
    backend: Arc<dyn CoordinationBackend>,
    keys: Keyspace,
    config: TaskConfig,
    local_tasks: LocalTasks,
}

impl TaskController {
    /// Create a controller over `backend`.
    #[must_use]
    pub fn new(backend: Arc<dyn CoordinationBackend>, keys: Keyspace, config: TaskConfig) -> Self {
        Self {
            backend,
            keys,
            config,
            local_tasks: LocalTasks::default(),
        }
    }

    /// Run `producer` for the `(user_id, session_id)` task and stream its items.
    ///
    /// See [`run_task`](Self::run_task).
    ///
    /// # Errors
    ///
    /// Returns `AppError::AdmissionConflict` if the task is already
    /// running, or `AppError::Backend` if the backend is unavailable.
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
        self.run_task(&task_key(user_id, session_id), producer).await
    }

    /// Admit and start an execution of `task_id`.
    ///
    /// The task state is moved to `RUNNING` with an atomic check-and-set;
    /// a concurrent execution of the same id is rejected before `producer`
    /// is invoked. `producer` receives a [`CancellationToken`] it should
    /// check between items. Exactly one terminal state (`FINISHED`,
    /// `ERROR` or `STOPPED`) is written per admitted execution. If that
    /// write fails, the `RUNNING` state is cleared and the backend error
    /// is the stream's last item (a producer error takes its place).
    ///
    /// # Errors
    ///
    /// Returns `AppError::AdmissionConflict` if the task is already
    /// running, or `AppError::Backend` if admission or subscription fails.
    pub async fn run_task<T, P, S>(&self, task_id: &str, producer: P) -> Result<TaskStream<T>>
    where
        T: Send + 'static,
        P: FnOnce(CancellationToken) -> S,
        S: Stream<Item = Result<T>> + Send + 'static,
    {
        let state_key = self.keys.task_state(task_id);
        let running = TaskState::Running.as_str();

        let admitted = self
            .backend
            .set_state_unless(&state_key, running, running, self.config.running_ttl())
            .await?;
        if !admitted {
            warn!(task_id, "rejected start of task already running");
            return Err(AppError::AdmissionConflict(format!(
                "task {task_id} is already in RUNNING state"
            )));
        }

        let subscription = match self.backend.subscribe(&self.keys.task_channel(task_id)).await {
            Ok(subscription) => subscription,
            Err(err) => {
                // Roll back admission so the task id is not wedged in RUNNING.
                if let Err(rollback) = self.backend.delete_state(&state_key).await {
                    warn!(task_id, %rollback, "failed to roll back task admission");
                }
                return Err(err);
            }
        };

        let cancel = CancellationToken::new();
        self.local_tasks
            .lock()
            .await
            .insert(task_id.to_owned(), cancel.clone());

        let items = producer(cancel.clone());
        let (tx, rx) = mpsc::channel(self.config.stream_buffer.max(1));

        let listener_shutdown = CancellationToken::new();
        let listener = tokio::spawn(
            listen_for_stop(
                task_id.to_owned(),
                subscription,
                cancel.clone(),
                listener_shutdown.clone(),
            )
            .instrument(info_span!("interrupt_listener", task_id)),
        );

        let execution = Execution {
            task_id: task_id.to_owned(),
            state_key,
            backend: Arc::clone(&self.backend),
            state_ttl: self.config.state_ttl(),
            local_tasks: Arc::clone(&self.local_tasks),
            cancel: cancel.clone(),
            listener,
            listener_shutdown,
        };
        tokio::spawn(
            execution
                .drive(Box::pin(items), tx)
                .instrument(info_span!("task_worker", task_id)),
        );

        info!(task_id, "task admitted");
        Ok(TaskStream::new(task_id.to_owned(), rx, cancel))
    }

    /// Broadcast `STOP` to the `(user_id, session_id)` task.
    ///
    /// Best-effort: if no execution is listening the signal is lost.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Backend` if the publish fails.
    pub async fn stop_chat(&self, user_id: &str, session_id: &str) -> Result<()> {
        self.stop_task(&task_key(user_id, session_id)).await
    }

    /// Broadcast `STOP` on the interrupt channel of `task_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Backend` if the publish fails.
    pub async fn stop_task(&self, task_id: &str) -> Result<()> {
        self.backend
            .publish(
                &self.keys.task_channel(task_id),
                InterruptSignal::Stop.as_str(),
            )
            .await?;
        info!(task_id, "stop signal published");
        Ok(())
    }

    /// Current state of `task_id`; [`TaskState::Idle`] when nothing is stored.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Backend` on store failure or `AppError::Codec`
    /// if the stored value is not a known state.
    pub async fn get_task_state(&self, task_id: &str) -> Result<TaskState> {
        match self.backend.get_state(&self.keys.task_state(task_id)).await? {
            Some(raw) => raw.parse(),
            None => Ok(TaskState::Idle),
        }
    }

    /// Remove any stored state for `task_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Backend` on store failure.
    pub async fn clear_task_state(&self, task_id: &str) -> Result<()> {
        self.backend.delete_state(&self.keys.task_state(task_id)).await
    }

    /// Whether an execution of `task_id` is running in this process.
    pub async fn is_running_locally(&self, task_id: &str) -> bool {
        self.local_tasks.lock().await.contains_key(task_id)
    }

    /// Task ids currently executing in this process, sorted.
    pub async fn running_tasks(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.local_tasks.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Everything the worker needs to wind an execution down.
struct Execution {
    task_id: String,
    state_key: String,
    backend: Arc<dyn CoordinationBackend>,
    state_ttl: Duration,
    local_tasks: LocalTasks,
    cancel: CancellationToken,
    listener: JoinHandle<()>,
    listener_shutdown: CancellationToken,
}

impl Execution {
    async fn drive<T, S>(self, mut items: std::pin::Pin<Box<S>>, tx: mpsc::Sender<Result<T>>)
    where
        S: Stream<Item = Result<T>> + Send,
    {
        let outcome = loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break Outcome::Stopped,
                next = AssertUnwindSafe(items.next()).catch_unwind() => next,
            };

            match next {
                Ok(Some(Ok(item))) => {
                    tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => break Outcome::Stopped,
                        sent = tx.send(Ok(item)) => {
                            if sent.is_err() {
                                debug!(task_id = self.task_id, "consumer went away");
                                break Outcome::Stopped;
                            }
                        }
                    }
                }
                Ok(Some(Err(err))) => break Outcome::Failed(err),
                Ok(None) => break Outcome::Finished,
                Err(panic) => break Outcome::Failed(AppError::Producer(panic_message(&*panic))),
            }
        };

        // Drop the producer first so it releases whatever it holds.
        drop(items);
        self.listener_shutdown.cancel();
        if let Err(err) = self.listener.await {
            warn!(task_id = self.task_id, %err, "interrupt listener ended abnormally");
        }

        // Bookkeeping goes before the terminal write: once the state leaves
        // RUNNING another execution may be admitted under the same id.
        self.local_tasks.lock().await.remove(&self.task_id);

        let state = outcome.state();
        let recorded = self
            .backend
            .set_state(&self.state_key, state.as_str(), self.state_ttl)
            .await;
        let write_failure = match recorded {
            Ok(()) => {
                info!(task_id = self.task_id, %state, "task reached terminal state");
                None
            }
            Err(err) => {
                error!(
                    task_id = self.task_id,
                    %state,
                    %err,
                    "failed to record terminal task state"
                );
                // Clearing RUNNING still lets the id be admitted again.
                if let Err(cleanup) = self.backend.delete_state(&self.state_key).await {
                    error!(task_id = self.task_id, %cleanup, "failed to clear task state");
                }
                Some(err)
            }
        };

        let surfaced = match outcome {
            Outcome::Failed(err) => {
                warn!(task_id = self.task_id, %err, "producer failed");
                Some(err)
            }
            Outcome::Finished | Outcome::Stopped => write_failure,
        };
        if let Some(err) = surfaced {
            let _ = tx.send(Err(err)).await;
        }
    }
}

/// Cancel the execution when `STOP` arrives; ignore other messages.
async fn listen_for_stop(
    task_id: String,
    mut subscription: Subscription,
    cancel: CancellationToken,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            () = shutdown.cancelled() => return,
            () = cancel.cancelled() => return,
            message = subscription.next() => message,
        };

        let Some(message) = message else {
            debug!(task_id, "interrupt channel closed");
            return;
        };

        match message.parse::<InterruptSignal>() {
            Ok(InterruptSignal::Stop) => {
                info!(task_id, "stop signal received");
                cancel.cancel();
                return;
            }
            Ok(signal) => debug!(task_id, ?signal, "ignoring interrupt signal"),
            Err(_) => debug!(task_id, message, "ignoring unrecognised interrupt message"),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("producer panicked: {msg}")
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("producer panicked: {msg}")
    } else {
        "producer panicked".to_owned()
    }
}
