//! Caller-facing output sequence of a task execution.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::Result;

/// Live sequence of items produced by an admitted task.
///
/// Yields `Ok(item)` for every produced item. A producer failure is
/// delivered once as the final `Err` element, after the terminal state
/// has been recorded. The sequence ends (`None`) only once the execution
/// has fully wound down.
///
/// Items already queued when a `STOP` takes effect may still be
/// delivered: there is no ordering between an interrupt and items in
/// flight.
///
/// Dropping the stream before it ends cancels the producer and records
/// `STOPPED`.
pub struct TaskStream<T> {
    task_id: String,
    rx: mpsc::Receiver<Result<T>>,
    cancel: CancellationToken,
}

impl<T> TaskStream<T> {
    pub(crate) fn new(
        task_id: String,
        rx: mpsc::Receiver<Result<T>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            task_id,
            rx,
            cancel,
        }
    }

    /// Task id this stream belongs to.
    #[must_use]
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Request local cancellation, equivalent to receiving `STOP`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl<T> Unpin for TaskStream<T> {}

impl<T> Stream for TaskStream<T> {
    type Item = Result<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl<T> Drop for TaskStream<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
