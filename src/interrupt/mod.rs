//! Cooperative interruption of streaming tasks.
//!
//! A task is one streaming execution identified by
//! [`task_key`]`(user_id, session_id)`. The [`TaskController`] admits at
//! most one `RUNNING` execution per task id through the backend's
//! check-and-set, bridges the producer's items to the caller, and cancels
//! the producer when a `STOP` signal arrives on the task's channel.

pub mod controller;
pub mod stream;

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use crate::AppError;

pub use controller::TaskController;
pub use stream::TaskStream;

/// Lifecycle state of a task as observed through the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// No state stored (never ran, or the record expired).
    Idle,
    /// An execution is in flight.
    Running,
    /// The producer completed normally.
    Finished,
    /// The producer failed.
    Error,
    /// The execution was interrupted.
    Stopped,
}

impl TaskState {
    /// Wire value stored in the backend.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
            Self::Error => "ERROR",
            Self::Stopped => "STOPPED",
        }
    }

    /// Whether this is one of the three terminal outcomes.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Error | Self::Stopped)
    }
}

impl Display for TaskState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IDLE" => Ok(Self::Idle),
            "RUNNING" => Ok(Self::Running),
            "FINISHED" => Ok(Self::Finished),
            "ERROR" => Ok(Self::Error),
            "STOPPED" => Ok(Self::Stopped),
            other => Err(AppError::Codec(format!("unknown task state '{other}'"))),
        }
    }
}

/// Control messages carried on a task's interrupt channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptSignal {
    /// Cancel the running producer.
    Stop,
    /// Reserved; listeners ignore it.
    Pause,
    /// Reserved; listeners ignore it.
    Resume,
}

impl InterruptSignal {
    /// Wire value published on the channel.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "STOP",
            Self::Pause => "PAUSE",
            Self::Resume => "RESUME",
        }
    }
}

impl FromStr for InterruptSignal {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STOP" => Ok(Self::Stop),
            "PAUSE" => Ok(Self::Pause),
            "RESUME" => Ok(Self::Resume),
            other => Err(AppError::Codec(format!("unknown interrupt signal '{other}'"))),
        }
    }
}

/// Derive the task id for a user's conversation session.
#[must_use]
pub fn task_key(user_id: &str, session_id: &str) -> String {
    format!("{user_id}:{session_id}")
}
