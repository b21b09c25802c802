//! Error types shared across the crate.

use std::fmt::{Display, Formatter};

/// Shared crate result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Error enumeration covering every coordination failure mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Coordination backend failure (connection, command, script).
    Backend(String),
    /// A task with the same identity is already in `RUNNING` state.
    AdmissionConflict(String),
    /// The wrapped producer failed or panicked.
    Producer(String),
    /// A stored value could not be encoded or decoded.
    Codec(String),
    /// Caller passed an unusable argument (e.g. an empty session id).
    InvalidInput(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Backend(msg) => write!(f, "backend: {msg}"),
            Self::AdmissionConflict(msg) => write!(f, "admission conflict: {msg}"),
            Self::Producer(msg) => write!(f, "producer: {msg}"),
            Self::Codec(msg) => write!(f, "codec: {msg}"),
            Self::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}
