//! Sentinel configuration parsing and validation.
//!
//! All knobs are passed explicitly at construction time. Durations are
//! expressed in (possibly fractional) seconds in TOML and exposed as
//! [`Duration`] accessors.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Which coordination backend to construct.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Single-process, in-memory backend.
    #[default]
    Local,
    /// Networked key/value + pub/sub store (Redis).
    Shared,
}

/// Log output format for [`init_tracing`](crate::logging::init_tracing).
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// Coordination backend selection.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct BackendConfig {
    /// Backend implementation.
    #[serde(default)]
    pub kind: BackendKind,
    /// Connection URL for the shared backend, e.g. `redis://127.0.0.1/`.
    #[serde(default)]
    pub url: Option<String>,
    /// Prefix applied to every key and channel name.
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            url: None,
            namespace: default_namespace(),
        }
    }
}

/// Heartbeat lease and reaper configuration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct HeartbeatConfig {
    /// Idle time after which a session lease is stale.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_seconds: f64,
    /// Watcher scan interval; 0 disables the watcher.
    #[serde(default)]
    pub scan_interval_seconds: f64,
    /// TTL of the per-session reap lock.
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_seconds: f64,
    /// Store TTL kept on a lease beyond its deadline.
    #[serde(default = "default_lease_retention")]
    pub lease_retention_seconds: f64,
    /// How long a recycled marker is remembered.
    #[serde(default = "default_recycled_ttl")]
    pub recycled_ttl_seconds: f64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_heartbeat_timeout(),
            scan_interval_seconds: 0.0,
            lock_ttl_seconds: default_lock_ttl(),
            lease_retention_seconds: default_lease_retention(),
            recycled_ttl_seconds: default_recycled_ttl(),
        }
    }
}

impl HeartbeatConfig {
    /// Heartbeat timeout as a [`Duration`].
    #[must_use]
    pub fn timeout(&self) -> Duration {
        seconds(self.timeout_seconds)
    }

    /// Scan interval, or `None` when the watcher is disabled.
    #[must_use]
    pub fn scan_interval(&self) -> Option<Duration> {
        let interval = seconds(self.scan_interval_seconds);
        (!interval.is_zero()).then_some(interval)
    }

    /// Reap lock TTL as a [`Duration`].
    #[must_use]
    pub fn lock_ttl(&self) -> Duration {
        seconds(self.lock_ttl_seconds)
    }

    /// Lease retention past the deadline as a [`Duration`].
    #[must_use]
    pub fn lease_retention(&self) -> Duration {
        seconds(self.lease_retention_seconds)
    }

    /// Recycled marker TTL as a [`Duration`].
    #[must_use]
    pub fn recycled_ttl(&self) -> Duration {
        seconds(self.recycled_ttl_seconds)
    }
}

/// Task execution controller configuration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct TaskConfig {
    /// Retention of a terminal task state.
    #[serde(default = "default_state_ttl")]
    pub state_ttl_seconds: f64,
    /// TTL of the `RUNNING` state itself.
    #[serde(default = "default_running_ttl")]
    pub running_ttl_seconds: f64,
    /// Capacity of the queue between producer and consumer.
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            state_ttl_seconds: default_state_ttl(),
            running_ttl_seconds: default_running_ttl(),
            stream_buffer: default_stream_buffer(),
        }
    }
}

impl TaskConfig {
    /// Terminal state retention as a [`Duration`].
    #[must_use]
    pub fn state_ttl(&self) -> Duration {
        seconds(self.state_ttl_seconds)
    }

    /// `RUNNING` state TTL as a [`Duration`].
    #[must_use]
    pub fn running_ttl(&self) -> Duration {
        seconds(self.running_ttl_seconds)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default)]
    pub filter: Option<String>,
}

fn default_namespace() -> String {
    "sentinel".into()
}

fn default_heartbeat_timeout() -> f64 {
    1800.0
}

fn default_lock_ttl() -> f64 {
    3.0
}

fn default_lease_retention() -> f64 {
    86_400.0
}

fn default_recycled_ttl() -> f64 {
    604_800.0
}

fn default_state_ttl() -> f64 {
    600.0
}

fn default_running_ttl() -> f64 {
    3600.0
}

fn default_stream_buffer() -> usize {
    32
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

/// Top-level configuration parsed from `sentinel.toml`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct SentinelConfig {
    /// Backend selection.
    #[serde(default)]
    pub backend: BackendConfig,
    /// Lease and reaper settings.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    /// Task controller settings.
    #[serde(default)]
    pub tasks: TaskConfig,
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl SentinelConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges and cross-field requirements.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.backend.namespace.is_empty()
            || self.backend.namespace.chars().any(char::is_whitespace)
        {
            return Err(AppError::Config(
                "backend.namespace must be non-empty and contain no whitespace".into(),
            ));
        }

        if self.backend.kind == BackendKind::Shared
            && self.backend.url.as_deref().map_or(true, str::is_empty)
        {
            return Err(AppError::Config(
                "backend.url is required for the shared backend".into(),
            ));
        }

        let non_negative = [
            ("heartbeat.scan_interval_seconds", self.heartbeat.scan_interval_seconds),
        ];
        for (name, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(AppError::Config(format!("{name} must be zero or positive")));
            }
        }

        let positive = [
            ("heartbeat.timeout_seconds", self.heartbeat.timeout_seconds),
            ("heartbeat.lock_ttl_seconds", self.heartbeat.lock_ttl_seconds),
            ("heartbeat.lease_retention_seconds", self.heartbeat.lease_retention_seconds),
            ("heartbeat.recycled_ttl_seconds", self.heartbeat.recycled_ttl_seconds),
            ("tasks.state_ttl_seconds", self.tasks.state_ttl_seconds),
            ("tasks.running_ttl_seconds", self.tasks.running_ttl_seconds),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(AppError::Config(format!("{name} must be greater than zero")));
            }
        }

        // A stale lease must outlive at least one scan, or it expires from
        // the store unreaped and its resources stay bound.
        if self.heartbeat.lease_retention_seconds <= self.heartbeat.scan_interval_seconds {
            return Err(AppError::Config(
                "heartbeat.lease_retention_seconds must exceed heartbeat.scan_interval_seconds"
                    .into(),
            ));
        }

        if self.tasks.stream_buffer == 0 {
            return Err(AppError::Config(
                "tasks.stream_buffer must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}
