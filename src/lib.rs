//! Session control plane: cooperative task interruption and lease-based
//! idle-session reaping over a pluggable coordination backend.
//!
//! The entry point for embedding managers is [`SessionSentinel`]. The
//! component modules are public for callers that need finer control.

#![forbid(unsafe_code)]

pub mod backend;
pub mod config;
pub mod errors;
pub mod heartbeat;
pub mod interrupt;
pub mod logging;
pub mod sentinel;

pub use config::SentinelConfig;
pub use errors::{AppError, Result};
pub use sentinel::SessionSentinel;
