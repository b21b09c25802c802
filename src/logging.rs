//! Tracing subscriber bootstrap for processes embedding the sentinel.

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};
use crate::{AppError, Result};

/// Filter used when neither `RUST_LOG` nor `logging.filter` is set.
pub const DEFAULT_FILTER: &str = "warn,session_sentinel=info";

/// Filter built from `logging.filter`, or [`DEFAULT_FILTER`].
///
/// # Errors
///
/// Returns `AppError::Config` if the directive does not parse.
pub fn log_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    let directive = config.filter.as_deref().unwrap_or(DEFAULT_FILTER);
    EnvFilter::try_new(directive)
        .map_err(|err| AppError::Config(format!("invalid logging.filter '{directive}': {err}")))
}

/// Install a global `fmt` subscriber.
///
/// `RUST_LOG` takes precedence over the configured filter.
///
/// # Errors
///
/// Returns `AppError::Config` if the configured filter is invalid or a
/// global subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => log_filter(config)?,
    };
    let subscriber = fmt().with_env_filter(env_filter);

    match config.format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
