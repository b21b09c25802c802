//! Pluggable coordination backend.
//!
//! The [`CoordinationBackend`] trait is the only seam between the task
//! controller / heartbeat reaper and the store that holds shared state.
//! It bundles three capabilities: TTL-bound state storage, channel
//! publish/subscribe, and atomic lock acquisition. A small set-index
//! capability is included so the reaper can enumerate live leases
//! without scanning the whole keyspace.
//!
//! Two implementations exist and are interchangeable behind the trait:
//! [`LocalBackend`] for single-process deployments and tests, and
//! [`SharedBackend`] for multi-instance deployments sharing a Redis store.

pub mod keys;
pub mod local;
pub mod shared;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::Stream;
use tracing::info;

use crate::config::{BackendConfig, BackendKind};
use crate::{AppError, Result};

pub use keys::Keyspace;
pub use local::LocalBackend;
pub use shared::SharedBackend;

/// Boxed future returned by every backend operation.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Live sequence of messages published on a channel after subscription.
///
/// Dropping the subscription releases its backend resources.
pub type Subscription = Pin<Box<dyn Stream<Item = String> + Send>>;

/// Proof of lock ownership returned by [`CoordinationBackend::try_lock`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    /// Generate a fresh random token.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// The opaque token value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// State storage, pub/sub signaling and mutual exclusion.
///
/// Every key and channel passed in is already namespaced by [`Keyspace`];
/// implementations store them verbatim.
pub trait CoordinationBackend: Send + Sync {
    /// Store `value` under `key`, expiring after `ttl`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Backend`] if the store is unreachable.
    fn set_state(&self, key: &str, value: &str, ttl: Duration) -> BackendFuture<'_, ()>;

    /// Atomically store `value` unless the live value equals `current`.
    ///
    /// Returns `true` when the write happened. This is the admission
    /// primitive for task execution: a check-and-set that no concurrent
    /// caller can interleave with.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Backend`] if the store is unreachable.
    fn set_state_unless(
        &self,
        key: &str,
        current: &str,
        value: &str,
        ttl: Duration,
    ) -> BackendFuture<'_, bool>;

    /// Read the live value under `key`. Expired entries are never returned.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Backend`] if the store is unreachable.
    fn get_state(&self, key: &str) -> BackendFuture<'_, Option<String>>;

    /// Remove `key` if present.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Backend`] if the store is unreachable.
    fn delete_state(&self, key: &str) -> BackendFuture<'_, ()>;

    /// Broadcast `message` to current subscribers of `channel`.
    ///
    /// Fire-and-forget: nothing is retained when there is no subscriber.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Backend`] if the store is unreachable.
    fn publish(&self, channel: &str, message: &str) -> BackendFuture<'_, ()>;

    /// Subscribe to `channel`.
    ///
    /// The subscription is active once the returned future resolves, so
    /// every message published after that point is delivered.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Backend`] if the subscription cannot be opened.
    fn subscribe(&self, channel: &str) -> BackendFuture<'_, Subscription>;

    /// Atomically acquire `key` for `ttl`, or return `None` if held.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Backend`] if the store is unreachable.
    fn try_lock(&self, key: &str, ttl: Duration) -> BackendFuture<'_, Option<LockToken>>;

    /// Release `key` if it is still held with `token`.
    ///
    /// Returns `true` when the lock was released by this call.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Backend`] if the store is unreachable.
    fn unlock(&self, key: &str, token: &LockToken) -> BackendFuture<'_, bool>;

    /// Add `member` to the set stored under `index`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Backend`] if the store is unreachable.
    fn index_add(&self, index: &str, member: &str) -> BackendFuture<'_, ()>;

    /// Remove `member` from the set stored under `index`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Backend`] if the store is unreachable.
    fn index_remove(&self, index: &str, member: &str) -> BackendFuture<'_, ()>;

    /// List the members of the set stored under `index`, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Backend`] if the store is unreachable.
    fn index_members(&self, index: &str) -> BackendFuture<'_, Vec<String>>;

    /// Release connection resources held by the backend.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Backend`] if shutdown fails.
    fn close(&self) -> BackendFuture<'_, ()>;
}

/// Construct the backend selected by `config`.
///
/// # Errors
///
/// Returns `AppError::Config` if the shared backend has no URL, or
/// `AppError::Backend` if the connection cannot be established.
pub async fn connect(config: &BackendConfig) -> Result<Arc<dyn CoordinationBackend>> {
    match config.kind {
        BackendKind::Local => {
            info!("using local coordination backend");
            Ok(Arc::new(LocalBackend::new()))
        }
        BackendKind::Shared => {
            let url = config
                .url
                .as_deref()
                .ok_or_else(|| AppError::Config("backend.url is required".into()))?;
            let backend = SharedBackend::connect(url).await?;
            Ok(Arc::new(backend))
        }
    }
}
