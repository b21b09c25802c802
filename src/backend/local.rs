//! In-process [`CoordinationBackend`].
//!
//! State lives in a map with explicit expiry instants checked lazily on
//! read. Pub/sub fans out to one unbounded queue per subscriber. Locks are
//! process-local entries keyed by name with their own expiry, so they
//! arbitrate between tasks in one process but carry no cross-process
//! meaning.

use std::collections::{BTreeSet, HashMap};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Stream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use super::{BackendFuture, CoordinationBackend, LockToken, Subscription};

#[derive(Default)]
struct LocalInner {
    states: HashMap<String, (String, Instant)>,
    subscribers: HashMap<String, HashMap<u64, mpsc::UnboundedSender<String>>>,
    locks: HashMap<String, (LockToken, Instant)>,
    indexes: HashMap<String, BTreeSet<String>>,
    next_subscriber: u64,
}

impl LocalInner {
    /// Live value for `key`, evicting it if expired.
    fn live_state(&mut self, key: &str, now: Instant) -> Option<&String> {
        let expired = self
            .states
            .get(key)
            .is_some_and(|(_, expires_at)| now >= *expires_at);
        if expired {
            self.states.remove(key);
            return None;
        }
        self.states.get(key).map(|(value, _)| value)
    }
}

/// Single-process backend built on in-memory maps.
#[derive(Clone, Default)]
pub struct LocalBackend {
    inner: Arc<Mutex<LocalInner>>,
}

impl LocalBackend {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of open subscriptions on `channel`.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.guard().subscribers.get(channel).map_or(0, HashMap::len)
    }

    fn guard(&self) -> MutexGuard<'_, LocalInner> {
        lock_inner(&self.inner)
    }
}

fn lock_inner(inner: &Mutex<LocalInner>) -> MutexGuard<'_, LocalInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

fn deadline(ttl: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(ttl)
        .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365))
}

impl CoordinationBackend for LocalBackend {
    fn set_state(&self, key: &str, value: &str, ttl: Duration) -> BackendFuture<'_, ()> {
        let key = key.to_owned();
        let value = value.to_owned();
        Box::pin(async move {
            self.guard().states.insert(key, (value, deadline(ttl)));
            Ok(())
        })
    }

    fn set_state_unless(
        &self,
        key: &str,
        current: &str,
        value: &str,
        ttl: Duration,
    ) -> BackendFuture<'_, bool> {
        let key = key.to_owned();
        let current = current.to_owned();
        let value = value.to_owned();
        Box::pin(async move {
            let mut inner = self.guard();
            if inner
                .live_state(&key, Instant::now())
                .is_some_and(|live| *live == current)
            {
                return Ok(false);
            }
            inner.states.insert(key, (value, deadline(ttl)));
            Ok(true)
        })
    }

    fn get_state(&self, key: &str) -> BackendFuture<'_, Option<String>> {
        let key = key.to_owned();
        Box::pin(async move {
            let value = self.guard().live_state(&key, Instant::now()).cloned();
            Ok(value)
        })
    }

    fn delete_state(&self, key: &str) -> BackendFuture<'_, ()> {
        let key = key.to_owned();
        Box::pin(async move {
            self.guard().states.remove(&key);
            Ok(())
        })
    }

    fn publish(&self, channel: &str, message: &str) -> BackendFuture<'_, ()> {
        let channel = channel.to_owned();
        let message = message.to_owned();
        Box::pin(async move {
            let inner = self.guard();
            let Some(queues) = inner.subscribers.get(&channel) else {
                debug!(channel, "publish with no subscribers");
                return Ok(());
            };
            for queue in queues.values() {
                // A closed queue belongs to a subscription mid-drop.
                let _ = queue.send(message.clone());
            }
            Ok(())
        })
    }

    fn subscribe(&self, channel: &str) -> BackendFuture<'_, Subscription> {
        let channel = channel.to_owned();
        Box::pin(async move {
            let (tx, rx) = mpsc::unbounded_channel();
            let id = {
                let mut inner = self.guard();
                let id = inner.next_subscriber;
                inner.next_subscriber += 1;
                inner
                    .subscribers
                    .entry(channel.clone())
                    .or_default()
                    .insert(id, tx);
                id
            };
            let subscription = LocalSubscription {
                channel,
                id,
                rx,
                inner: Arc::downgrade(&self.inner),
            };
            Ok(Box::pin(subscription) as Subscription)
        })
    }

    fn try_lock(&self, key: &str, ttl: Duration) -> BackendFuture<'_, Option<LockToken>> {
        let key = key.to_owned();
        Box::pin(async move {
            let mut inner = self.guard();
            let now = Instant::now();
            if inner
                .locks
                .get(&key)
                .is_some_and(|(_, expires_at)| now < *expires_at)
            {
                return Ok(None);
            }
            let token = LockToken::generate();
            inner.locks.insert(key, (token.clone(), deadline(ttl)));
            Ok(Some(token))
        })
    }

    fn unlock(&self, key: &str, token: &LockToken) -> BackendFuture<'_, bool> {
        let key = key.to_owned();
        let token = token.clone();
        Box::pin(async move {
            let mut inner = self.guard();
            let held = inner.locks.get(&key).is_some_and(|(held, expires_at)| {
                *held == token && Instant::now() < *expires_at
            });
            if held {
                inner.locks.remove(&key);
            }
            Ok(held)
        })
    }

    fn index_add(&self, index: &str, member: &str) -> BackendFuture<'_, ()> {
        let index = index.to_owned();
        let member = member.to_owned();
        Box::pin(async move {
            self.guard().indexes.entry(index).or_default().insert(member);
            Ok(())
        })
    }

    fn index_remove(&self, index: &str, member: &str) -> BackendFuture<'_, ()> {
        let index = index.to_owned();
        let member = member.to_owned();
        Box::pin(async move {
            let mut inner = self.guard();
            if let Some(set) = inner.indexes.get_mut(&index) {
                set.remove(&member);
                if set.is_empty() {
                    inner.indexes.remove(&index);
                }
            }
            Ok(())
        })
    }

    fn index_members(&self, index: &str) -> BackendFuture<'_, Vec<String>> {
        let index = index.to_owned();
        Box::pin(async move {
            let members: Vec<String> = self
                .guard()
                .indexes
                .get(&index)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default();
            Ok(members)
        })
    }

    fn close(&self) -> BackendFuture<'_, ()> {
        Box::pin(async move {
            let mut inner = self.guard();
            inner.states.clear();
            // Dropping the senders ends every open subscription stream.
            inner.subscribers.clear();
            inner.locks.clear();
            inner.indexes.clear();
            Ok(())
        })
    }
}

/// Subscriber queue that unregisters itself on drop.
struct LocalSubscription {
    channel: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<String>,
    inner: Weak<Mutex<LocalInner>>,
}

impl Stream for LocalSubscription {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for LocalSubscription {
    fn drop(&mut self) {
        let Some(shared) = self.inner.upgrade() else {
            return;
        };
        let mut inner = lock_inner(&shared);
        if let Some(queues) = inner.subscribers.get_mut(&self.channel) {
            queues.remove(&self.id);
            if queues.is_empty() {
                inner.subscribers.remove(&self.channel);
            }
        }
    }
}
