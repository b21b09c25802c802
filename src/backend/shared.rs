//! Redis-backed [`CoordinationBackend`] for multi-instance deployments.
//!
//! State uses `SET ... PX` so expiry is enforced by the store, pub/sub
//! uses a dedicated connection per subscription, and locks use
//! `SET ... NX PX` with a token-checked release script. Commands share a
//! single multiplexed connection. Failures propagate as
//! [`AppError::Backend`](crate::AppError::Backend); nothing is retried here.

use std::future::ready;
use std::time::Duration;

use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{Client, ErrorKind, RedisError, Script};
use tracing::{info, warn};

use super::{BackendFuture, CoordinationBackend, LockToken, Subscription};
use crate::Result;

/// Write `ARGV[2]` unless the live value equals `ARGV[1]`.
const SET_UNLESS_LUA: &str = r#"if redis.call("GET", KEYS[1]) == ARGV[1] then
  return 0
end
redis.call("SET", KEYS[1], ARGV[2], "PX", ARGV[3])
return 1
"#;

/// Delete the lock only if it still carries the caller's token.
const RELEASE_LOCK_LUA: &str = r#"if redis.call("GET", KEYS[1]) == ARGV[1] then
  return redis.call("DEL", KEYS[1])
else
  return 0
end
"#;

/// Backend over a Redis server.
#[derive(Clone)]
pub struct SharedBackend {
    client: Client,
    conn: MultiplexedConnection,
    set_unless: Script,
    release_lock: Script,
}

impl SharedBackend {
    /// Open a client for `url` and establish the command connection.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Backend` if the URL is invalid or the server is
    /// unreachable.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!("connected to shared coordination backend");
        Ok(Self {
            client,
            conn,
            set_unless: Script::new(SET_UNLESS_LUA),
            release_lock: Script::new(RELEASE_LOCK_LUA),
        })
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Some managed Redis offerings disable scripting.
fn is_script_unsupported(err: &RedisError) -> bool {
    let msg = err.to_string().to_lowercase();
    matches!(err.kind(), ErrorKind::ResponseError)
        && msg.contains("unknown command")
        && (msg.contains("eval") || msg.contains("evalsha"))
}

impl CoordinationBackend for SharedBackend {
    fn set_state(&self, key: &str, value: &str, ttl: Duration) -> BackendFuture<'_, ()> {
        let key = key.to_owned();
        let value = value.to_owned();
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let () = redis::cmd("SET")
                .arg(&key)
                .arg(&value)
                .arg("PX")
                .arg(ttl_millis(ttl))
                .query_async(&mut conn)
                .await?;
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
            let mut conn = self.conn.clone();
            let written: i64 = self
                .set_unless
                .key(&key)
                .arg(&current)
                .arg(&value)
                .arg(ttl_millis(ttl))
                .invoke_async(&mut conn)
                .await?;
            Ok(written == 1)
        })
    }

    fn get_state(&self, key: &str) -> BackendFuture<'_, Option<String>> {
        let key = key.to_owned();
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let value: Option<String> = redis::cmd("GET").arg(&key).query_async(&mut conn).await?;
            Ok(value)
        })
    }

    fn delete_state(&self, key: &str) -> BackendFuture<'_, ()> {
        let key = key.to_owned();
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let _removed: i64 = redis::cmd("DEL").arg(&key).query_async(&mut conn).await?;
            Ok(())
        })
    }

    fn publish(&self, channel: &str, message: &str) -> BackendFuture<'_, ()> {
        let channel = channel.to_owned();
        let message = message.to_owned();
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let _receivers: i64 = redis::cmd("PUBLISH")
                .arg(&channel)
                .arg(&message)
                .query_async(&mut conn)
                .await?;
            Ok(())
        })
    }

    fn subscribe(&self, channel: &str) -> BackendFuture<'_, Subscription> {
        let channel = channel.to_owned();
        Box::pin(async move {
            let mut pubsub = self.client.get_async_pubsub().await?;
            pubsub.subscribe(&channel).await?;
            // Dropping the stream drops the pub/sub connection, which
            // implicitly unsubscribes.
            let messages = pubsub
                .into_on_message()
                .filter_map(|msg| ready(msg.get_payload::<String>().ok()));
            Ok(Box::pin(messages) as Subscription)
        })
    }

    fn try_lock(&self, key: &str, ttl: Duration) -> BackendFuture<'_, Option<LockToken>> {
        let key = key.to_owned();
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let token = LockToken::generate();
            let reply: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(token.as_str())
                .arg("NX")
                .arg("PX")
                .arg(ttl_millis(ttl))
                .query_async(&mut conn)
                .await?;
            Ok(reply.map(|_| token))
        })
    }

    fn unlock(&self, key: &str, token: &LockToken) -> BackendFuture<'_, bool> {
        let key = key.to_owned();
        let token = token.clone();
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let scripted: std::result::Result<i64, RedisError> = self
                .release_lock
                .key(&key)
                .arg(token.as_str())
                .invoke_async(&mut conn)
                .await;
            match scripted {
                Ok(removed) => Ok(removed == 1),
                Err(err) if is_script_unsupported(&err) => {
                    warn!(key, "scripting unavailable, releasing lock without atomic check");
                    let held: Option<String> =
                        redis::cmd("GET").arg(&key).query_async(&mut conn).await?;
                    if held.as_deref() != Some(token.as_str()) {
                        return Ok(false);
                    }
                    let removed: i64 = redis::cmd("DEL").arg(&key).query_async(&mut conn).await?;
                    Ok(removed == 1)
                }
                Err(err) => {
                    warn!(key, %err, "failed to release lock");
                    Err(err.into())
                }
            }
        })
    }

    fn index_add(&self, index: &str, member: &str) -> BackendFuture<'_, ()> {
        let index = index.to_owned();
        let member = member.to_owned();
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let _added: i64 = redis::cmd("SADD")
                .arg(&index)
                .arg(&member)
                .query_async(&mut conn)
                .await?;
            Ok(())
        })
    }

    fn index_remove(&self, index: &str, member: &str) -> BackendFuture<'_, ()> {
        let index = index.to_owned();
        let member = member.to_owned();
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let _removed: i64 = redis::cmd("SREM")
                .arg(&index)
                .arg(&member)
                .query_async(&mut conn)
                .await?;
            Ok(())
        })
    }

    fn index_members(&self, index: &str) -> BackendFuture<'_, Vec<String>> {
        let index = index.to_owned();
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let mut members: Vec<String> =
                redis::cmd("SMEMBERS").arg(&index).query_async(&mut conn).await?;
            members.sort();
            Ok(members)
        })
    }

    fn close(&self) -> BackendFuture<'_, ()> {
        // Connections close when the last clone of the backend is dropped.
        Box::pin(async move {
            info!("shared coordination backend closing");
            Ok(())
        })
    }
}
