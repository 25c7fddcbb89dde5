//! Redis-protocol store backend.
//!
//! `ConnectionManager` handles reconnects; transient failures are retried
//! here with bounded backoff so callers only ever see a `Transient` error
//! once the retries are exhausted. Advisory locks are `SET NX PX` keys
//! with a holder token; the guard releases on drop and the TTL covers a
//! crashed holder.

use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, ErrorKind, RedisError, Script};
use rust_decimal::Decimal;

use super::{LOCK_ACQUIRE_TIMEOUT, LOCK_TTL, LockGuard, Store, StoreError};

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);
const LOCK_POLL_DELAY: Duration = Duration::from_millis(25);

/// Release only if we still hold the token.
const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)
            .map_err(|e| StoreError::Fatal(format!("invalid store url {url:?}: {e}")))?;
        let conn = ConnectionManager::new(client)
            .map_err_transient("connect")
            .await?;
        Ok(Self { conn })
    }

    async fn retry<T, Fut, F>(&self, op: &str, mut f: F) -> Result<T, StoreError>
    where
        F: FnMut(ConnectionManager) -> Fut,
        Fut: Future<Output = Result<T, RedisError>>,
    {
        let mut delay = RETRY_BASE_DELAY;
        let mut last_err = String::new();
        for attempt in 0..RETRY_ATTEMPTS {
            match f(self.conn.clone()).await {
                Ok(v) => return Ok(v),
                Err(e) if is_transient(&e) => {
                    tracing::warn!(op, attempt, error = %e, "transient store error, retrying");
                    last_err = e.to_string();
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(StoreError::Fatal(format!("{op}: {e}"))),
            }
        }
        Err(StoreError::Transient(format!("{op}: {last_err}")))
    }
}

fn is_transient(e: &RedisError) -> bool {
    e.is_io_error()
        || e.is_timeout()
        || e.is_connection_refusal()
        || e.is_connection_dropped()
        || matches!(
            e.kind(),
            ErrorKind::TryAgain | ErrorKind::BusyLoadingError | ErrorKind::MasterDown
        )
}

trait MapErrTransient<T> {
    async fn map_err_transient(self, op: &str) -> Result<T, StoreError>;
}

impl<T, Fut: Future<Output = Result<T, RedisError>>> MapErrTransient<T> for Fut {
    async fn map_err_transient(self, op: &str) -> Result<T, StoreError> {
        self.await.map_err(|e| {
            if is_transient(&e) {
                StoreError::Transient(format!("{op}: {e}"))
            } else {
                StoreError::Fatal(format!("{op}: {e}"))
            }
        })
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.retry("hgetall", |mut conn| {
            let key = key.to_string();
            async move { conn.hgetall::<_, HashMap<String, String>>(key).await }
        })
        .await
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError> {
        self.retry("hset", |mut conn| {
            let key = key.to_string();
            let fields = fields.to_vec();
            async move { conn.hset_multiple::<_, _, _, ()>(key, &fields).await }
        })
        .await
    }

    async fn hincr(&self, key: &str, field: &str, delta: Decimal) -> Result<Decimal, StoreError> {
        let raw: String = self
            .retry("hincrbyfloat", |mut conn| {
                let key = key.to_string();
                let field = field.to_string();
                let delta = delta.to_string();
                async move {
                    redis::cmd("HINCRBYFLOAT")
                        .arg(key)
                        .arg(field)
                        .arg(delta)
                        .query_async(&mut conn)
                        .await
                }
            })
            .await?;
        Decimal::from_str(&raw)
            .map_err(|e| StoreError::Fatal(format!("hincr {key}.{field} returned {raw:?}: {e}")))
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.retry("scan", |mut conn| {
            let pattern = format!("{prefix}*");
            async move {
                let mut keys = Vec::new();
                let mut iter = conn.scan_match::<_, String>(pattern).await?;
                while let Some(key) = iter.next_item().await {
                    keys.push(key);
                }
                Ok(keys)
            }
        })
        .await
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.retry("sadd", |mut conn| {
            let key = key.to_string();
            let member = member.to_string();
            async move { conn.sadd::<_, _, ()>(key, member).await }
        })
        .await
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.retry("srem", |mut conn| {
            let key = key.to_string();
            let member = member.to_string();
            async move { conn.srem::<_, _, ()>(key, member).await }
        })
        .await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.retry("smembers", |mut conn| {
            let key = key.to_string();
            async move { conn.smembers::<_, Vec<String>>(key).await }
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.retry("del", |mut conn| {
            let key = key.to_string();
            async move { conn.del::<_, ()>(key).await }
        })
        .await
    }

    async fn lock(&self, key: &str) -> Result<LockGuard, StoreError> {
        let lock_key = format!("lock_{key}");
        let token = format!("{:016x}", rand::random::<u64>());
        let deadline = tokio::time::Instant::now() + LOCK_ACQUIRE_TIMEOUT;

        loop {
            let acquired: Option<String> = self
                .retry("lock", |mut conn| {
                    let lock_key = lock_key.clone();
                    let token = token.clone();
                    async move {
                        redis::cmd("SET")
                            .arg(&lock_key)
                            .arg(&token)
                            .arg("NX")
                            .arg("PX")
                            .arg(LOCK_TTL.as_millis() as u64)
                            .query_async(&mut conn)
                            .await
                    }
                })
                .await?;
            if acquired.is_some() {
                return Ok(LockGuard::new(Box::new(RedisLockToken {
                    key: lock_key,
                    token,
                    conn: self.conn.clone(),
                })));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(StoreError::Transient(format!(
                    "lock {key}: acquire timed out"
                )));
            }
            tokio::time::sleep(LOCK_POLL_DELAY).await;
        }
    }

    async fn try_leader(&self, owner: &str, ttl: Duration) -> Result<bool, StoreError> {
        let key = super::keys::LEADER_KEY;
        let claimed: Option<String> = self
            .retry("leader-claim", |mut conn| {
                let owner = owner.to_string();
                async move {
                    redis::cmd("SET")
                        .arg(key)
                        .arg(&owner)
                        .arg("NX")
                        .arg("EX")
                        .arg(ttl.as_secs().max(1))
                        .query_async(&mut conn)
                        .await
                }
            })
            .await?;
        if claimed.is_some() {
            return Ok(true);
        }
        // Already held - renew only if it is us.
        let holder: Option<String> = self
            .retry("leader-check", |mut conn| async move { conn.get(key).await })
            .await?;
        if holder.as_deref() == Some(owner) {
            self.retry("leader-renew", |mut conn| async move {
                conn.expire::<_, ()>(key, ttl.as_secs().max(1) as i64).await
            })
            .await?;
            return Ok(true);
        }
        Ok(false)
    }
}

struct RedisLockToken {
    key: String,
    token: String,
    conn: ConnectionManager,
}

impl Drop for RedisLockToken {
    fn drop(&mut self) {
        let script = Script::new(RELEASE_LOCK_SCRIPT);
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        let mut conn = self.conn.clone();
        // Best effort: the TTL reclaims the lock if this task never runs.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = script
                    .key(&key)
                    .arg(&token)
                    .invoke_async::<()>(&mut conn)
                    .await
                {
                    tracing::warn!(key, error = %e, "failed to release store lock");
                }
            });
        }
    }
}
