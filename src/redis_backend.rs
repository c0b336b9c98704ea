//! Redis backend for the shared tier, population locks and invalidation bus

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use redis::{AsyncCommands, aio::ConnectionManager};
use tracing::{debug, warn};

use crate::{
    CacheError,
    invalidation::{Invalidation, InvalidationBus},
    key::Expiration,
    lock::LockBackend,
    shared::{SharedStore, TtlRemaining},
};

/// Deletes the lock key only while it still holds the caller's token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const SCAN_BATCH: usize = 500;

/// Redis-backed [`SharedStore`] and [`LockBackend`].
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    release_script: Arc<redis::Script>,
}

impl RedisStore {
    pub async fn new(client: redis::Client) -> Result<Self, CacheError> {
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::from_manager(conn))
    }

    pub fn from_manager(conn: ConnectionManager) -> Self {
        Self {
            conn,
            release_script: Arc::new(redis::Script::new(RELEASE_SCRIPT)),
        }
    }

    /// Check connectivity (for health checks).
    pub async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

/// Milliseconds for PX, rounded up so sub-millisecond TTLs never become zero.
fn millis(d: Duration) -> u64 {
    let ms = d.as_millis();
    let ms = if d.subsec_nanos() % 1_000_000 != 0 { ms + 1 } else { ms };
    u64::try_from(ms.max(1)).unwrap_or(u64::MAX)
}

/// Escape glob metacharacters so a literal prefix can be used in SCAN MATCH.
fn glob_escape(prefix: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(prefix.len() + 1);
    for &b in prefix {
        if matches!(b, b'*' | b'?' | b'[' | b']' | b'\\') {
            out.push(b'\\');
        }
        out.push(b);
    }
    out.push(b'*');
    out
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.conn.clone();
        Ok(conn.get::<_, Option<Vec<u8>>>(key).await?)
    }

    async fn set(&self, key: &[u8], value: &[u8], ttl: Expiration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        match ttl {
            Expiration::Never => {}
            Expiration::After(d) if d.is_zero() => {
                return Err(CacheError::InvalidTtl(
                    "Redis SET with zero expiry".to_owned(),
                ));
            }
            Expiration::After(d) => {
                cmd.arg("PX").arg(millis(d));
            }
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let deleted: u64 = conn.del(key).await?;
        Ok(deleted > 0)
    }

    async fn delete_many(&self, keys: &[Vec<u8>]) -> Result<u64, CacheError> {
        let mut conn = self.conn.clone();
        let mut deleted = 0;
        for chunk in keys.chunks(SCAN_BATCH) {
            let n: u64 = redis::cmd("DEL").arg(chunk).query_async(&mut conn).await?;
            deleted += n;
        }
        Ok(deleted)
    }

    async fn exists(&self, key: &[u8]) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        Ok(conn.exists::<_, bool>(key).await?)
    }

    async fn ttl_remaining(&self, key: &[u8]) -> Result<TtlRemaining, CacheError> {
        let mut conn = self.conn.clone();
        let pttl: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        Ok(match pttl {
            -2 => TtlRemaining::Missing,
            ms if ms < 0 => TtlRemaining::Persistent,
            ms => TtlRemaining::Expires(Duration::from_millis(ms.unsigned_abs())),
        })
    }

    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>, CacheError> {
        let mut conn = self.conn.clone();
        let pattern = glob_escape(prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<Vec<u8>>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may return a key more than once.
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }
}

#[async_trait]
impl LockBackend for RedisStore {
    async fn try_acquire(
        &self,
        key: &[u8],
        token: &str,
        lease: Duration,
    ) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(millis(lease))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn release(&self, key: &[u8], token: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release_script
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }
}

/// Invalidation bus on Redis pub/sub.
#[derive(Clone)]
pub struct RedisBus {
    client: redis::Client,
    conn: ConnectionManager,
    channel: String,
}

impl RedisBus {
    pub async fn new(client: redis::Client, channel: impl Into<String>) -> Result<Self, CacheError> {
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            conn,
            channel: channel.into(),
        })
    }
}

#[async_trait]
impl InvalidationBus for RedisBus {
    async fn publish(&self, message: &Invalidation) -> Result<(), CacheError> {
        let payload = serde_json::to_string(message)?;
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(&self.channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, Invalidation>, CacheError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.channel).await?;
        debug!("Subscribed to invalidation channel {}", self.channel);

        Ok(pubsub
            .into_on_message()
            .filter_map(|msg| async move {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("Failed to decode pub/sub payload: {}", e);
                        return None;
                    }
                };
                match serde_json::from_str::<Invalidation>(&payload) {
                    Ok(message) => Some(message),
                    Err(e) => {
                        warn!("Unable to parse invalidation payload {}: {}", payload, e);
                        None
                    }
                }
            })
            .boxed())
    }
}
