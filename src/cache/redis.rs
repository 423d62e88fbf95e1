//! Redis-backed [`CacheOperations`].
//!
//! Every primitive is a single Redis command (`INCRBY`, `DECRBY`, `SET NX EX`,
//! ...), so atomicity comes from the server and no client-side locking is needed.
//! The [`ConnectionManager`] reconnects transparently and is cheap to clone.

use std::time::Duration;

use async_trait::async_trait;
use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Client, ErrorKind, RedisError};

use super::{CacheError, CacheOperations};

impl From<RedisError> for CacheError {
    fn from(e: RedisError) -> Self {
        CacheError::Unavailable(e.to_string())
    }
}

/// `INCRBY`/`DECRBY` reply errors describe the stored value, not the connection.
fn counter_error(key: &str, e: RedisError) -> CacheError {
    match e.kind() {
        ErrorKind::ResponseError | ErrorKind::TypeError => {
            let key = key.to_string();
            if e.detail().is_some_and(|detail| detail.contains("overflow")) {
                CacheError::Overflow { key }
            } else {
                CacheError::NotAnInteger { key }
            }
        }
        _ => CacheError::from(e),
    }
}

/// Cache ledger shared by every instance through one Redis deployment.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    /// Connect to `url` (for example `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

/// Redis expirations have one second granularity; never send zero.
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl CacheOperations for RedisCache {
    async fn increment(&self, key: &str, delta: i64) -> Result<i64, CacheError> {
        let mut conn = self.conn.clone();
        let value: i64 = conn
            .incr(key, delta)
            .await
            .map_err(|e| counter_error(key, e))?;
        Ok(value)
    }

    async fn decrement(&self, key: &str, delta: i64) -> Result<i64, CacheError> {
        let mut conn = self.conn.clone();
        let value: i64 = conn
            .decr(key, delta)
            .await
            .map_err(|e| counter_error(key, e))?;
        Ok(value)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => conn.set_ex::<_, _, ()>(key, value, ttl_secs(ttl)).await?,
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        // SET NX EX replies OK when stored and nil otherwise
        let reply: Option<String> = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }
}
