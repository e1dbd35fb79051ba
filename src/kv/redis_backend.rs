//! Redis-backed `Cache`, for multi-instance deployments where single-flight
//! locking and idempotency reservations must be visible across processes.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::error::prelude::*;

use super::Cache;

pub struct RedisCache {
    client: redis::Client,
}

impl RedisCache {
    pub fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("couldn't build redis client")?;
        Ok(Self { client })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .context("couldn't connect to redis")
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn().await?;
        conn.get(key).await.context("redis GET failed")
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
            .await
            .context("redis SETEX failed")
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn().await?;
        let won: bool = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .unwrap_or(false);
        Ok(won)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.expire::<_, ()>(key, ttl.as_secs().max(1) as i64)
            .await
            .context("redis EXPIRE failed")
    }
}
