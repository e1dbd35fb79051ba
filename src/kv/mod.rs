//! `Cache`: the generic key-value capability used for cross-host
//! single-flight locking in the Data-Pack Cache and submit-intake idempotency
//! reservation. Distinct from the Data-Pack Cache component itself, which
//! lives in `datapack` and is built on top of this trait plus
//! `ObjectStorage`.

pub mod inmemory;
#[cfg(feature = "redis-backend")]
pub mod redis_backend;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::prelude::*;

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    /// Sets `key` to `value` only if absent; returns `true` if this call won
    /// the race. Used both for cache single-flight and idempotency keys.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;
}
