//! `dashmap` plus per-entry expiry, the in-memory `Cache` implementation
//! used in tests and the single-process `judge-exec-cli` smoke path.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::prelude::*;

use super::Cache;

struct Entry {
    value: String,
    expires_at: Instant,
}

#[derive(Default)]
pub struct InMemoryCache {
    entries: DashMap<String, Entry>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_live(entry: &Entry) -> bool {
        Instant::now() < entry.expires_at
    }
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let Some(entry) = self.entries.get(key) else {
            return Ok(None);
        };
        if !Self::is_live(&entry) {
            drop(entry);
            self.entries.remove(key);
            return Ok(None);
        }
        Ok(Some(entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        if let Some(entry) = self.entries.get(key) {
            if Self::is_live(&entry) {
                return Ok(false);
            }
        }
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.expires_at = Instant::now() + ttl;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_nx_only_wins_once() {
        let cache = InMemoryCache::new();
        assert!(cache
            .set_nx("k", "processing", Duration::from_secs(5))
            .await
            .unwrap());
        assert!(!cache
            .set_nx("k", "processing", Duration::from_secs(5))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn expired_entries_read_as_absent() {
        let cache = InMemoryCache::new();
        cache
            .set("k", "v", Duration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
    }
}
