//! In-process object store for tests and local smoke runs.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::prelude::*;

use super::ObjectStorage;

#[derive(Default)]
pub struct InMemoryObjectStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStorage for InMemoryObjectStorage {
    async fn get_stream(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .lock()
            .await
            .get(key)
            .cloned()
            .with_context(|| format!("object not found: {key}"))
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.objects.lock().await.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn put_multipart(&self, key: &str, parts: Vec<Vec<u8>>) -> Result<()> {
        let bytes = parts.into_iter().flatten().collect();
        self.put(key, bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_put_object() {
        let storage = InMemoryObjectStorage::new();
        storage.put("a/b", b"hello".to_vec()).await.unwrap();
        assert_eq!(storage.get_stream("a/b").await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn missing_key_is_an_error() {
        let storage = InMemoryObjectStorage::new();
        assert!(storage.get_stream("nope").await.is_err());
    }

    #[tokio::test]
    async fn multipart_concatenates_parts_in_order() {
        let storage = InMemoryObjectStorage::new();
        storage
            .put_multipart("p", vec![b"foo".to_vec(), b"bar".to_vec()])
            .await
            .unwrap();
        assert_eq!(storage.get_stream("p").await.unwrap(), b"foobar");
    }
}
