//! Data-Pack Cache: makes a problem's per-version test-data directory
//! available locally with exactly-once download across concurrent callers.
//! Single-flight is an in-process `tokio::sync::Mutex<HashMap<Key, Slot>>`
//! where a miss installs a `tokio::sync::watch` slot other callers await.
//! Cross-host single-flight additionally takes a `Cache::set_nx` lock so two
//! service instances don't race a download.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::debug;
use sha2::{Digest, Sha256};
use tokio::sync::{watch, Mutex};

use crate::error::prelude::*;
use crate::kv::Cache;
use crate::storage::{data_pack_key, ObjectStorage};

/// Decompresses and unpacks a `.tar.zst` blob into `dest`. Both `zstd` and
/// `tar` are synchronous, so this runs on the blocking thread pool.
async fn extract_tar_zst(bytes: &[u8], dest: PathBuf) -> Result<()> {
    let bytes = bytes.to_vec();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let decompressed = zstd::stream::decode_all(&bytes[..])
            .context("couldn't decompress data pack archive")?;
        let mut archive = tar::Archive::new(&decompressed[..]);
        archive
            .unpack(&dest)
            .context("couldn't unpack data pack archive")?;
        Ok(())
    })
    .await
    .context("data pack extraction task panicked")??;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Key {
    problem_id: i64,
    version: u32,
    hash: String,
}

struct Entry {
    local_dir: PathBuf,
    bytes: u64,
    refcount: u32,
    last_access_ns: u128,
    pending_delete: bool,
}

enum Slot {
    Ready(Entry),
    /// A download is in flight; waiters subscribe to this channel.
    Loading(watch::Receiver<Option<Result<(), String>>>),
}

pub struct DataPackCacheConfig {
    pub root_dir: PathBuf,
    pub ttl: Duration,
    pub lock_wait: Duration,
    pub max_entries: usize,
    pub max_bytes: u64,
}

pub struct DataPackCache {
    config: DataPackCacheConfig,
    index: Mutex<HashMap<Key, Slot>>,
    storage: Arc<dyn ObjectStorage>,
    cache: Arc<dyn Cache>,
}

/// Held by a caller between `Acquire` and release; dropping it (or calling
/// `release` explicitly) decrements the entry's refcount.
pub struct DataPackHandle {
    key_problem_id: i64,
    key_version: u32,
    key_hash: String,
    pub local_dir: PathBuf,
}

impl DataPackCache {
    pub fn new(
        config: DataPackCacheConfig,
        storage: Arc<dyn ObjectStorage>,
        cache: Arc<dyn Cache>,
    ) -> Self {
        Self {
            config,
            index: Mutex::new(HashMap::new()),
            storage,
            cache,
        }
    }

    fn key_dir(&self, key: &Key) -> PathBuf {
        self.config
            .root_dir
            .join(key.problem_id.to_string())
            .join(key.version.to_string())
            .join(&key.hash)
    }

    fn now_ns() -> u128 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos()
    }

    pub async fn acquire(
        &self,
        problem_id: i64,
        version: u32,
        data_pack_hash: &str,
    ) -> Result<DataPackHandle> {
        let key = Key {
            problem_id,
            version,
            hash: data_pack_hash.to_string(),
        };

        loop {
            let mut index = self.index.lock().await;
            match index.get_mut(&key) {
                Some(Slot::Ready(entry)) => {
                    entry.refcount += 1;
                    entry.last_access_ns = Self::now_ns();
                    let local_dir = entry.local_dir.clone();
                    drop(index);
                    return Ok(DataPackHandle {
                        key_problem_id: key.problem_id,
                        key_version: key.version,
                        key_hash: key.hash,
                        local_dir,
                    });
                }
                Some(Slot::Loading(rx)) => {
                    let mut rx = rx.clone();
                    drop(index);
                    self.await_slot(&mut rx).await?;
                    continue;
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    index.insert(key.clone(), Slot::Loading(rx));
                    drop(index);

                    let outcome = self.download_and_install(&key).await;
                    let mut index = self.index.lock().await;
                    match &outcome {
                        Ok(entry_bytes) => {
                            let local_dir = self.key_dir(&key);
                            index.insert(
                                key.clone(),
                                Slot::Ready(Entry {
                                    local_dir: local_dir.clone(),
                                    bytes: *entry_bytes,
                                    refcount: 1,
                                    last_access_ns: Self::now_ns(),
                                    pending_delete: false,
                                }),
                            );
                            if let Err(e) = self.evict_locked(&mut index, Some(&key)) {
                                index.remove(&key);
                                tx.send(Some(Err(e.to_string()))).ok();
                                drop(index);
                                tokio::fs::remove_dir_all(&local_dir).await.ok();
                                return Err(anyhow!("data pack cache is full: {e}"));
                            }
                            tx.send(Some(Ok(()))).ok();
                            drop(index);
                            return Ok(DataPackHandle {
                                key_problem_id: key.problem_id,
                                key_version: key.version,
                                key_hash: key.hash,
                                local_dir,
                            });
                        }
                        Err(e) => {
                            index.remove(&key);
                            tx.send(Some(Err(e.to_string()))).ok();
                            return Err(anyhow!("data pack download failed: {e}"));
                        }
                    }
                }
            }
        }
    }

    async fn await_slot(&self, rx: &mut watch::Receiver<Option<Result<(), String>>>) -> Result<()> {
        let wait = tokio::time::timeout(self.config.lock_wait, rx.changed());
        match wait.await {
            Ok(Ok(())) => match rx.borrow().clone() {
                Some(Ok(())) => Ok(()),
                Some(Err(e)) => bail!("data pack download failed: {e}"),
                None => Ok(()),
            },
            Ok(Err(_)) => bail!("data pack single-flight slot closed unexpectedly"),
            Err(_) => bail!("timed out waiting for in-flight data pack download"),
        }
    }

    async fn download_and_install(&self, key: &Key) -> Result<u64> {
        let lock_key = format!("datapack-lock:{}:{}:{}", key.problem_id, key.version, key.hash);
        let won = self
            .cache
            .set_nx(&lock_key, "1", self.config.lock_wait)
            .await?;
        if !won {
            bail!("couldn't acquire cross-host single-flight lock for data pack");
        }

        let result = self.do_download(key).await;
        self.cache.expire(&lock_key, Duration::from_secs(0)).await.ok();
        result
    }

    async fn do_download(&self, key: &Key) -> Result<u64> {
        let object_key = data_pack_key(key.problem_id, key.version);
        let bytes = self
            .storage
            .get_stream(&object_key)
            .await
            .with_context(|| format!("couldn't fetch data pack {object_key}"))?;

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let digest = format!("{:x}", hasher.finalize());
        if digest != key.hash {
            bail!(
                "data pack hash mismatch: expected {}, got {digest}",
                key.hash
            );
        }

        let final_dir = self.key_dir(key);
        let tmp_dir = self.config.root_dir.join(format!(
            ".tmp-{}-{}-{}",
            key.problem_id,
            key.version,
            Self::now_ns()
        ));
        tokio::fs::create_dir_all(&tmp_dir)
            .await
            .context("couldn't create temp data pack directory")?;
        if let Err(e) = extract_tar_zst(&bytes, tmp_dir.clone()).await {
            tokio::fs::remove_dir_all(&tmp_dir).await.ok();
            return Err(anyhow!("couldn't extract data pack archive: {e}"));
        }

        if let Some(parent) = final_dir.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("couldn't create data pack parent directory")?;
        }
        if let Err(e) = tokio::fs::rename(&tmp_dir, &final_dir).await {
            tokio::fs::remove_dir_all(&tmp_dir).await.ok();
            return Err(anyhow!("couldn't install data pack: {e}"));
        }

        Ok(bytes.len() as u64)
    }

    /// Evicts LRU entries with `refcount == 0` while the index is over
    /// `max_entries`/`max_bytes`. `keep` is never evicted (it is the entry
    /// just inserted by this call). Returns an error, leaving the index over
    /// capacity, if nothing is left to evict — the caller must treat that as
    /// a failed `acquire` rather than silently exceeding the configured
    /// limits.
    fn evict_locked(&self, index: &mut HashMap<Key, Slot>, keep: Option<&Key>) -> Result<()> {
        loop {
            let total_entries = index.len();
            let total_bytes: u64 = index
                .values()
                .filter_map(|s| match s {
                    Slot::Ready(e) => Some(e.bytes),
                    Slot::Loading(_) => None,
                })
                .sum();

            if total_entries <= self.config.max_entries && total_bytes <= self.config.max_bytes {
                return Ok(());
            }

            let victim = index
                .iter()
                .filter(|(k, s)| {
                    Some(*k) != keep
                        && matches!(s, Slot::Ready(e) if e.refcount == 0)
                })
                .min_by_key(|(_, s)| match s {
                    Slot::Ready(e) => e.last_access_ns,
                    Slot::Loading(_) => u128::MAX,
                })
                .map(|(k, _)| k.clone());

            match victim {
                Some(k) => {
                    debug!("evicting data pack cache entry {:?}", k);
                    index.remove(&k);
                }
                None => {
                    bail!("cache over capacity ({total_entries} entries, {total_bytes} bytes) but every entry is pinned");
                }
            }
        }
    }

    pub async fn release(&self, handle: DataPackHandle) {
        let key = Key {
            problem_id: handle.key_problem_id,
            version: handle.key_version,
            hash: handle.key_hash,
        };
        let mut index = self.index.lock().await;
        let mut delete_now = false;
        if let Some(Slot::Ready(entry)) = index.get_mut(&key) {
            entry.refcount = entry.refcount.saturating_sub(1);
            if entry.refcount == 0 && entry.pending_delete {
                delete_now = true;
            }
        }
        if delete_now {
            index.remove(&key);
        }
    }

    /// Drops the entry (and its files, once refcount reaches zero).
    pub async fn invalidate(&self, problem_id: i64, version: u32, hash: &str) -> Result<()> {
        let key = Key {
            problem_id,
            version,
            hash: hash.to_string(),
        };
        let mut index = self.index.lock().await;
        match index.get_mut(&key) {
            Some(Slot::Ready(entry)) if entry.refcount == 0 => {
                let dir = entry.local_dir.clone();
                index.remove(&key);
                drop(index);
                tokio::fs::remove_dir_all(&dir).await.ok();
            }
            Some(Slot::Ready(entry)) => {
                entry.pending_delete = true;
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::inmemory::InMemoryCache;
    use crate::storage::inmemory::InMemoryObjectStorage;

    fn config(root: PathBuf) -> DataPackCacheConfig {
        DataPackCacheConfig {
            root_dir: root,
            ttl: Duration::from_secs(3600),
            lock_wait: Duration::from_secs(5),
            max_entries: 2,
            max_bytes: 10 * 1024 * 1024,
        }
    }

    fn build_archive() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let data = b"expected output\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "answer", &data[..]).unwrap();
        let tar_bytes = builder.into_inner().unwrap();
        zstd::stream::encode_all(&tar_bytes[..], 0).unwrap()
    }

    #[tokio::test]
    async fn acquire_rejects_hash_mismatch() {
        let dir = std::env::temp_dir().join(format!("dp-test-{}", std::process::id()));
        let storage: Arc<dyn ObjectStorage> = Arc::new(InMemoryObjectStorage::new());
        storage
            .put(&data_pack_key(1, 1), build_archive())
            .await
            .unwrap();
        let cache: Arc<dyn Cache> = Arc::new(InMemoryCache::new());
        let dp_cache = DataPackCache::new(config(dir), storage, cache);

        let result = dp_cache.acquire(1, 1, "not-the-real-hash").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn acquire_succeeds_on_matching_hash() {
        let dir = std::env::temp_dir().join(format!("dp-test-{}", uuid::Uuid::new_v4()));
        let storage: Arc<dyn ObjectStorage> = Arc::new(InMemoryObjectStorage::new());
        let bytes = build_archive();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let hash = format!("{:x}", hasher.finalize());
        storage.put(&data_pack_key(1, 1), bytes).await.unwrap();

        let cache: Arc<dyn Cache> = Arc::new(InMemoryCache::new());
        let dp_cache = DataPackCache::new(config(dir), storage, cache);

        let handle = dp_cache.acquire(1, 1, &hash).await.unwrap();
        assert!(handle.local_dir.exists());
        assert!(handle.local_dir.join("answer").exists());
        dp_cache.release(handle).await;
    }
}
