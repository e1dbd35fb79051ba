//! Status Store & Publisher: the durable record of a submission's judge
//! state, plus the `status.final` event fan-out. Durability is a
//! `sqlx::SqlitePool` wrapping one pool per process; a `Cache`-backed fast
//! path in front of it serves polling reads without round-tripping SQLite on
//! every call, the same shape as the Data-Pack Cache's single-flight layer
//! sitting in front of object storage.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::warn;
use sqlx::SqlitePool;

use crate::error::prelude::*;
use crate::kv::Cache;
use crate::model::{JudgeStatus, JudgeStatusRow, StatusEvent};
use crate::queue::MessageQueue;

fn cache_key(submission_id: &str) -> String {
    format!("status:{submission_id}")
}

pub struct StatusStoreConfig {
    pub cache_ttl: Duration,
    pub final_topic: String,
}

/// Result of [`StatusStore::get_batch`]: statuses that were found, plus the
/// ids that had none.
#[derive(Debug, Clone, Default)]
pub struct BatchStatus {
    pub found: Vec<JudgeStatus>,
    pub missing: Vec<String>,
}

/// `Save`/`Get`/`GetBatch`/`PersistFinalStatus`/`PublishFinal`.
pub struct StatusStore {
    pool: SqlitePool,
    cache: Arc<dyn Cache>,
    queue: Arc<dyn MessageQueue>,
    config: StatusStoreConfig,
}

impl StatusStore {
    pub fn new(
        pool: SqlitePool,
        cache: Arc<dyn Cache>,
        queue: Arc<dyn MessageQueue>,
        config: StatusStoreConfig,
    ) -> Self {
        Self {
            pool,
            cache,
            queue,
            config,
        }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("couldn't run status store migrations")
    }

    /// Upserts `status`, rejecting the write if the stored row is already
    /// terminal or `status` would move `done_tests` backwards — the same
    /// monotone rule `JudgeStatus::apply` enforces in memory.
    pub async fn save(&self, status: &JudgeStatus) -> Result<bool> {
        let mut current = self.get_from_db(&status.submission_id).await?;
        let accepted = match current.as_mut() {
            Some(existing) => existing.apply(status.clone()),
            None => true,
        };
        if !accepted {
            return Ok(false);
        }

        let row = JudgeStatusRow::from_status(status, Utc::now().naive_utc())?;
        sqlx::query(
            "INSERT INTO judge_status (submission_id, status, progress_json, per_test_json, timestamps_json, compile_log, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(submission_id) DO UPDATE SET
                status = excluded.status,
                progress_json = excluded.progress_json,
                per_test_json = excluded.per_test_json,
                timestamps_json = excluded.timestamps_json,
                compile_log = excluded.compile_log,
                updated_at = excluded.updated_at
             WHERE judge_status.status NOT IN ('accepted', 'wrong_answer', 'time_limit_exceeded',
                'memory_limit_exceeded', 'output_limit_exceeded', 'runtime_error', 'compile_error',
                'system_error', 'canceled')",
        )
        .bind(&row.submission_id)
        .bind(&row.status)
        .bind(&row.progress_json)
        .bind(&row.per_test_json)
        .bind(&row.timestamps_json)
        .bind(&row.compile_log)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await
        .context("couldn't upsert judge status")?;

        self.cache
            .set(
                &cache_key(&status.submission_id),
                &serde_json::to_string(status)?,
                self.config.cache_ttl,
            )
            .await
            .ok();

        Ok(true)
    }

    pub async fn get(&self, submission_id: &str) -> Result<Option<JudgeStatus>> {
        if let Ok(Some(cached)) = self.cache.get(&cache_key(submission_id)).await {
            if let Ok(status) = serde_json::from_str(&cached) {
                return Ok(Some(status));
            }
        }

        let status = self.get_from_db(submission_id).await?;
        if let Some(status) = &status {
            self.cache
                .set(
                    &cache_key(submission_id),
                    &serde_json::to_string(status)?,
                    self.config.cache_ttl,
                )
                .await
                .ok();
        }
        Ok(status)
    }

    async fn get_from_db(&self, submission_id: &str) -> Result<Option<JudgeStatus>> {
        let row: Option<JudgeStatusRow> = sqlx::query_as(
            "SELECT submission_id, status, progress_json, per_test_json, timestamps_json, compile_log, updated_at
             FROM judge_status WHERE submission_id = ?1",
        )
        .bind(submission_id)
        .fetch_optional(&self.pool)
        .await
        .context("couldn't load judge status")?;

        row.map(JudgeStatusRow::into_status).transpose()
    }

    /// Looks up each id independently; ids with no stored status are
    /// reported back in `missing` instead of being silently dropped, so a
    /// caller can tell "no status yet" from "never asked about this id".
    pub async fn get_batch(&self, submission_ids: &[String]) -> Result<BatchStatus> {
        let mut found = Vec::with_capacity(submission_ids.len());
        let mut missing = Vec::new();
        for id in submission_ids {
            match self.get(id).await? {
                Some(status) => found.push(status),
                None => missing.push(id.clone()),
            }
        }
        Ok(BatchStatus { found, missing })
    }

    /// Persists a terminal status (first-terminal-wins, via [`save`]'s
    /// conditional upsert) and publishes the `status.final` event.
    pub async fn persist_final_status(&self, status: &JudgeStatus) -> Result<()> {
        if !status.status.is_terminal() {
            bail!(
                "persist_final_status called with non-terminal status {:?}",
                status.status
            );
        }

        let saved = self.save(status).await?;
        if !saved {
            warn!(
                "submission {} already had a terminal status, ignoring duplicate final status",
                status.submission_id
            );
            return Ok(());
        }

        self.publish_final(status).await
    }

    pub async fn publish_final(&self, status: &JudgeStatus) -> Result<()> {
        let event = StatusEvent::Final {
            status: status.clone(),
            created_at: Utc::now().timestamp_millis(),
        };
        let body = serde_json::to_vec(&event).context("couldn't encode status final event")?;
        let headers = crate::model::EnvelopeHeaders {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            priority: 0,
            retry_count: 0,
            max_retries: 3,
            expiration_ms: 0,
        };
        self.queue
            .publish(
                &self.config.final_topic,
                &status.submission_id,
                headers,
                body,
            )
            .await
            .context("couldn't publish status final event")
    }
}

/// An in-memory sqlite pool pre-migrated with the `judge_status` table,
/// shared by this module's own tests and the final-status consumer's.
#[cfg(test)]
pub mod tests_support {
    use super::SqlitePool;

    pub async fn in_memory_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::query(
            "CREATE TABLE judge_status (
                submission_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                progress_json TEXT NOT NULL,
                per_test_json TEXT NOT NULL,
                timestamps_json TEXT NOT NULL,
                compile_log TEXT,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .unwrap();
        pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::inmemory::InMemoryCache;
    use crate::model::{JudgeVerdict, Progress};
    use crate::queue::inmemory::InMemoryQueue;

    use tests_support::in_memory_pool as pool;

    fn store(pool: SqlitePool) -> StatusStore {
        StatusStore::new(
            pool,
            Arc::new(InMemoryCache::new()),
            Arc::new(InMemoryQueue::new()),
            StatusStoreConfig {
                cache_ttl: Duration::from_secs(60),
                final_topic: "judge.status.final".into(),
            },
        )
    }

    #[tokio::test]
    async fn save_then_get_round_trips() {
        let store = store(pool().await);
        let status = JudgeStatus::new_pending("S1", Utc::now());
        assert!(store.save(&status).await.unwrap());

        let fetched = store.get("S1").await.unwrap().unwrap();
        assert_eq!(fetched.submission_id, "S1");
        assert_eq!(fetched.status, JudgeVerdict::Pending);
    }

    #[tokio::test]
    async fn terminal_status_cannot_be_overwritten() {
        let store = store(pool().await);
        let mut terminal = JudgeStatus::new_pending("S1", Utc::now());
        terminal.status = JudgeVerdict::Accepted;
        terminal.progress = Progress {
            total_tests: 3,
            done_tests: 3,
        };
        store.persist_final_status(&terminal).await.unwrap();

        let mut later = terminal.clone();
        later.status = JudgeVerdict::Running;
        later.progress.done_tests = 1;
        let accepted = store.save(&later).await.unwrap();
        assert!(!accepted);

        let fetched = store.get("S1").await.unwrap().unwrap();
        assert_eq!(fetched.status, JudgeVerdict::Accepted);
    }

    #[tokio::test]
    async fn get_batch_separates_found_from_missing_ids() {
        let store = store(pool().await);
        store
            .save(&JudgeStatus::new_pending("S1", Utc::now()))
            .await
            .unwrap();

        let batch = store
            .get_batch(&["S1".to_string(), "does-not-exist".to_string()])
            .await
            .unwrap();
        assert_eq!(batch.found.len(), 1);
        assert_eq!(batch.found[0].submission_id, "S1");
        assert_eq!(batch.missing, vec!["does-not-exist".to_string()]);
    }
}
