//! Submit Intake: validation, idempotency, scene-based topic routing,
//! per-user/per-IP rate limiting, and the final-status consumer. The HTTP
//! transport itself is out of scope — this is a library surface any
//! transport can call into.

pub mod idempotency;
pub mod ratelimit;

use std::sync::Arc;

use chrono::Utc;

use crate::config::{SubmitConfig, TopicsConfig};
use crate::error::prelude::*;
use crate::model::{EnvelopeHeaders, JudgeMessage, Scene, Submission};
use crate::queue::MessageQueue;
use crate::status::StatusStore;
use crate::storage::{self, ObjectStorage};

use idempotency::Reservation;
use ratelimit::RateLimiter;

const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_EXPIRATION_MS: u64 = 0;

pub struct SubmitIntake {
    config: SubmitConfig,
    topics: TopicsConfig,
    storage: Arc<dyn ObjectStorage>,
    queue: Arc<dyn MessageQueue>,
    cache: Arc<dyn crate::kv::Cache>,
    user_limiter: RateLimiter,
    ip_limiter: RateLimiter,
}

impl SubmitIntake {
    pub fn new(
        config: SubmitConfig,
        topics: TopicsConfig,
        storage: Arc<dyn ObjectStorage>,
        queue: Arc<dyn MessageQueue>,
        cache: Arc<dyn crate::kv::Cache>,
    ) -> Self {
        let user_limiter = RateLimiter::new(config.rate_limit_per_minute);
        let ip_limiter = RateLimiter::new(config.rate_limit_per_minute);
        Self {
            config,
            topics,
            storage,
            queue,
            cache,
            user_limiter,
            ip_limiter,
        }
    }

    /// Validates, reserves idempotency, uploads the source, and publishes the
    /// submission onto its scene's topic. Returns the bound submission id —
    /// either the one just created, or an already in-flight one if
    /// `idempotency_key` was seen before.
    pub async fn submit(
        &self,
        submission: Submission,
        idempotency_key: &str,
        client_ip: &str,
    ) -> Result<String, JudgeError> {
        if submission.source_code.len() > self.config.max_code_bytes {
            return Err(JudgeError::validation(format!(
                "source exceeds max_code_bytes ({} > {})",
                submission.source_code.len(),
                self.config.max_code_bytes
            )));
        }

        let user_key = format!("user:{}", submission.user_id);
        if !self.user_limiter.check(&user_key).await {
            return Err(JudgeError::auth_rate("rate limit exceeded for this user"));
        }
        let ip_key = format!("ip:{client_ip}");
        if !self.ip_limiter.check(&ip_key).await {
            return Err(JudgeError::auth_rate("rate limit exceeded for this client"));
        }

        let ttl = std::time::Duration::from_secs(self.config.idempotency_ttl_secs);
        match idempotency::reserve(self.cache.as_ref(), idempotency_key, &submission.submission_id, ttl)
            .await
            .map_err(JudgeError::from)?
        {
            Reservation::AlreadyBound(existing_id) => return Ok(existing_id),
            Reservation::Won => {}
        }

        self.storage
            .put(&storage::source_key(&submission.submission_id), submission.source_code.clone())
            .await
            .map_err(JudgeError::from)?;

        let message = JudgeMessage {
            submission_id: submission.submission_id.clone(),
            problem_id: submission.problem_id,
            language_id: submission.language_id.clone(),
            source_object_key: storage::source_key(&submission.submission_id),
            source_hash: submission.source_hash.clone(),
            contest_id: submission.contest_id,
            user_id: submission.user_id,
            priority: submission.scene.priority_tier(),
            extra_compile_flags: Vec::new(),
        };
        let body = serde_json::to_vec(&message).map_err(|e| JudgeError::fatal(e.to_string()))?;
        let headers = EnvelopeHeaders {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            priority: submission.scene.priority_tier(),
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            expiration_ms: DEFAULT_EXPIRATION_MS,
        };
        let topic = self.topic_for(submission.scene);
        self.queue
            .publish(&topic, &submission.submission_id, headers, body)
            .await
            .map_err(JudgeError::from)?;

        Ok(submission.submission_id)
    }

    fn topic_for(&self, scene: Scene) -> String {
        self.topics
            .levels
            .get(scene.priority_tier() as usize)
            .cloned()
            .unwrap_or_else(|| format!("judge.{}", scene.topic_suffix()))
    }
}

/// Subscribes to the final-status topic and commits terminal statuses to the
/// durable store. Kept separate from [`SubmitIntake`] since it runs as its
/// own long-lived consumer loop rather than a per-request call.
pub struct FinalStatusConsumer {
    queue: Arc<dyn MessageQueue>,
    status_store: Arc<StatusStore>,
    topic: String,
}

impl FinalStatusConsumer {
    pub fn new(queue: Arc<dyn MessageQueue>, status_store: Arc<StatusStore>, topic: impl Into<String>) -> Self {
        Self {
            queue,
            status_store,
            topic: topic.into(),
        }
    }

    /// Drains at most one pending final-status event; `Ok(true)` if one was
    /// processed, `Ok(false)` if the topic was empty. The long-running
    /// service wraps this in a poll loop with its own shutdown handling.
    pub async fn poll_once(&self) -> Result<bool, JudgeError> {
        let Some(message) = self.queue.fetch(&self.topic).await.map_err(JudgeError::from)? else {
            return Ok(false);
        };

        let event: crate::model::StatusEvent =
            serde_json::from_slice(&message.body).map_err(|e| JudgeError::fatal(e.to_string()))?;
        let crate::model::StatusEvent::Final { status, .. } = event;

        match self.status_store.persist_final_status(&status).await {
            Ok(()) => {
                self.queue.ack(&self.topic, &message.headers.id).await.map_err(JudgeError::from)?;
                Ok(true)
            }
            Err(e) => {
                self.queue.nack(&self.topic, &message.headers.id).await.map_err(JudgeError::from)?;
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::inmemory::InMemoryCache;
    use crate::model::JudgeVerdict;
    use crate::queue::inmemory::InMemoryQueue;
    use crate::status::{StatusStore, StatusStoreConfig};
    use crate::storage::inmemory::InMemoryObjectStorage;
    use std::time::Duration;

    fn config() -> SubmitConfig {
        SubmitConfig {
            max_code_bytes: 1024,
            idempotency_ttl_secs: 60,
            rate_limit_per_minute: 5,
        }
    }

    fn submission(id: &str) -> Submission {
        Submission {
            submission_id: id.to_string(),
            problem_id: 1,
            user_id: 42,
            contest_id: None,
            language_id: "py3".to_string(),
            source_code: b"print(1)".to_vec(),
            source_object_key: String::new(),
            source_hash: "irrelevant".to_string(),
            scene: Scene::Contest,
            created_at: Utc::now(),
        }
    }

    fn intake() -> SubmitIntake {
        SubmitIntake::new(
            config(),
            TopicsConfig {
                levels: vec![
                    "judge.level0".into(),
                    "judge.level1".into(),
                    "judge.level2".into(),
                    "judge.level3".into(),
                ],
                status_final: "judge.status.final".into(),
                retry: "judge.retry".into(),
                dlq: "judge.dlq".into(),
            },
            Arc::new(InMemoryObjectStorage::default()),
            Arc::new(InMemoryQueue::default()),
            Arc::new(InMemoryCache::new()),
        )
    }

    #[tokio::test]
    async fn oversized_source_is_rejected() {
        let intake = intake();
        let mut sub = submission("s1");
        sub.source_code = vec![0u8; 2048];
        let err = intake.submit(sub, "idem-1", "127.0.0.1").await.unwrap_err();
        assert_eq!(err.kind, crate::error::JudgeErrorKind::Validation);
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_returns_existing_id() {
        let intake = intake();
        let id1 = intake.submit(submission("s1"), "idem-1", "127.0.0.1").await.unwrap();
        let id2 = intake.submit(submission("s2"), "idem-1", "127.0.0.1").await.unwrap();
        assert_eq!(id1, id2);
        assert_eq!(id1, "s1");
    }

    #[tokio::test]
    async fn rate_limit_rejects_beyond_the_configured_budget() {
        let intake = intake();
        for i in 0..5 {
            intake
                .submit(submission(&format!("s{i}")), &format!("idem-{i}"), "127.0.0.1")
                .await
                .unwrap();
        }
        let err = intake
            .submit(submission("s-over"), "idem-over", "127.0.0.1")
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::JudgeErrorKind::AuthRate);
    }

    #[tokio::test]
    async fn scene_routes_to_the_matching_topic() {
        let intake = intake();
        let mut sub = submission("s1");
        sub.scene = Scene::Rejudge;
        intake.submit(sub, "idem-1", "127.0.0.1").await.unwrap();

        let fetched = intake.queue.fetch("judge.level3").await.unwrap();
        assert!(fetched.is_some());
    }

    #[tokio::test]
    async fn final_status_consumer_commits_terminal_status() {
        let queue: Arc<dyn MessageQueue> = Arc::new(InMemoryQueue::default());
        let pool = crate::status::tests_support::in_memory_pool().await;
        let status_store = Arc::new(StatusStore::new(
            pool,
            Arc::new(InMemoryCache::new()),
            queue.clone(),
            StatusStoreConfig {
                cache_ttl: Duration::from_secs(60),
                final_topic: "judge.status.final".to_string(),
            },
        ));

        let status = crate::model::JudgeStatus {
            submission_id: "s1".to_string(),
            status: JudgeVerdict::Accepted,
            progress: crate::model::Progress {
                total_tests: 1,
                done_tests: 1,
            },
            per_test: Vec::new(),
            timestamps: crate::model::StatusTimestamps::default(),
            compile_log: None,
        };
        let event = crate::model::StatusEvent::Final {
            status,
            created_at: Utc::now().timestamp_millis(),
        };
        let body = serde_json::to_vec(&event).unwrap();
        queue
            .publish(
                "judge.status.final",
                "s1",
                EnvelopeHeaders {
                    id: uuid::Uuid::new_v4().to_string(),
                    timestamp: Utc::now(),
                    priority: 0,
                    retry_count: 0,
                    max_retries: 5,
                    expiration_ms: 0,
                },
                body,
            )
            .await
            .unwrap();

        let consumer = FinalStatusConsumer::new(queue, status_store.clone(), "judge.status.final");
        assert!(consumer.poll_once().await.unwrap());
        let fetched = status_store.get("s1").await.unwrap().unwrap();
        assert_eq!(fetched.status, JudgeVerdict::Accepted);
    }
}
