//! In-process `MessageQueue`, used in tests and by `judge-exec-cli`. No
//! partitions: one FIFO deque per topic, acked messages are simply dropped,
//! nacked messages go back to the tail of their topic.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::prelude::*;
use crate::model::EnvelopeHeaders;

use super::{FetchedMessage, MessageQueue};

struct PendingMessage {
    headers: EnvelopeHeaders,
    body: Vec<u8>,
}

#[derive(Default)]
pub struct InMemoryQueue {
    topics: Mutex<HashMap<String, VecDeque<PendingMessage>>>,
    /// Messages currently checked out by a fetcher, awaiting ack/nack.
    in_flight: Mutex<HashMap<String, (String, PendingMessage)>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn publish(
        &self,
        topic: &str,
        _key: &str,
        headers: EnvelopeHeaders,
        body: Vec<u8>,
    ) -> Result<()> {
        self.topics
            .lock()
            .await
            .entry(topic.to_string())
            .or_default()
            .push_back(PendingMessage { headers, body });
        Ok(())
    }

    async fn fetch(&self, topic: &str) -> Result<Option<FetchedMessage>> {
        let mut topics = self.topics.lock().await;
        let Some(queue) = topics.get_mut(topic) else {
            return Ok(None);
        };
        let Some(pending) = queue.pop_front() else {
            return Ok(None);
        };

        let message_id = pending.headers.id.clone();
        let fetched = FetchedMessage {
            headers: pending.headers.clone(),
            body: pending.body.clone(),
            topic: topic.to_string(),
        };
        self.in_flight
            .lock()
            .await
            .insert(message_id, (topic.to_string(), pending));
        Ok(Some(fetched))
    }

    async fn ack(&self, _topic: &str, message_id: &str) -> Result<()> {
        self.in_flight.lock().await.remove(message_id);
        Ok(())
    }

    async fn nack(&self, _topic: &str, message_id: &str) -> Result<()> {
        let Some((topic, pending)) = self.in_flight.lock().await.remove(message_id) else {
            return Ok(());
        };
        self.topics
            .lock()
            .await
            .entry(topic)
            .or_default()
            .push_back(pending);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn headers(id: &str) -> EnvelopeHeaders {
        EnvelopeHeaders {
            id: id.to_string(),
            timestamp: Utc::now(),
            priority: 0,
            retry_count: 0,
            max_retries: 3,
            expiration_ms: 0,
        }
    }

    #[tokio::test]
    async fn fetch_returns_none_on_empty_topic() {
        let queue = InMemoryQueue::new();
        assert!(queue.fetch("judge.level0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn nack_requeues_to_the_same_topic() {
        let queue = InMemoryQueue::new();
        queue
            .publish("judge.level0", "s1", headers("m1"), b"payload".to_vec())
            .await
            .unwrap();

        let fetched = queue.fetch("judge.level0").await.unwrap().unwrap();
        assert!(queue.fetch("judge.level0").await.unwrap().is_none());

        queue.nack("judge.level0", &fetched.headers.id).await.unwrap();
        let refetched = queue.fetch("judge.level0").await.unwrap().unwrap();
        assert_eq!(refetched.body, b"payload");
    }

    #[tokio::test]
    async fn ack_does_not_requeue() {
        let queue = InMemoryQueue::new();
        queue
            .publish("judge.level0", "s1", headers("m1"), b"payload".to_vec())
            .await
            .unwrap();
        let fetched = queue.fetch("judge.level0").await.unwrap().unwrap();
        queue.ack("judge.level0", &fetched.headers.id).await.unwrap();
        assert!(queue.fetch("judge.level0").await.unwrap().is_none());
    }
}
