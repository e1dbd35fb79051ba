//! `rdkafka`-backed `MessageQueue`, behind the `kafka` feature.

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Message, TopicPartitionList};

use crate::error::prelude::*;
use crate::model::EnvelopeHeaders;

use super::{FetchedMessage, MessageQueue};

pub struct KafkaQueue {
    producer: FutureProducer,
    consumer: BaseConsumer,
}

impl KafkaQueue {
    pub fn connect(brokers: &str, group_id: &str) -> Result<Self> {
        let producer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .create()
            .context("couldn't build kafka producer")?;

        let consumer: BaseConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .create()
            .context("couldn't build kafka consumer")?;

        Ok(Self { producer, consumer })
    }

}

#[async_trait]
impl MessageQueue for KafkaQueue {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        headers: EnvelopeHeaders,
        body: Vec<u8>,
    ) -> Result<()> {
        let envelope = serde_json::to_vec(&headers).context("couldn't encode envelope headers")?;
        let record = FutureRecord::to(topic)
            .key(key)
            .payload(&body)
            .headers(
                rdkafka::message::OwnedHeaders::new()
                    .insert(rdkafka::message::Header {
                        key: "x-envelope",
                        value: Some(&envelope),
                    }),
            );
        self.producer
            .send(record, std::time::Duration::from_secs(5))
            .await
            .map_err(|(e, _)| anyhow!("kafka publish failed: {e}"))?;
        Ok(())
    }

    async fn fetch(&self, topic: &str) -> Result<Option<FetchedMessage>> {
        let mut assignment = TopicPartitionList::new();
        assignment.add_partition(topic, 0);
        self.consumer
            .assign(&assignment)
            .with_context(|| format!("couldn't assign kafka partition for {topic}"))?;

        match self.consumer.poll(std::time::Duration::from_millis(50)) {
            Some(Ok(message)) => {
                let headers = message
                    .headers()
                    .and_then(|hs| hs.iter().find(|h| h.key == "x-envelope"))
                    .and_then(|h| h.value)
                    .and_then(|v| serde_json::from_slice::<EnvelopeHeaders>(v).ok())
                    .context("kafka message missing envelope headers")?;
                Ok(Some(FetchedMessage {
                    headers,
                    body: message.payload().unwrap_or_default().to_vec(),
                    topic: topic.to_string(),
                }))
            }
            Some(Err(e)) => Err(anyhow!("kafka poll failed: {e}")),
            None => Ok(None),
        }
    }

    async fn ack(&self, _topic: &str, _message_id: &str) -> Result<()> {
        self.consumer
            .commit_consumer_state(rdkafka::consumer::CommitMode::Async)
            .context("kafka commit failed")
    }

    async fn nack(&self, _topic: &str, _message_id: &str) -> Result<()> {
        // Offsets are only advanced on ack; a nacked message is naturally
        // redelivered on the next poll since its offset was never committed.
        Ok(())
    }
}
