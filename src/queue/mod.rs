//! `MessageQueue`: the weighted multi-topic consumer and the capability
//! boundary it is built on, using tokio tasks, bounded channels, and
//! `CancellationToken` shutdown.

pub mod consumer;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod inmemory;
pub mod limiter;

use async_trait::async_trait;

use crate::error::prelude::*;
use crate::model::EnvelopeHeaders;

#[derive(Debug, Clone)]
pub struct FetchedMessage {
    pub headers: EnvelopeHeaders,
    pub body: Vec<u8>,
    pub topic: String,
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, headers: EnvelopeHeaders, body: Vec<u8>) -> Result<()>;
    /// Pulls at most one message from `topic`, or `None` if empty.
    async fn fetch(&self, topic: &str) -> Result<Option<FetchedMessage>>;
    async fn ack(&self, topic: &str, message_id: &str) -> Result<()>;
    async fn nack(&self, topic: &str, message_id: &str) -> Result<()>;
}

pub use limiter::TokenLimiter;
