//! Weighted and simple subscriptions over a `MessageQueue`.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::prelude::*;

use super::{FetchedMessage, MessageQueue, TokenLimiter};

const FETCH_BACKOFF: Duration = Duration::from_millis(100);
const PAUSE_POLL: Duration = Duration::from_millis(100);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub type HandlerFuture = Pin<Box<dyn std::future::Future<Output = Result<(), JudgeError>> + Send>>;
pub type Handler = Arc<dyn Fn(FetchedMessage) -> HandlerFuture + Send + Sync>;

#[derive(Debug, Clone)]
pub struct WeightedTopic {
    pub topic: String,
    pub weight: u32,
}

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub dead_letter_topic: Option<String>,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
            dead_letter_topic: None,
        }
    }
}

/// Repeats each topic's index `weight` times, e.g. weights `{8,4,2,1}` build
/// a 15-slot schedule.
pub fn build_schedule(weighted: &[WeightedTopic]) -> Vec<usize> {
    let mut schedule = Vec::new();
    for (i, wt) in weighted.iter().enumerate() {
        for _ in 0..wt.weight {
            schedule.push(i);
        }
    }
    schedule
}

pub struct QueueConsumer {
    queue: Arc<dyn MessageQueue>,
    paused: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl QueueConsumer {
    pub fn new(queue: Arc<dyn MessageQueue>, shutdown: CancellationToken) -> Self {
        Self {
            queue,
            paused: Arc::new(AtomicBool::new(false)),
            shutdown,
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// One fetcher loop over `schedule[idx % len]`, bounded by `limiter`.
    /// Runs until the consumer's shutdown token fires.
    pub async fn run_weighted(
        &self,
        weighted: Vec<WeightedTopic>,
        limiter: Arc<TokenLimiter>,
        handler: Handler,
        options: ConsumerOptions,
    ) {
        let schedule = build_schedule(&weighted);
        if schedule.is_empty() {
            warn!("weighted consumer started with an empty schedule, nothing to do");
            return;
        }

        let mut idx: usize = 0;
        let mut in_flight: Vec<tokio::task::JoinHandle<()>> = Vec::new();
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            if self.paused.load(Ordering::Relaxed) {
                tokio::time::sleep(PAUSE_POLL).await;
                continue;
            }

            let topic = weighted[schedule[idx % schedule.len()]].topic.clone();
            idx = idx.wrapping_add(1);

            let permit = match limiter.acquire_owned(&self.shutdown).await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            match self.queue.fetch(&topic).await {
                Ok(Some(message)) => {
                    let queue = self.queue.clone();
                    let handler = handler.clone();
                    let options = options.clone();
                    let handle = tokio::spawn(async move {
                        handle_message(queue.as_ref(), message, handler, &options).await;
                        drop(permit);
                    });
                    in_flight.retain(|h| !h.is_finished());
                    in_flight.push(handle);
                }
                Ok(None) => {
                    drop(permit);
                    tokio::time::sleep(FETCH_BACKOFF).await;
                }
                Err(e) => {
                    drop(permit);
                    warn!("fetch error on {topic}: {e:?}");
                    tokio::time::sleep(FETCH_BACKOFF).await;
                }
            }
        }

        drain_in_flight(in_flight, SHUTDOWN_GRACE).await;
    }

    /// A single reader feeding a fixed pool of `concurrency` workers through
    /// a bounded channel of `concurrency * prefetch_count` slots.
    pub async fn run_simple(
        &self,
        topic: String,
        concurrency: usize,
        prefetch_count: usize,
        handler: Handler,
        options: ConsumerOptions,
    ) {
        let (tx, rx) = mpsc::channel::<FetchedMessage>(concurrency * prefetch_count.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut worker_handles = Vec::with_capacity(concurrency);
        for _ in 0..concurrency {
            let queue = self.queue.clone();
            let handler = handler.clone();
            let options = options.clone();
            let rx = rx.clone();
            worker_handles.push(tokio::spawn(async move {
                loop {
                    let message = rx.lock().await.recv().await;
                    match message {
                        Some(message) => {
                            handle_message(queue.as_ref(), message, handler.clone(), &options).await
                        }
                        None => break,
                    }
                }
            }));
        }

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            if self.paused.load(Ordering::Relaxed) {
                tokio::time::sleep(PAUSE_POLL).await;
                continue;
            }
            match self.queue.fetch(&topic).await {
                Ok(Some(message)) => {
                    if tx.send(message).await.is_err() {
                        break;
                    }
                }
                Ok(None) => tokio::time::sleep(FETCH_BACKOFF).await,
                Err(e) => {
                    warn!("fetch error on {topic}: {e:?}");
                    tokio::time::sleep(FETCH_BACKOFF).await;
                }
            }
        }

        drop(tx);
        drain_in_flight(worker_handles, SHUTDOWN_GRACE).await;
    }
}

/// Waits up to `grace` for every handle to finish on its own, then aborts
/// whatever is still running. Cancel-then-drain, not cancel-then-kill.
async fn drain_in_flight(handles: Vec<tokio::task::JoinHandle<()>>, grace: Duration) {
    if handles.is_empty() {
        return;
    }
    let abort_handles: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
    let join_all = async {
        for handle in handles {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(grace, join_all).await.is_err() {
        warn!("timed out draining in-flight handlers after shutdown, aborting stragglers");
        for abort_handle in abort_handles {
            abort_handle.abort();
        }
    }
}

async fn handle_message(
    queue: &dyn MessageQueue,
    message: FetchedMessage,
    handler: Handler,
    options: &ConsumerOptions,
) {
    let message_id = message.headers.id.clone();
    let topic = message.topic.clone();

    if message.headers.is_expired(Utc::now()) {
        debug!("dropping expired message {message_id} on {topic}");
        queue.ack(&topic, &message_id).await.ok();
        return;
    }

    let mut attempt = message.headers.retry_count;
    let mut current = message;
    loop {
        match handler(current.clone()).await {
            Ok(()) => {
                queue.ack(&topic, &message_id).await.ok();
                return;
            }
            Err(e) => {
                attempt += 1;
                warn!("handler failed for {message_id} (attempt {attempt}): {e}");
                current.headers.retry_count = attempt;
                if attempt > options.max_retries {
                    if let Some(dlq) = &options.dead_letter_topic {
                        queue
                            .publish(dlq, &message_id, current.headers.clone(), current.body.clone())
                            .await
                            .ok();
                    }
                    queue.ack(&topic, &message_id).await.ok();
                    return;
                }
                tokio::time::sleep(options.retry_delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_repeats_each_topic_by_weight() {
        let weighted = vec![
            WeightedTopic { topic: "a".into(), weight: 8 },
            WeightedTopic { topic: "b".into(), weight: 4 },
            WeightedTopic { topic: "c".into(), weight: 2 },
            WeightedTopic { topic: "d".into(), weight: 1 },
        ];
        let schedule = build_schedule(&weighted);
        assert_eq!(schedule.len(), 15);
        assert_eq!(schedule.iter().filter(|&&i| i == 0).count(), 8);
        assert_eq!(schedule.iter().filter(|&&i| i == 3).count(), 1);
    }
}
