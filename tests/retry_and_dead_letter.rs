//! Black-box coverage of the consumer's retry-then-dead-letter path: a
//! handler that always fails should exhaust `max_retries` and the message
//! should land on the dead-letter topic rather than being retried forever.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use judge_exec::error::JudgeError;
use judge_exec::model::EnvelopeHeaders;
use judge_exec::queue::consumer::{ConsumerOptions, QueueConsumer, WeightedTopic};
use judge_exec::queue::inmemory::InMemoryQueue;
use judge_exec::queue::{MessageQueue, TokenLimiter};

fn headers() -> EnvelopeHeaders {
    EnvelopeHeaders {
        id: uuid::Uuid::new_v4().to_string(),
        timestamp: Utc::now(),
        priority: 0,
        retry_count: 0,
        max_retries: 5,
        expiration_ms: 0,
    }
}

#[tokio::test]
async fn exhausted_retries_route_to_the_dead_letter_topic() {
    let queue: Arc<dyn MessageQueue> = Arc::new(InMemoryQueue::default());
    queue
        .publish("judge.level0", "s1", headers(), b"payload".to_vec())
        .await
        .unwrap();

    let attempts = Arc::new(AtomicUsize::new(0));
    let handler_attempts = attempts.clone();
    let handler: judge_exec::queue::consumer::Handler = Arc::new(move |_message| {
        let handler_attempts = handler_attempts.clone();
        Box::pin(async move {
            handler_attempts.fetch_add(1, Ordering::Relaxed);
            Err(JudgeError::transient("always fails"))
        })
    });

    let shutdown = tokio_util::sync::CancellationToken::new();
    let consumer = QueueConsumer::new(queue.clone(), shutdown.clone());
    let limiter = Arc::new(TokenLimiter::new(1));
    let weighted = vec![WeightedTopic { topic: "judge.level0".into(), weight: 1 }];
    let options = ConsumerOptions {
        max_retries: 2,
        retry_delay: Duration::from_millis(5),
        dead_letter_topic: Some("judge.dlq".into()),
    };

    let run_handle = tokio::spawn(async move {
        consumer.run_weighted(weighted, limiter, handler, options).await;
    });

    // One fetched message retried to exhaustion (3 attempts: the original
    // plus 2 retries) should land on the DLQ well within this window.
    tokio::time::sleep(Duration::from_millis(300)).await;
    shutdown.cancel();
    run_handle.await.unwrap();

    assert_eq!(attempts.load(Ordering::Relaxed), 3);
    assert!(queue.fetch("judge.level0").await.unwrap().is_none());
    let on_dlq = queue.fetch("judge.dlq").await.unwrap();
    assert!(on_dlq.is_some(), "failed message should have been dead-lettered");
    let on_dlq = on_dlq.unwrap();
    assert_eq!(on_dlq.body, b"payload");
    // Original attempt plus 2 retries: the DLQ'd message must carry the
    // final attempt count, not the count as of the second-to-last retry.
    assert_eq!(on_dlq.headers.retry_count, 3);
}
