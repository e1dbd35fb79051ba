//! Black-box check that `QueueConsumer::run_weighted` actually services
//! topics in proportion to their configured weight, not just that
//! `build_schedule` produces the right repeat counts in isolation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

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

/// Keeps each topic saturated with fresh messages so the consumer is never
/// starved waiting on a real producer; every handled message is immediately
/// replaced with a new one on the same topic.
async fn keep_fed(queue: Arc<dyn MessageQueue>, topic: &'static str) {
    loop {
        queue
            .publish(topic, "k", headers(), b"{}".to_vec())
            .await
            .ok();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

#[tokio::test]
async fn high_weight_topic_gets_serviced_more_often() {
    let queue: Arc<dyn MessageQueue> = Arc::new(InMemoryQueue::default());
    for _ in 0..50 {
        queue.publish("hot", "k", headers(), b"{}".to_vec()).await.unwrap();
        queue.publish("cold", "k", headers(), b"{}".to_vec()).await.unwrap();
    }

    let feed_hot = tokio::spawn(keep_fed(queue.clone(), "hot"));
    let feed_cold = tokio::spawn(keep_fed(queue.clone(), "cold"));

    let hot_count = Arc::new(AtomicUsize::new(0));
    let cold_count = Arc::new(AtomicUsize::new(0));

    let shutdown = tokio_util::sync::CancellationToken::new();
    let consumer = QueueConsumer::new(queue.clone(), shutdown.clone());
    let limiter = Arc::new(TokenLimiter::new(4));

    let weighted = vec![
        WeightedTopic { topic: "hot".into(), weight: 8 },
        WeightedTopic { topic: "cold".into(), weight: 1 },
    ];

    let handler_hot = hot_count.clone();
    let handler_cold = cold_count.clone();
    let handler: judge_exec::queue::consumer::Handler = Arc::new(move |message| {
        let handler_hot = handler_hot.clone();
        let handler_cold = handler_cold.clone();
        Box::pin(async move {
            if message.topic == "hot" {
                handler_hot.fetch_add(1, Ordering::Relaxed);
            } else {
                handler_cold.fetch_add(1, Ordering::Relaxed);
            }
            Ok(())
        })
    });

    let run_handle = tokio::spawn(async move {
        consumer
            .run_weighted(weighted, limiter, handler, ConsumerOptions::default())
            .await;
    });

    tokio::time::sleep(Duration::from_millis(500)).await;
    shutdown.cancel();
    run_handle.await.unwrap();
    feed_hot.abort();
    feed_cold.abort();

    let hot = hot_count.load(Ordering::Relaxed);
    let cold = cold_count.load(Ordering::Relaxed);
    assert!(hot + cold > 0, "consumer never handled any message");
    // Weight ratio is 8:1; allow plenty of slack for scheduling jitter but
    // still assert the hot topic dominates rather than just "ran at all".
    assert!(
        hot > cold * 2,
        "expected the weight-8 topic to dominate the weight-1 topic, got hot={hot} cold={cold}"
    );
}
