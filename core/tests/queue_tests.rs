/// Unit tests for the topic message queue:
/// - Priority ordering within a topic
/// - TTL expiry and the dead-letter sink
/// - Reject/retry semantics
/// - Pub/sub fan-out and unsubscribe
/// - Purge and statistics
use meridian_core::queue::{Message, MessagePriority, MessageQueue, SubscriberCallback};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const SHORT_WAIT: Option<Duration> = Some(Duration::from_millis(100));

// ============================================================================
// Ordering
// ============================================================================

#[tokio::test]
async fn consume_order_is_priority_then_fifo() {
    let queue = MessageQueue::new();

    for (index, priority) in [
        MessagePriority::Normal,
        MessagePriority::Normal,
        MessagePriority::High,
        MessagePriority::Low,
        MessagePriority::Critical,
    ]
    .into_iter()
    .enumerate()
    {
        queue.publish(json!({ "index": index }), "x", priority, None).await;
    }

    let mut order = Vec::new();
    for _ in 0..5 {
        let message = queue.consume("x", SHORT_WAIT).await.unwrap();
        order.push((message.priority, message.payload["index"].as_u64().unwrap()));
    }

    assert_eq!(
        order,
        vec![
            (MessagePriority::Critical, 4),
            (MessagePriority::High, 2),
            (MessagePriority::Normal, 0),
            (MessagePriority::Normal, 1),
            (MessagePriority::Low, 3),
        ]
    );
}

#[tokio::test]
async fn same_payload_twice_gets_two_ids_and_two_deliveries() {
    let queue = MessageQueue::new();
    let payload = json!({ "work": "dedupe-me" });

    let first = queue
        .publish(payload.clone(), "t", MessagePriority::Normal, None)
        .await;
    let second = queue
        .publish(payload.clone(), "t", MessagePriority::Normal, None)
        .await;
    assert_ne!(first, second);

    let a = queue.consume("t", SHORT_WAIT).await.unwrap();
    let b = queue.consume("t", SHORT_WAIT).await.unwrap();
    assert_eq!(a.payload, payload);
    assert_eq!(b.payload, payload);
    assert!(queue.consume("t", SHORT_WAIT).await.is_none());
}

#[tokio::test]
async fn consume_times_out_on_empty_topic() {
    let queue = MessageQueue::new();
    let started = std::time::Instant::now();
    assert!(queue
        .consume("empty", Some(Duration::from_millis(50)))
        .await
        .is_none());
    assert!(started.elapsed() >= Duration::from_millis(50));
}

// ============================================================================
// TTL and dead letters
// ============================================================================

#[tokio::test]
async fn zero_ttl_message_dead_letters_at_dequeue() {
    let queue = MessageQueue::new();
    queue
        .publish(json!({ "stale": true }), "t", MessagePriority::Normal, Some(0))
        .await;

    assert!(queue.consume("t", SHORT_WAIT).await.is_none());
    assert_eq!(queue.dead_letter_count(), 1);
}

#[tokio::test]
async fn unexpired_ttl_message_is_delivered() {
    let queue = MessageQueue::new();
    queue
        .publish(json!({ "fresh": true }), "t", MessagePriority::Normal, Some(3600))
        .await;

    assert!(queue.consume("t", SHORT_WAIT).await.is_some());
    assert_eq!(queue.dead_letter_count(), 0);
}

// ============================================================================
// Reject and retry
// ============================================================================

#[tokio::test]
async fn requeued_reject_lowers_priority_and_counts_retries() {
    let queue = MessageQueue::new();
    queue
        .publish(json!({ "job": 1 }), "t", MessagePriority::High, None)
        .await;

    let message = queue.consume("t", SHORT_WAIT).await.unwrap();
    queue.reject(message, true).await;

    let retried = queue.consume("t", SHORT_WAIT).await.unwrap();
    assert_eq!(retried.priority, MessagePriority::Normal);
    assert_eq!(retried.retry_count, 1);
    assert_eq!(retried.payload, json!({ "job": 1 }));
}

#[tokio::test]
async fn exhausted_retries_go_to_dead_letters() {
    let queue = MessageQueue::new();
    queue
        .publish(json!({ "job": 2 }), "t", MessagePriority::Critical, None)
        .await;

    for _ in 0..3 {
        let message = queue.consume("t", SHORT_WAIT).await.unwrap();
        queue.reject(message, true).await;
    }
    let exhausted = queue.consume("t", SHORT_WAIT).await.unwrap();
    assert_eq!(exhausted.retry_count, 3);
    queue.reject(exhausted, true).await;

    assert!(queue.consume("t", SHORT_WAIT).await.is_none());
    assert_eq!(queue.dead_letter_count(), 1);
}

#[tokio::test]
async fn reject_without_requeue_dead_letters_immediately() {
    let queue = MessageQueue::new();
    queue
        .publish(json!({}), "t", MessagePriority::Normal, None)
        .await;
    let message = queue.consume("t", SHORT_WAIT).await.unwrap();
    queue.reject(message, false).await;
    assert_eq!(queue.dead_letter_count(), 1);
}

// ============================================================================
// Pub/sub
// ============================================================================

#[tokio::test]
async fn subscribers_receive_published_messages() {
    let queue = MessageQueue::new();
    let received: Arc<parking_lot::Mutex<Vec<serde_json::Value>>> =
        Arc::new(parking_lot::Mutex::new(Vec::new()));

    let sink = Arc::clone(&received);
    let callback: SubscriberCallback = Arc::new(move |message: Message| {
        let sink = Arc::clone(&sink);
        Box::pin(async move {
            sink.lock().push(message.payload);
        })
    });
    queue.subscribe("news", callback);

    queue
        .publish(json!({ "headline": "a" }), "news", MessagePriority::Normal, None)
        .await;
    queue
        .publish(json!({ "headline": "b" }), "news", MessagePriority::Normal, None)
        .await;

    let seen = received.lock().clone();
    assert_eq!(seen.len(), 2);
}

#[tokio::test]
async fn unsubscribed_callback_stops_receiving() {
    let queue = MessageQueue::new();
    let received: Arc<parking_lot::Mutex<Vec<serde_json::Value>>> =
        Arc::new(parking_lot::Mutex::new(Vec::new()));

    let sink = Arc::clone(&received);
    let callback: SubscriberCallback = Arc::new(move |message: Message| {
        let sink = Arc::clone(&sink);
        Box::pin(async move {
            sink.lock().push(message.payload);
        })
    });
    let subscription = queue.subscribe("news", callback);

    queue
        .publish(json!({ "n": 1 }), "news", MessagePriority::Normal, None)
        .await;
    assert!(queue.unsubscribe("news", subscription));
    queue
        .publish(json!({ "n": 2 }), "news", MessagePriority::Normal, None)
        .await;

    assert_eq!(received.lock().len(), 1);
    assert!(!queue.unsubscribe("news", subscription));
}

// ============================================================================
// Purge and statistics
// ============================================================================

#[tokio::test]
async fn purge_empties_a_topic() {
    let queue = MessageQueue::new();
    for n in 0..4 {
        queue
            .publish(json!({ "n": n }), "t", MessagePriority::Normal, None)
            .await;
    }
    assert_eq!(queue.depth("t"), 4);

    queue.purge_topic("t");
    assert_eq!(queue.depth("t"), 0);
    assert!(queue.consume("t", SHORT_WAIT).await.is_none());
}

#[tokio::test]
async fn stats_reflect_queue_contents() {
    let queue = MessageQueue::new();
    queue
        .publish(json!({}), "a", MessagePriority::Normal, None)
        .await;
    queue
        .publish(json!({}), "b", MessagePriority::Normal, None)
        .await;
    queue
        .publish(json!({}), "b", MessagePriority::Normal, None)
        .await;

    let stats = queue.queue_stats();
    assert_eq!(stats.total_topics, 2);
    let b = queue.topic_stats("b").unwrap();
    assert_eq!(b.queue_size, 2);
    assert!(queue.topic_stats("missing").is_none());
}
