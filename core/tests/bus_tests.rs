/// Integration tests for request/response messaging:
/// - Round trip through a registered handler
/// - Handler errors surfaced as {error, success: false}
/// - Timeout behaviour and pending-table cleanup
use meridian_core::bus::{MessageBus, RequestHandler};
use meridian_core::queue::MessageQueue;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[tokio::test]
async fn request_reaches_handler_and_returns_response() {
    let queue = MessageQueue::new();
    let bus = MessageBus::new(Arc::clone(&queue));
    bus.initialize();

    let handler: RequestHandler = Arc::new(|data| {
        Box::pin(async move {
            let n = data["n"].as_i64().unwrap_or(0);
            Ok(json!({ "doubled": n * 2, "success": true }))
        })
    });
    bus.handle_request("math", handler);

    let response = bus
        .request("math", json!({ "n": 21 }), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(response["doubled"], json!(42));
    assert_eq!(bus.pending_count(), 0);
}

#[tokio::test]
async fn handler_error_becomes_failure_response() {
    let queue = MessageQueue::new();
    let bus = MessageBus::new(Arc::clone(&queue));
    bus.initialize();

    let handler: RequestHandler =
        Arc::new(|_| Box::pin(async move { Err("division by zero".to_string()) }));
    bus.handle_request("math", handler);

    let response = bus
        .request("math", json!({}), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(response["success"], json!(false));
    assert_eq!(response["error"], json!("division by zero"));
}

#[tokio::test]
async fn request_without_handler_times_out_and_cleans_up() {
    let queue = MessageQueue::new();
    let bus = MessageBus::new(Arc::clone(&queue));
    bus.initialize();

    let started = Instant::now();
    let response = bus
        .request("nobody-home", json!({ "q": 1 }), Duration::from_millis(200))
        .await;
    let elapsed = started.elapsed();

    assert!(response.is_none());
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_millis(350));
    assert_eq!(bus.pending_count(), 0);
}

#[tokio::test]
async fn concurrent_requests_resolve_independently() {
    let queue = MessageQueue::new();
    let bus = MessageBus::new(Arc::clone(&queue));
    bus.initialize();

    let handler: RequestHandler = Arc::new(|data| {
        Box::pin(async move { Ok(json!({ "echo": data["tag"] })) })
    });
    bus.handle_request("echo", handler);

    let (a, b) = tokio::join!(
        bus.request("echo", json!({ "tag": "first" }), Duration::from_secs(1)),
        bus.request("echo", json!({ "tag": "second" }), Duration::from_secs(1)),
    );
    assert_eq!(a.unwrap()["echo"], json!("first"));
    assert_eq!(b.unwrap()["echo"], json!("second"));
}
