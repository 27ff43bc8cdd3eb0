//! Request/response messaging on top of the topic queue.
//!
//! Requests are published to `request.<topic>` at HIGH priority with a
//! correlation id; responses come back on the shared `responses` topic and
//! resolve the pending entry for that id. A timed-out request returns
//! nothing and leaves no pending entry behind.

use crate::queue::{Message, MessagePriority, MessageQueue, SubscriberCallback};
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Topic carrying all responses.
pub const RESPONSE_TOPIC: &str = "responses";

/// Handler for incoming requests on one topic. An `Err` is converted into
/// an `{error, success: false}` response.
pub type RequestHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// High-level message bus for agent communication.
pub struct MessageBus {
    queue: Arc<MessageQueue>,
    pending: DashMap<Uuid, oneshot::Sender<Value>>,
}

impl MessageBus {
    pub fn new(queue: Arc<MessageQueue>) -> Arc<Self> {
        Arc::new(Self {
            queue,
            pending: DashMap::new(),
        })
    }

    /// Subscribe to the response topic. Must be called once before
    /// `request` is used.
    pub fn initialize(self: &Arc<Self>) {
        let bus = Arc::clone(self);
        let callback: SubscriberCallback = Arc::new(move |message: Message| {
            let bus = Arc::clone(&bus);
            Box::pin(async move {
                bus.resolve_response(&message);
            })
        });
        self.queue.subscribe(RESPONSE_TOPIC, callback);
    }

    /// Send a request and wait up to `timeout` for the response. Returns
    /// `None` on timeout; the pending entry is cleaned up either way.
    pub async fn request(&self, topic: &str, payload: Value, timeout: Duration) -> Option<Value> {
        let request_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, tx);

        self.queue
            .publish_message(
                Message::new(
                    format!("request.{topic}"),
                    json!({ "request_id": request_id, "data": payload }),
                    MessagePriority::High,
                )
                .with_correlation_id(request_id),
            )
            .await;

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Some(response),
            Ok(Err(_)) => None,
            Err(_) => {
                tracing::debug!(%request_id, topic, "request timed out");
                None
            }
        };
        self.pending.remove(&request_id);
        response
    }

    /// Publish a response for a request id.
    pub async fn respond(&self, request_id: Uuid, response: Value) {
        self.queue
            .publish_message(
                Message::new(
                    RESPONSE_TOPIC,
                    json!({ "request_id": request_id, "response": response }),
                    MessagePriority::High,
                )
                .with_correlation_id(request_id),
            )
            .await;
    }

    /// Register a request handler for a topic. The bus responds on the
    /// handler's behalf, converting errors into `{error, success: false}`.
    pub fn handle_request(self: &Arc<Self>, topic: &str, handler: RequestHandler) {
        let bus = Arc::clone(self);
        let callback: SubscriberCallback = Arc::new(move |message: Message| {
            let bus = Arc::clone(&bus);
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let Some(request_id) = message
                    .payload
                    .get("request_id")
                    .and_then(Value::as_str)
                    .and_then(|s| Uuid::parse_str(s).ok())
                else {
                    tracing::warn!(topic = %message.topic, "request without request_id");
                    return;
                };
                let data = message
                    .payload
                    .get("data")
                    .cloned()
                    .unwrap_or_else(|| json!({}));

                let response = match handler(data).await {
                    Ok(response) => response,
                    Err(error) => json!({ "error": error, "success": false }),
                };
                bus.respond(request_id, response).await;
            })
        });
        self.queue.subscribe(&format!("request.{topic}"), callback);
    }

    /// Number of in-flight requests.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn resolve_response(&self, message: &Message) {
        let Some(request_id) = message
            .payload
            .get("request_id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
        else {
            return;
        };
        let response = message
            .payload
            .get("response")
            .cloned()
            .unwrap_or(Value::Null);

        if let Some((_, sender)) = self.pending.remove(&request_id) {
            let _ = sender.send(response);
        }
    }
}
