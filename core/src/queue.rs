//! Topic-scoped priority message queue with pub/sub fan-out.
//!
//! Topics are created lazily on first publish/subscribe. Within one topic,
//! delivery order is by decreasing priority, ties broken by ascending
//! timestamp (FIFO within equal priority). Messages whose TTL has expired
//! at dequeue time are routed to the dead-letter sink and the consumer
//! sees nothing.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Topic used when a publisher does not name one.
pub const DEFAULT_TOPIC: &str = "default";

/// Message priority levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum MessagePriority {
    Low = 1,
    Normal = 5,
    High = 8,
    Critical = 10,
}

impl MessagePriority {
    /// The next priority down, saturating at `Low`.
    pub fn step_down(self) -> Self {
        match self {
            MessagePriority::Critical => MessagePriority::High,
            MessagePriority::High => MessagePriority::Normal,
            MessagePriority::Normal => MessagePriority::Low,
            MessagePriority::Low => MessagePriority::Low,
        }
    }
}

impl From<MessagePriority> for u8 {
    fn from(priority: MessagePriority) -> u8 {
        priority as u8
    }
}

impl TryFrom<u8> for MessagePriority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessagePriority::Low),
            5 => Ok(MessagePriority::Normal),
            8 => Ok(MessagePriority::High),
            10 => Ok(MessagePriority::Critical),
            other => Err(format!("invalid message priority: {other}")),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

/// A message routed through the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub topic: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    pub priority: MessagePriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Uuid>,
    /// Absent means broadcast.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: Value, priority: MessagePriority) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            payload,
            timestamp: Utc::now(),
            priority,
            source: None,
            target: None,
            message_type: None,
            retry_count: 0,
            max_retries: default_max_retries(),
            ttl_seconds: None,
            correlation_id: None,
        }
    }

    pub fn with_ttl(mut self, ttl_seconds: u64) -> Self {
        self.ttl_seconds = Some(ttl_seconds);
        self
    }

    pub fn with_source(mut self, source: Uuid) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_target(mut self, target: Uuid) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_message_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = Some(message_type.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Whether the message's TTL has elapsed at `now`. A TTL of zero is
    /// expired immediately.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl_seconds {
            Some(ttl) => (now - self.timestamp).num_seconds() >= ttl as i64,
            None => false,
        }
    }
}

/// Heap entry; `seq` makes ordering total when priority and timestamp tie.
struct QueuedMessage {
    message: Message,
    seq: u64,
}

impl PartialEq for QueuedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedMessage {}

impl PartialOrd for QueuedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedMessage {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then earlier timestamp, then
        // earlier insertion.
        self.message
            .priority
            .cmp(&other.message.priority)
            .then_with(|| other.message.timestamp.cmp(&self.message.timestamp))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Identifier handed back by `subscribe`, used to unsubscribe.
pub type SubscriptionId = Uuid;

/// Subscriber callback invoked on every publish to the topic.
pub type SubscriberCallback = Arc<dyn Fn(Message) -> BoxFuture<'static, ()> + Send + Sync>;

struct Topic {
    queue: parking_lot::Mutex<BinaryHeap<QueuedMessage>>,
    notify: Notify,
    subscribers: parking_lot::Mutex<Vec<(SubscriptionId, SubscriberCallback)>>,
}

impl Topic {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: parking_lot::Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            subscribers: parking_lot::Mutex::new(Vec::new()),
        })
    }
}

/// Statistics for one topic.
#[derive(Debug, Clone, Serialize)]
pub struct TopicStats {
    pub topic: String,
    pub queue_size: usize,
    pub subscribers: usize,
}

/// Statistics across the whole queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub total_topics: usize,
    pub total_subscribers: usize,
    pub dead_letters: usize,
    pub topics: Vec<TopicStats>,
}

/// In-memory message queue with topic-based routing.
pub struct MessageQueue {
    topics: DashMap<String, Arc<Topic>>,
    dead_letters: parking_lot::Mutex<VecDeque<Message>>,
    dead_letter_notify: Notify,
    seq: AtomicU64,
    shutdown: CancellationToken,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    dead_letter_interval: Duration,
    expiry_sweep_interval: Duration,
}

impl MessageQueue {
    pub fn new() -> Arc<Self> {
        Self::with_intervals(Duration::from_secs(60), Duration::from_secs(300))
    }

    pub fn with_intervals(
        dead_letter_interval: Duration,
        expiry_sweep_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            topics: DashMap::new(),
            dead_letters: parking_lot::Mutex::new(VecDeque::new()),
            dead_letter_notify: Notify::new(),
            seq: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Vec::new()),
            dead_letter_interval,
            expiry_sweep_interval,
        })
    }

    /// Start the dead-letter drain and expired-message sweep loops.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();

        let queue = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            queue.drain_dead_letters().await;
        }));

        let queue = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            queue.sweep_expired().await;
        }));
    }

    /// Stop background loops; pending messages are dropped with the queue.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
    }

    fn topic(&self, name: &str) -> Arc<Topic> {
        self.topics
            .entry(name.to_string())
            .or_insert_with(Topic::new)
            .clone()
    }

    /// Publish a payload to a topic. Subscriber callbacks for the topic are
    /// invoked concurrently and awaited; their failures never reach the
    /// publisher.
    pub async fn publish(
        &self,
        payload: Value,
        topic: &str,
        priority: MessagePriority,
        ttl_seconds: Option<u64>,
    ) -> Uuid {
        let mut message = Message::new(topic, payload, priority);
        message.ttl_seconds = ttl_seconds;
        self.publish_message(message).await
    }

    /// Publish a fully-formed message (envelope fields included).
    pub async fn publish_message(&self, message: Message) -> Uuid {
        let id = message.id;
        let topic = message.topic.clone();
        self.enqueue(message.clone());
        self.notify_subscribers(&topic, message).await;
        id
    }

    /// Re-insert a previously dequeued message, preserving its identity,
    /// priority and timestamp. Used by paused agents; subscribers are not
    /// re-notified.
    pub fn requeue(&self, message: Message) {
        self.enqueue(message);
    }

    fn enqueue(&self, message: Message) {
        let topic = self.topic(&message.topic);
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        topic.queue.lock().push(QueuedMessage { message, seq });
        topic.notify.notify_one();
    }

    /// Subscribe to a topic; the returned id can be passed to `unsubscribe`.
    pub fn subscribe(&self, topic: &str, callback: SubscriberCallback) -> SubscriptionId {
        let id = Uuid::new_v4();
        self.topic(topic).subscribers.lock().push((id, callback));
        id
    }

    pub fn unsubscribe(&self, topic: &str, subscription: SubscriptionId) -> bool {
        match self.topics.get(topic) {
            Some(entry) => {
                let mut subscribers = entry.subscribers.lock();
                let before = subscribers.len();
                subscribers.retain(|(id, _)| *id != subscription);
                subscribers.len() != before
            }
            None => false,
        }
    }

    /// Dequeue the highest-priority message from a topic, waiting up to
    /// `timeout` (forever if `None`). Expired messages are routed to the
    /// dead-letter sink and `None` is returned for them.
    pub async fn consume(&self, topic: &str, timeout: Option<Duration>) -> Option<Message> {
        let topic = self.topic(topic);
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

        loop {
            let notified = topic.notify.notified();
            tokio::pin!(notified);

            if let Some(entry) = topic.queue.lock().pop() {
                let message = entry.message;
                if message.is_expired(Utc::now()) {
                    tracing::debug!(message_id = %message.id, topic = %message.topic, "message expired at dequeue");
                    self.push_dead_letter(message);
                    return None;
                }
                return Some(message);
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return None;
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Reject a message. With `requeue` and retries remaining, it is
    /// republished with an incremented retry count and its priority lowered
    /// one step; otherwise it goes to the dead-letter sink.
    pub async fn reject(&self, message: Message, requeue: bool) {
        if requeue && message.retry_count < message.max_retries {
            let mut retried = message;
            retried.id = Uuid::new_v4();
            retried.timestamp = Utc::now();
            retried.retry_count += 1;
            retried.priority = retried.priority.step_down();
            self.publish_message(retried).await;
        } else {
            self.push_dead_letter(message);
        }
    }

    /// Remove all queued messages from a topic.
    pub fn purge_topic(&self, topic: &str) {
        if let Some(entry) = self.topics.get(topic) {
            entry.queue.lock().clear();
        }
    }

    /// Queued-message count for a topic (0 if the topic does not exist yet).
    pub fn depth(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|entry| entry.queue.lock().len())
            .unwrap_or(0)
    }

    pub fn dead_letter_count(&self) -> usize {
        self.dead_letters.lock().len()
    }

    pub fn topic_stats(&self, topic: &str) -> Option<TopicStats> {
        self.topics.get(topic).map(|entry| TopicStats {
            topic: topic.to_string(),
            queue_size: entry.queue.lock().len(),
            subscribers: entry.subscribers.lock().len(),
        })
    }

    pub fn queue_stats(&self) -> QueueStats {
        let topics: Vec<TopicStats> = self
            .topics
            .iter()
            .map(|entry| TopicStats {
                topic: entry.key().clone(),
                queue_size: entry.value().queue.lock().len(),
                subscribers: entry.value().subscribers.lock().len(),
            })
            .collect();

        QueueStats {
            total_topics: topics.len(),
            total_subscribers: topics.iter().map(|t| t.subscribers).sum(),
            dead_letters: self.dead_letter_count(),
            topics,
        }
    }

    fn push_dead_letter(&self, message: Message) {
        self.dead_letters.lock().push_back(message);
        self.dead_letter_notify.notify_one();
    }

    async fn notify_subscribers(&self, topic: &str, message: Message) {
        let callbacks: Vec<SubscriberCallback> = match self.topics.get(topic) {
            Some(entry) => entry
                .subscribers
                .lock()
                .iter()
                .map(|(_, cb)| Arc::clone(cb))
                .collect(),
            None => return,
        };

        if callbacks.is_empty() {
            return;
        }

        // One task per subscriber: callbacks run concurrently and a panic in
        // one cannot reach the publisher or its peers.
        let handles: Vec<JoinHandle<()>> = callbacks
            .into_iter()
            .map(|cb| {
                let message = message.clone();
                tokio::spawn(async move { cb(message).await })
            })
            .collect();

        for handle in handles {
            if let Err(error) = handle.await {
                tracing::warn!(%error, topic, "subscriber callback failed");
            }
        }
    }

    /// Dead-letter sink. Currently a consumer that logs; a persistent
    /// implementation would store and alert instead.
    async fn drain_dead_letters(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.dead_letter_notify.notified() => {}
                _ = tokio::time::sleep(self.dead_letter_interval) => {}
            }

            loop {
                let message = self.dead_letters.lock().pop_front();
                match message {
                    Some(message) => {
                        tracing::debug!(
                            message_id = %message.id,
                            topic = %message.topic,
                            retry_count = message.retry_count,
                            "dead letter drained"
                        );
                    }
                    None => break,
                }
            }
        }
    }

    /// Periodically drain each topic, route expired messages to the
    /// dead-letter sink and re-add the rest.
    async fn sweep_expired(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.expiry_sweep_interval) => {}
            }

            let now = Utc::now();
            let names: Vec<String> = self.topics.iter().map(|e| e.key().clone()).collect();
            for name in names {
                let Some(topic) = self.topics.get(&name).map(|e| e.value().clone()) else {
                    continue;
                };
                let mut expired = Vec::new();
                {
                    let mut queue = topic.queue.lock();
                    let entries: Vec<QueuedMessage> = queue.drain().collect();
                    for entry in entries {
                        if entry.message.is_expired(now) {
                            expired.push(entry.message);
                        } else {
                            queue.push(entry);
                        }
                    }
                }
                if !expired.is_empty() {
                    tracing::debug!(topic = %name, count = expired.len(), "swept expired messages");
                    for message in expired {
                        self.push_dead_letter(message);
                    }
                }
            }
        }
    }
}
