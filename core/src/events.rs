//! Append-only event store with replay, snapshots and time travel.
//!
//! Events are immutable once appended; the only mutations the store allows
//! are the retention sweep's remove-or-anonymise replacements. Order within
//! one aggregate's stream is append order. A snapshot of the folded state
//! is taken every 100 events per aggregate and used as the starting point
//! for later replays.

use futures::future::BoxFuture;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Events appended per aggregate between snapshots.
const SNAPSHOT_INTERVAL: usize = 100;

/// Types of events that can occur in the memory system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    MemoryWrite,
    MemoryRead,
    MemoryUpdate,
    MemoryDelete,
    CacheHit,
    CacheMiss,
    CacheEvict,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::MemoryWrite => "memory_write",
            EventType::MemoryRead => "memory_read",
            EventType::MemoryUpdate => "memory_update",
            EventType::MemoryDelete => "memory_delete",
            EventType::CacheHit => "cache_hit",
            EventType::CacheMiss => "cache_miss",
            EventType::CacheEvict => "cache_evict",
        }
    }
}

/// Immutable record of a change in the system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub aggregate_id: String,
    pub data: Value,
    pub actor: String,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl Event {
    pub fn new(
        id: String,
        event_type: EventType,
        aggregate_id: impl Into<String>,
        data: Value,
        actor: impl Into<String>,
        metadata: HashMap<String, Value>,
    ) -> Self {
        Self {
            id,
            timestamp: Utc::now(),
            event_type,
            aggregate_id: aggregate_id.into(),
            data,
            actor: actor.into(),
            metadata,
        }
    }
}

/// State of an aggregate after folding its event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateState {
    pub aggregate_id: String,
    pub events: Vec<Event>,
    pub current_value: Option<Value>,
    pub version: u64,
}

impl AggregateState {
    pub fn empty(aggregate_id: impl Into<String>) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            events: Vec::new(),
            current_value: None,
            version: 0,
        }
    }

    /// Fold one event into the state.
    pub fn apply(&mut self, event: &Event) {
        self.events.push(event.clone());
        self.version += 1;

        match event.event_type {
            EventType::MemoryWrite => {
                self.current_value = event.data.get("value").cloned();
            }
            EventType::MemoryUpdate => {
                let incoming = event.data.get("value");
                match (&mut self.current_value, incoming) {
                    (Some(Value::Object(current)), Some(Value::Object(update))) => {
                        for (key, value) in update {
                            current.insert(key.clone(), value.clone());
                        }
                    }
                    (_, incoming) => {
                        self.current_value = incoming.cloned();
                    }
                }
            }
            EventType::MemoryDelete => {
                self.current_value = None;
            }
            EventType::MemoryRead => {}
            _ => {
                if let Some(value) = event.data.get("value") {
                    self.current_value = Some(value.clone());
                }
            }
        }
    }
}

/// Handler for per-aggregate event subscriptions.
pub type EventHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, ()> + Send + Sync>;

/// Identifier handed back by `subscribe`.
pub type EventSubscriptionId = Uuid;

struct StoreInner {
    events: Vec<Event>,
    streams: HashMap<String, Vec<Event>>,
    snapshots: HashMap<String, AggregateState>,
}

/// Event store with replay and time-travel capabilities.
pub struct EventStore {
    inner: parking_lot::Mutex<StoreInner>,
    subscribers:
        parking_lot::Mutex<HashMap<String, Vec<(EventSubscriptionId, EventHandler)>>>,
    last_id_micros: AtomicU64,
}

impl EventStore {
    pub fn new() -> Self {
        Self {
            inner: parking_lot::Mutex::new(StoreInner {
                events: Vec::new(),
                streams: HashMap::new(),
                snapshots: HashMap::new(),
            }),
            subscribers: parking_lot::Mutex::new(HashMap::new()),
            last_id_micros: AtomicU64::new(0),
        }
    }

    /// Generate a unique event id: the current time in integer microseconds,
    /// bumped past the previous id when the clock has not advanced.
    pub fn next_event_id(&self) -> String {
        let now = Utc::now().timestamp_micros().max(0) as u64;
        let mut prev = self.last_id_micros.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(prev + 1);
            match self.last_id_micros.compare_exchange(
                prev,
                candidate,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return format!("evt-{candidate}"),
                Err(current) => prev = current,
            }
        }
    }

    /// Append an event: recorded globally and in its aggregate stream,
    /// fanned out to subscribers (awaited, failures swallowed), snapshotted
    /// every `SNAPSHOT_INTERVAL` events per aggregate.
    pub async fn append(&self, event: Event) {
        {
            let mut inner = self.inner.lock();
            inner.events.push(event.clone());
            let stream = inner
                .streams
                .entry(event.aggregate_id.clone())
                .or_default();
            stream.push(event.clone());
            let stream_len = stream.len();

            if stream_len % SNAPSHOT_INTERVAL == 0 {
                let snapshot = Self::replay_locked(&inner, &event.aggregate_id);
                inner
                    .snapshots
                    .insert(event.aggregate_id.clone(), snapshot);
            }
        }

        self.fan_out(event).await;
    }

    /// Rebuild an aggregate's current state, starting from the latest
    /// snapshot when one exists.
    pub fn replay(&self, aggregate_id: &str) -> AggregateState {
        Self::replay_locked(&self.inner.lock(), aggregate_id)
    }

    fn replay_locked(inner: &StoreInner, aggregate_id: &str) -> AggregateState {
        let events = match inner.streams.get(aggregate_id) {
            Some(events) => events,
            None => return AggregateState::empty(aggregate_id),
        };

        // Resume from the snapshot's version index; the stream is
        // append-ordered, so indexing is exact even when timestamps tie.
        let (mut state, applied) = match inner.snapshots.get(aggregate_id) {
            Some(snapshot) => (snapshot.clone(), snapshot.version as usize),
            None => (AggregateState::empty(aggregate_id), 0),
        };

        for event in events.iter().skip(applied) {
            state.apply(event);
        }
        state
    }

    /// State of an aggregate at a point in time: fold of all events with
    /// `timestamp <= at`.
    pub fn state_at(&self, aggregate_id: &str, at: DateTime<Utc>) -> AggregateState {
        let inner = self.inner.lock();
        let mut state = AggregateState::empty(aggregate_id);
        if let Some(events) = inner.streams.get(aggregate_id) {
            for event in events.iter().filter(|e| e.timestamp <= at) {
                state.apply(event);
            }
        }
        state
    }

    /// Subscribe to all future events of one aggregate.
    pub fn subscribe(&self, aggregate_id: &str, handler: EventHandler) -> EventSubscriptionId {
        let id = Uuid::new_v4();
        self.subscribers
            .lock()
            .entry(aggregate_id.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    pub fn unsubscribe(&self, aggregate_id: &str, subscription: EventSubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();
        match subscribers.get_mut(aggregate_id) {
            Some(handlers) => {
                let before = handlers.len();
                handlers.retain(|(id, _)| *id != subscription);
                handlers.len() != before
            }
            None => false,
        }
    }

    /// All events of one aggregate, in append order.
    pub fn stream(&self, aggregate_id: &str) -> Vec<Event> {
        self.inner
            .lock()
            .streams
            .get(aggregate_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Events of a given type, most recent `limit` when set.
    pub fn events_by_type(&self, event_type: EventType, limit: Option<usize>) -> Vec<Event> {
        let inner = self.inner.lock();
        let matching: Vec<Event> = inner
            .events
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect();
        match limit {
            Some(limit) if matching.len() > limit => {
                matching[matching.len() - limit..].to_vec()
            }
            _ => matching,
        }
    }

    /// Events produced by one actor, optionally windowed by time.
    pub fn events_by_actor(
        &self,
        actor: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Vec<Event> {
        self.inner
            .lock()
            .events
            .iter()
            .filter(|e| e.actor == actor)
            .filter(|e| start.map_or(true, |s| e.timestamp >= s))
            .filter(|e| end.map_or(true, |t| e.timestamp <= t))
            .cloned()
            .collect()
    }

    pub fn all_events(&self) -> Vec<Event> {
        self.inner.lock().events.clone()
    }

    pub fn event_count(&self) -> usize {
        self.inner.lock().events.len()
    }

    pub fn aggregate_count(&self) -> usize {
        self.inner.lock().streams.len()
    }

    /// Remove an event from the global list and its aggregate stream.
    /// Retention-sweep use only; snapshots are invalidated for the
    /// aggregate so later replays fold the surviving events.
    pub(crate) fn remove_event(&self, event_id: &str) -> bool {
        let mut inner = self.inner.lock();
        let Some(position) = inner.events.iter().position(|e| e.id == event_id) else {
            return false;
        };
        let event = inner.events.remove(position);
        if let Some(stream) = inner.streams.get_mut(&event.aggregate_id) {
            stream.retain(|e| e.id != event_id);
        }
        inner.snapshots.remove(&event.aggregate_id);
        true
    }

    /// Replace an event with its anonymised variant in both the global list
    /// and the aggregate stream.
    pub(crate) fn replace_event(&self, event_id: &str, replacement: Event) -> bool {
        let mut inner = self.inner.lock();
        let Some(position) = inner.events.iter().position(|e| e.id == event_id) else {
            return false;
        };
        inner.events[position] = replacement.clone();
        let aggregate_id = replacement.aggregate_id.clone();
        if let Some(stream) = inner.streams.get_mut(&aggregate_id) {
            if let Some(stream_position) = stream.iter().position(|e| e.id == event_id) {
                stream[stream_position] = replacement;
            }
        }
        inner.snapshots.remove(&aggregate_id);
        true
    }

    async fn fan_out(&self, event: Event) {
        let handlers: Vec<EventHandler> = self
            .subscribers
            .lock()
            .get(&event.aggregate_id)
            .map(|handlers| handlers.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        if handlers.is_empty() {
            return;
        }

        let tasks: Vec<tokio::task::JoinHandle<()>> = handlers
            .into_iter()
            .map(|handler| {
                let event = event.clone();
                tokio::spawn(async move { handler(event).await })
            })
            .collect();

        for task in tasks {
            if let Err(error) = task.await {
                tracing::warn!(%error, "event subscriber failed");
            }
        }
    }
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn update_merges_maps_shallowly() {
        let mut state = AggregateState::empty("a");
        let store = EventStore::new();
        state.apply(&Event::new(
            store.next_event_id(),
            EventType::MemoryWrite,
            "a",
            json!({"value": {"x": 1, "y": 2}}),
            "tester",
            HashMap::new(),
        ));
        state.apply(&Event::new(
            store.next_event_id(),
            EventType::MemoryUpdate,
            "a",
            json!({"value": {"y": 3, "z": 4}}),
            "tester",
            HashMap::new(),
        ));
        assert_eq!(state.current_value, Some(json!({"x": 1, "y": 3, "z": 4})));
        assert_eq!(state.version, 2);
    }

    #[test]
    fn update_replaces_non_map_values() {
        let mut state = AggregateState::empty("a");
        let store = EventStore::new();
        state.apply(&Event::new(
            store.next_event_id(),
            EventType::MemoryWrite,
            "a",
            json!({"value": "scalar"}),
            "tester",
            HashMap::new(),
        ));
        state.apply(&Event::new(
            store.next_event_id(),
            EventType::MemoryUpdate,
            "a",
            json!({"value": {"now": "map"}}),
            "tester",
            HashMap::new(),
        ));
        assert_eq!(state.current_value, Some(json!({"now": "map"})));
    }

    #[test]
    fn event_ids_are_unique_and_monotonic() {
        let store = EventStore::new();
        let ids: Vec<u64> = (0..1000)
            .map(|_| {
                store
                    .next_event_id()
                    .strip_prefix("evt-")
                    .unwrap()
                    .parse()
                    .unwrap()
            })
            .collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }
}
