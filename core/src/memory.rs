//! Multi-tier memory: short-term LRU, long-term vector store, shared tier,
//! composed over the event store, audit trail and predictive cache.
//!
//! Every write is event-sourced; recall fans out across the tiers and
//! caches the combined result under the query key.

use crate::audit::{AuditTrail, RetentionSweep};
use crate::cache::{CacheStats, PredictiveCache};
use crate::config::RuntimeConfig;
use crate::events::{Event, EventStore, EventType};
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Dimensions of the reference embedding.
pub const EMBEDDING_DIMENSIONS: usize = 32;

/// Result cap for multi-tier recall.
const RECALL_LIMIT: usize = 10;

fn default_relevance() -> f64 {
    1.0
}

/// A stored memory with its metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryItem {
    pub key: String,
    pub value: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default = "default_relevance")]
    pub relevance_score: f64,
}

impl MemoryItem {
    fn new(key: &str, value: Value, metadata: HashMap<String, Value>) -> Self {
        Self {
            key: key.to_string(),
            value,
            timestamp: Utc::now(),
            metadata,
            relevance_score: 1.0,
        }
    }

    fn belongs_to(&self, user_id: &str) -> bool {
        self.metadata
            .get("user_id")
            .and_then(Value::as_str)
            .map_or(false, |id| id == user_id)
    }

    fn matches(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        self.key.to_lowercase().contains(&needle)
            || self.value.to_string().to_lowercase().contains(&needle)
    }
}

/// Deterministic reference embedding: the MD5 digest of the value's string
/// form, read as big-endian u32 chunks scaled into [0, 1], zero-padded to
/// 32 dimensions. Replaceable by a real model; tests rely only on
/// determinism and fixed length.
pub fn generate_embedding(value: &Value) -> Vec<f32> {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let digest = Md5::digest(text.as_bytes());

    let mut embedding: Vec<f32> = digest
        .chunks_exact(4)
        .map(|chunk| {
            let n = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            (n as f64 / 2f64.powi(32)) as f32
        })
        .collect();
    embedding.resize(EMBEDDING_DIMENSIONS, 0.0);
    embedding
}

/// Cosine similarity; 0 when lengths differ or either norm is 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

struct ShortTermInner {
    entries: HashMap<String, MemoryItem>,
    order: VecDeque<String>,
}

/// Fixed-capacity recency-ordered tier.
pub struct ShortTermMemory {
    capacity: usize,
    inner: parking_lot::Mutex<ShortTermInner>,
}

impl ShortTermMemory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: parking_lot::Mutex::new(ShortTermInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn set(&self, key: &str, value: Value, metadata: HashMap<String, Value>) {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.entries.get_mut(key) {
            existing.value = value;
            existing.timestamp = Utc::now();
            existing.metadata = metadata;
            return;
        }
        if inner.entries.len() >= self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
            }
        }
        inner
            .entries
            .insert(key.to_string(), MemoryItem::new(key, value, metadata));
        inner.order.push_back(key.to_string());
    }

    /// Substring search over keys and values, newest first.
    pub fn search(&self, query: &str) -> Vec<MemoryItem> {
        let inner = self.inner.lock();
        let mut results: Vec<MemoryItem> = inner
            .entries
            .values()
            .filter(|item| item.matches(query))
            .cloned()
            .collect();
        results.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        results
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove_user(&self, user_id: &str) -> Vec<String> {
        let mut inner = self.inner.lock();
        let keys: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, item)| item.belongs_to(user_id))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            inner.entries.remove(key);
            inner.order.retain(|k| k != key);
        }
        keys
    }
}

struct LongTermInner {
    storage: HashMap<String, MemoryItem>,
    embeddings: HashMap<String, Vec<f32>>,
}

/// Vector-similarity tier over embedded values.
pub struct LongTermVectorMemory {
    inner: parking_lot::Mutex<LongTermInner>,
}

impl LongTermVectorMemory {
    pub fn new() -> Self {
        Self {
            inner: parking_lot::Mutex::new(LongTermInner {
                storage: HashMap::new(),
                embeddings: HashMap::new(),
            }),
        }
    }

    pub fn store(
        &self,
        key: &str,
        value: Value,
        embedding: Vec<f32>,
        metadata: HashMap<String, Value>,
    ) {
        let mut inner = self.inner.lock();
        inner
            .storage
            .insert(key.to_string(), MemoryItem::new(key, value, metadata));
        inner.embeddings.insert(key.to_string(), embedding);
    }

    /// Top-k items by cosine similarity to the query embedding.
    pub fn search(&self, query_embedding: &[f32], k: usize) -> Vec<MemoryItem> {
        let inner = self.inner.lock();
        let mut scored: Vec<(f32, &String)> = inner
            .embeddings
            .iter()
            .map(|(key, embedding)| (cosine_similarity(query_embedding, embedding), key))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(b.1)));

        scored
            .into_iter()
            .take(k)
            .filter_map(|(score, key)| {
                inner.storage.get(key).map(|item| {
                    let mut item = item.clone();
                    item.relevance_score = score as f64;
                    item
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove_user(&self, user_id: &str) -> Vec<String> {
        let mut inner = self.inner.lock();
        let keys: Vec<String> = inner
            .storage
            .iter()
            .filter(|(_, item)| item.belongs_to(user_id))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            inner.storage.remove(key);
            inner.embeddings.remove(key);
        }
        keys
    }
}

impl Default for LongTermVectorMemory {
    fn default() -> Self {
        Self::new()
    }
}

/// Cluster-visible keyed tier.
pub struct SharedMemory {
    entries: parking_lot::Mutex<HashMap<String, MemoryItem>>,
}

impl SharedMemory {
    pub fn new() -> Self {
        Self {
            entries: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn set(&self, key: &str, value: Value, metadata: HashMap<String, Value>) {
        self.entries
            .lock()
            .insert(key.to_string(), MemoryItem::new(key, value, metadata));
    }

    pub fn search(&self, query: &str) -> Vec<MemoryItem> {
        self.entries
            .lock()
            .values()
            .filter(|item| item.matches(query))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove_user(&self, user_id: &str) -> Vec<String> {
        let mut entries = self.entries.lock();
        let keys: Vec<String> = entries
            .iter()
            .filter(|(_, item)| item.belongs_to(user_id))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            entries.remove(key);
        }
        keys
    }
}

impl Default for SharedMemory {
    fn default() -> Self {
        Self::new()
    }
}

/// Options for `recall`.
#[derive(Debug, Clone)]
pub struct RecallOptions {
    pub include_shared: bool,
}

impl Default for RecallOptions {
    fn default() -> Self {
        Self {
            include_shared: true,
        }
    }
}

/// Memory system statistics.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub event_count: usize,
    pub aggregate_count: usize,
    pub cache: CacheStats,
    pub short_term_size: usize,
    pub long_term_size: usize,
    pub shared_size: usize,
}

/// Memory manager composing event sourcing, audit trail and tiered
/// storage.
pub struct MemoryManager {
    event_store: Arc<EventStore>,
    audit: AuditTrail,
    cache: Arc<PredictiveCache>,
    short_term: ShortTermMemory,
    long_term: LongTermVectorMemory,
    shared: SharedMemory,
}

impl MemoryManager {
    pub fn new(config: &RuntimeConfig) -> Arc<Self> {
        let event_store = Arc::new(EventStore::new());
        let audit = AuditTrail::with_policies(
            Arc::clone(&event_store),
            &config.retention_days,
            config.default_retention_days,
        );
        Arc::new(Self {
            event_store,
            audit,
            cache: PredictiveCache::new(config.cache_capacity),
            short_term: ShortTermMemory::new(config.short_term_capacity),
            long_term: LongTermVectorMemory::new(),
            shared: SharedMemory::new(),
        })
    }

    pub fn event_store(&self) -> &Arc<EventStore> {
        &self.event_store
    }

    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    pub fn cache(&self) -> &Arc<PredictiveCache> {
        &self.cache
    }

    pub fn shared(&self) -> &SharedMemory {
        &self.shared
    }

    /// Store a memory: append a write event, refresh the cache and
    /// short-term tiers, and (unless `store_long_term` is false in the
    /// metadata) embed into the long-term tier.
    pub async fn remember(
        &self,
        key: &str,
        value: Value,
        metadata: HashMap<String, Value>,
        actor: &str,
    ) {
        let event = Event::new(
            self.event_store.next_event_id(),
            EventType::MemoryWrite,
            key,
            json!({ "key": key, "value": value }),
            actor,
            metadata.clone(),
        );
        self.event_store.append(event).await;

        self.cache.set(key, value.clone());
        self.short_term.set(key, value.clone(), metadata.clone());

        let store_long_term = metadata
            .get("store_long_term")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        if store_long_term {
            let embedding = generate_embedding(&value);
            self.long_term.store(key, value, embedding, metadata);
        }
    }

    /// Retrieve memories for a query across the tiers, caching the
    /// combined result.
    pub async fn recall(
        &self,
        query: &str,
        actor: &str,
        options: RecallOptions,
    ) -> Vec<MemoryItem> {
        self.audit
            .log_access(
                &format!("query_{query}"),
                actor,
                "read",
                "pending",
                HashMap::new(),
            )
            .await;

        if let (Some(cached), true) = self.cache.get(query) {
            return match serde_json::from_value::<Vec<MemoryItem>>(cached.clone()) {
                Ok(items) => items,
                Err(_) => vec![MemoryItem::new(query, cached, HashMap::new())],
            };
        }

        let mut results = self.short_term.search(query);

        if results.len() < RECALL_LIMIT {
            let query_embedding = generate_embedding(&Value::String(query.to_string()));
            results.extend(
                self.long_term
                    .search(&query_embedding, RECALL_LIMIT - results.len()),
            );
        }

        if options.include_shared {
            results.extend(self.shared.search(query));
        }

        if let Ok(value) = serde_json::to_value(&results) {
            self.cache.set(query, value);
        }

        let mut metadata = HashMap::new();
        metadata.insert("result_count".to_string(), Value::from(results.len()));
        self.audit
            .log_access(&format!("query_{query}"), actor, "read", "success", metadata)
            .await;

        results
    }

    /// Value of a key's aggregate at a point in time.
    pub fn time_travel(&self, key: &str, at: DateTime<Utc>) -> Option<Value> {
        self.event_store.state_at(key, at).current_value
    }

    /// Complete timeline of changes and accesses for a key.
    pub fn memory_timeline(&self, key: &str, start: Option<DateTime<Utc>>) -> Vec<Event> {
        self.audit.access_history(key, start, None)
    }

    pub async fn apply_retention_policy(&self) -> RetentionSweep {
        self.audit.apply_retention().await
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            event_count: self.event_store.event_count(),
            aggregate_count: self.event_store.aggregate_count(),
            cache: self.cache.stats(),
            short_term_size: self.short_term.len(),
            long_term_size: self.long_term.len(),
            shared_size: self.shared.len(),
        }
    }

    /// Remove a user's entries from every tier and the cache. Returns the
    /// number of entries removed.
    pub(crate) fn purge_user(&self, user_id: &str) -> usize {
        let mut keys = self.short_term.remove_user(user_id);
        keys.extend(self.long_term.remove_user(user_id));
        keys.extend(self.shared.remove_user(user_id));

        let removed = keys.len();
        for key in &keys {
            self.cache.remove(key);
        }
        let marker = format!("user_{user_id}");
        for key in self.cache.keys() {
            if key.contains(&marker) {
                self.cache.remove(&key);
            }
        }
        removed
    }
}
