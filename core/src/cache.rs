//! Bounded cache with access-pattern prediction.
//!
//! Every `get` is recorded in a per-key access history. Misses schedule a
//! background prefetch of the keys most likely to be wanted next, derived
//! from sequences of recent accesses. Eviction keeps the lowest-scoring
//! entries out based on a weighted access-probability estimate.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Length of the access sequences mined for prediction.
const SEQUENCE_LENGTH: usize = 10;

/// Predictions returned per miss.
const PREDICTION_LIMIT: usize = 5;

/// Eviction target as a fraction of capacity.
const EVICTION_WATERMARK: f64 = 0.9;

/// Pluggable backing-storage fetch used by prefetch. Default: nothing.
pub type StorageFetcher = Arc<dyn Fn(String) -> BoxFuture<'static, Option<Value>> + Send + Sync>;

/// One cached value with its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: Value,
    pub hits: u64,
    pub last_access: DateTime<Utc>,
    pub created: DateTime<Utc>,
}

/// Cache statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub utilization: f64,
    pub total_hits: u64,
    pub total_accesses: usize,
    pub hit_rate: f64,
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    access_history: HashMap<String, Vec<DateTime<Utc>>>,
}

/// Cache with predictive prefetching based on access patterns.
pub struct PredictiveCache {
    capacity: usize,
    inner: parking_lot::Mutex<CacheInner>,
    fetcher: parking_lot::RwLock<Option<StorageFetcher>>,
}

impl PredictiveCache {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: capacity.max(1),
            inner: parking_lot::Mutex::new(CacheInner {
                entries: HashMap::new(),
                access_history: HashMap::new(),
            }),
            fetcher: parking_lot::RwLock::new(None),
        })
    }

    /// Install the backing-storage fetch used by background prefetch.
    pub fn set_fetcher(&self, fetcher: StorageFetcher) {
        *self.fetcher.write() = Some(fetcher);
    }

    /// Look up a key. The access is recorded either way; a miss schedules a
    /// background prefetch of predicted-related keys.
    pub fn get(self: &Arc<Self>, key: &str) -> (Option<Value>, bool) {
        let now = Utc::now();
        let (value, predictions) = {
            let mut inner = self.inner.lock();
            inner
                .access_history
                .entry(key.to_string())
                .or_default()
                .push(now);

            if let Some(entry) = inner.entries.get_mut(key) {
                entry.hits += 1;
                entry.last_access = now;
                (Some(entry.value.clone()), Vec::new())
            } else {
                let predictions = predict_next(key, &inner.access_history);
                (None, predictions)
            }
        };

        match value {
            Some(value) => (Some(value), true),
            None => {
                if !predictions.is_empty() {
                    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                        let cache = Arc::clone(self);
                        runtime.spawn(async move {
                            cache.prefetch(predictions).await;
                        });
                    }
                }
                (None, false)
            }
        }
    }

    /// Store a value, evicting low-probability entries first when at
    /// capacity.
    pub fn set(&self, key: &str, value: Value) {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        if !inner.entries.contains_key(key) && inner.entries.len() >= self.capacity {
            self.evict_locked(&mut inner, now);
        }
        inner.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                hits: 0,
                last_access: now,
                created: now,
            },
        );
    }

    /// Keys predicted to be accessed after `key`, ranked by frequency.
    pub fn predict_related(&self, key: &str) -> Vec<String> {
        predict_next(key, &self.inner.lock().access_history)
    }

    pub fn remove(&self, key: &str) -> bool {
        self.inner.lock().entries.remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let total_hits: u64 = inner.entries.values().map(|e| e.hits).sum();
        let total_accesses: usize = inner.access_history.values().map(Vec::len).sum();
        CacheStats {
            size: inner.entries.len(),
            capacity: self.capacity,
            utilization: inner.entries.len() as f64 / self.capacity as f64,
            total_hits,
            total_accesses,
            hit_rate: if total_accesses > 0 {
                total_hits as f64 / total_accesses as f64
            } else {
                0.0
            },
        }
    }

    async fn prefetch(self: Arc<Self>, keys: Vec<String>) {
        let fetcher = match self.fetcher.read().clone() {
            Some(fetcher) => fetcher,
            None => return,
        };
        for key in keys {
            if self.contains(&key) {
                continue;
            }
            if let Some(value) = fetcher(key.clone()).await {
                tracing::debug!(%key, "prefetched predicted key");
                self.set(&key, value);
            }
        }
    }

    /// Evict the lowest access-probability entries until the cache holds at
    /// most `EVICTION_WATERMARK * capacity` entries.
    fn evict_locked(&self, inner: &mut CacheInner, now: DateTime<Utc>) {
        let target = (self.capacity as f64 * EVICTION_WATERMARK) as usize;
        if inner.entries.len() <= target {
            return;
        }

        let mut scored: Vec<(String, f64)> = inner
            .entries
            .iter()
            .map(|(key, entry)| {
                let frequency = inner
                    .access_history
                    .get(key)
                    .map(Vec::len)
                    .unwrap_or(0);
                (
                    key.clone(),
                    access_probability(entry, frequency, now),
                )
            })
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

        let evict_count = inner.entries.len() - target;
        for (key, _) in scored.into_iter().take(evict_count) {
            inner.entries.remove(&key);
            tracing::trace!(%key, "evicted cache entry");
        }
    }
}

/// Probability that an entry will be accessed again, from hit count,
/// recency and overall access frequency. Clamped to [0, 1].
fn access_probability(entry: &CacheEntry, frequency: usize, now: DateTime<Utc>) -> f64 {
    let recency_seconds = (now - entry.last_access).num_seconds().max(0) as f64;
    let recency_score = (1.0 - recency_seconds / 3600.0).max(0.0);
    let score = 0.4 * (entry.hits as f64 / 10.0).min(1.0)
        + 0.3 * recency_score
        + 0.3 * (frequency as f64 / 20.0).min(1.0);
    score.clamp(0.0, 1.0)
}

/// Mine the access history for length-10 sequences containing `key` and
/// rank the keys observed immediately after it.
fn predict_next(key: &str, history: &HashMap<String, Vec<DateTime<Utc>>>) -> Vec<String> {
    let mut accesses: Vec<(DateTime<Utc>, &str)> = history
        .iter()
        .flat_map(|(k, timestamps)| timestamps.iter().map(move |ts| (*ts, k.as_str())))
        .collect();
    accesses.sort_by_key(|(ts, _)| *ts);

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for window in accesses.windows(SEQUENCE_LENGTH) {
        for (index, (_, k)) in window.iter().enumerate() {
            if *k == key && index + 1 < window.len() {
                *counts.entry(window[index + 1].1).or_default() += 1;
            }
        }
    }

    let mut ranked: Vec<(&str, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    ranked
        .into_iter()
        .take(PREDICTION_LIMIT)
        .map(|(k, _)| k.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn recent_hot_entries_score_higher() {
        let now = Utc::now();
        let hot = CacheEntry {
            value: json!(1),
            hits: 20,
            last_access: now,
            created: now,
        };
        let cold = CacheEntry {
            value: json!(2),
            hits: 0,
            last_access: now - chrono::Duration::hours(2),
            created: now - chrono::Duration::hours(3),
        };
        assert!(access_probability(&hot, 40, now) > access_probability(&cold, 1, now));
        assert!(access_probability(&hot, 40, now) <= 1.0);
    }

    #[test]
    fn prediction_ranks_followers_by_frequency() {
        let base = Utc::now();
        let mut history: HashMap<String, Vec<DateTime<Utc>>> = HashMap::new();
        // a -> b repeated, with one a -> c; sequences need at least 10
        // accesses in total.
        for round in 0..6 {
            let offset = round * 3;
            history
                .entry("a".to_string())
                .or_default()
                .push(base + chrono::Duration::milliseconds(offset));
            let follower = if round == 2 { "c" } else { "b" };
            history
                .entry(follower.to_string())
                .or_default()
                .push(base + chrono::Duration::milliseconds(offset + 1));
            history
                .entry("x".to_string())
                .or_default()
                .push(base + chrono::Duration::milliseconds(offset + 2));
        }

        let predictions = predict_next("a", &history);
        assert_eq!(predictions.first().map(String::as_str), Some("b"));
        assert!(predictions.contains(&"c".to_string()));
    }
}
