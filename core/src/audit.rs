//! Access auditing and retention over the event store.
//!
//! Accesses are logged as events on the resource's aggregate. The retention
//! sweep walks every stored event and, once an event has outlived its data
//! class's retention period, anonymises it in place when it carries PII and
//! removes it otherwise.

use crate::events::{Event, EventStore, EventType};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

/// Data fields treated as PII during anonymisation.
const PII_FIELDS: [&str; 5] = ["name", "email", "phone", "address", "ssn"];

/// Deterministic 16-hex-character hash used for anonymisation.
pub fn hash_identifier(identifier: &str) -> String {
    let digest = Sha256::digest(identifier.as_bytes());
    hex::encode(digest)[..16].to_string()
}

fn hash_value(value: &Value) -> String {
    match value {
        Value::String(s) => hash_identifier(s),
        other => hash_identifier(&other.to_string()),
    }
}

/// Counts returned by a retention sweep.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RetentionSweep {
    pub removed: usize,
    pub anonymized: usize,
}

/// Audit trail with per-class retention policies.
pub struct AuditTrail {
    store: Arc<EventStore>,
    policies: HashMap<String, Duration>,
    default_retention: Duration,
}

impl AuditTrail {
    pub fn new(store: Arc<EventStore>) -> Self {
        let mut policies = HashMap::new();
        policies.insert("gdpr_personal_data".to_string(), Duration::days(365));
        policies.insert("system_logs".to_string(), Duration::days(90));
        policies.insert("research_data".to_string(), Duration::days(1825));
        Self {
            store,
            policies,
            default_retention: Duration::days(90),
        }
    }

    /// Override retention periods per data class (days).
    pub fn with_policies(
        store: Arc<EventStore>,
        retention_days: &HashMap<String, i64>,
        default_days: i64,
    ) -> Self {
        let mut trail = Self::new(store);
        for (class, days) in retention_days {
            trail
                .policies
                .insert(class.clone(), Duration::days(*days));
        }
        trail.default_retention = Duration::days(default_days);
        trail
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    /// Retention period for a data class; unknown classes get the default.
    pub fn retention_for(&self, data_type: &str) -> Duration {
        self.policies
            .get(data_type)
            .copied()
            .unwrap_or(self.default_retention)
    }

    /// Log an access to a resource. A "read" action produces a
    /// MEMORY_READ event, anything else a MEMORY_WRITE.
    pub async fn log_access(
        &self,
        resource_id: &str,
        accessor: &str,
        action: &str,
        result: &str,
        metadata: HashMap<String, Value>,
    ) -> String {
        let event_type = if action == "read" {
            EventType::MemoryRead
        } else {
            EventType::MemoryWrite
        };
        let event = Event::new(
            self.store.next_event_id(),
            event_type,
            resource_id,
            json!({ "action": action, "result": result, "accessor": accessor }),
            accessor,
            metadata,
        );
        let id = event.id.clone();
        self.store.append(event).await;
        id
    }

    /// Access history for a resource, optionally windowed by time.
    pub fn access_history(
        &self,
        resource_id: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Vec<Event> {
        self.store
            .stream(resource_id)
            .into_iter()
            .filter(|e| start.map_or(true, |s| e.timestamp >= s))
            .filter(|e| end.map_or(true, |t| e.timestamp <= t))
            .collect()
    }

    /// Apply retention policies to every stored event. Events at or past
    /// their class boundary are anonymised (PII) or removed (everything
    /// else); younger events survive untouched.
    pub async fn apply_retention(&self) -> RetentionSweep {
        let now = Utc::now();
        let mut sweep = RetentionSweep::default();

        for event in self.store.all_events() {
            let data_type = event
                .metadata
                .get("data_type")
                .and_then(Value::as_str)
                .unwrap_or("system_logs");
            if now - event.timestamp < self.retention_for(data_type) {
                continue;
            }

            if self.anonymize_or_remove(&event) {
                sweep.anonymized += 1;
            } else {
                sweep.removed += 1;
            }
        }

        if sweep.removed > 0 || sweep.anonymized > 0 {
            tracing::info!(
                removed = sweep.removed,
                anonymized = sweep.anonymized,
                "retention sweep applied"
            );
        }
        sweep
    }

    /// Anonymise an event in place when it carries PII (returns true),
    /// remove it otherwise (returns false).
    pub(crate) fn anonymize_or_remove(&self, event: &Event) -> bool {
        let contains_pii = event
            .metadata
            .get("contains_pii")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        if contains_pii {
            self.store
                .replace_event(&event.id, self.anonymize_event(event));
            true
        } else {
            self.store.remove_event(&event.id);
            false
        }
    }

    /// Hashed variant of an event: actor hashed, PII fields in the data
    /// replaced by the 16-hex-char hash of their original value.
    pub fn anonymize_event(&self, event: &Event) -> Event {
        let mut anonymized = event.clone();
        anonymized.actor = hash_identifier(&event.actor);
        if let Value::Object(fields) = &mut anonymized.data {
            for pii in PII_FIELDS {
                if let Some(value) = fields.get(pii) {
                    let hashed = hash_value(value);
                    fields.insert(pii.to_string(), Value::String(hashed));
                }
            }
        }
        anonymized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic_and_sixteen_hex_chars() {
        let a = hash_identifier("alice@example.com");
        let b = hash_identifier("alice@example.com");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, hash_identifier("bob@example.com"));
    }

    #[test]
    fn anonymize_replaces_pii_fields_and_actor() {
        let store = Arc::new(EventStore::new());
        let trail = AuditTrail::new(Arc::clone(&store));
        let mut metadata = HashMap::new();
        metadata.insert("contains_pii".to_string(), Value::Bool(true));
        let event = Event::new(
            store.next_event_id(),
            EventType::MemoryWrite,
            "profile-1",
            json!({ "name": "Alice", "email": "alice@example.com", "note": "keep" }),
            "collector",
            metadata,
        );

        let anonymized = trail.anonymize_event(&event);
        assert_eq!(anonymized.actor, hash_identifier("collector"));
        assert_eq!(anonymized.data["name"], json!(hash_identifier("Alice")));
        assert_eq!(
            anonymized.data["email"],
            json!(hash_identifier("alice@example.com"))
        );
        assert_eq!(anonymized.data["note"], json!("keep"));
        assert_eq!(anonymized.id, event.id);
    }

    #[test]
    fn unknown_class_gets_default_retention() {
        let trail = AuditTrail::new(Arc::new(EventStore::new()));
        assert_eq!(trail.retention_for("something_else"), Duration::days(90));
        assert_eq!(
            trail.retention_for("research_data"),
            Duration::days(1825)
        );
    }
}
