/// Integration tests for audit logging and retention:
/// - Access logging as read/write events
/// - History windowing
/// - Retention sweep: removal, anonymisation, and the exact age boundary
use chrono::{Duration as ChronoDuration, Utc};
use meridian_core::audit::{hash_identifier, AuditTrail};
use meridian_core::events::{Event, EventStore, EventType};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

fn aged_event(
    store: &EventStore,
    aggregate: &str,
    age_days: i64,
    data: Value,
    metadata: HashMap<String, Value>,
) -> Event {
    let mut event = Event::new(
        store.next_event_id(),
        EventType::MemoryWrite,
        aggregate,
        data,
        "collector",
        metadata,
    );
    event.timestamp = Utc::now() - ChronoDuration::days(age_days);
    event
}

fn metadata(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

// ============================================================================
// Access logging
// ============================================================================

#[tokio::test]
async fn read_and_write_actions_map_to_event_types() {
    let store = Arc::new(EventStore::new());
    let trail = AuditTrail::new(Arc::clone(&store));

    trail
        .log_access("resource-1", "alice", "read", "success", HashMap::new())
        .await;
    trail
        .log_access("resource-1", "bob", "update", "success", HashMap::new())
        .await;

    let history = trail.access_history("resource-1", None, None);
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].event_type, EventType::MemoryRead);
    assert_eq!(history[1].event_type, EventType::MemoryWrite);
    assert_eq!(history[0].data["accessor"], json!("alice"));
}

#[tokio::test]
async fn access_history_windows_by_time() {
    let store = Arc::new(EventStore::new());
    let trail = AuditTrail::new(Arc::clone(&store));

    trail
        .log_access("resource-2", "alice", "read", "success", HashMap::new())
        .await;
    let cutoff = Utc::now();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    trail
        .log_access("resource-2", "alice", "read", "success", HashMap::new())
        .await;

    assert_eq!(trail.access_history("resource-2", None, None).len(), 2);
    assert_eq!(
        trail.access_history("resource-2", Some(cutoff), None).len(),
        1
    );
    assert_eq!(
        trail.access_history("resource-2", None, Some(cutoff)).len(),
        1
    );
}

// ============================================================================
// Retention sweep
// ============================================================================

#[tokio::test]
async fn expired_events_are_removed_or_anonymized_by_pii_flag() {
    let store = Arc::new(EventStore::new());
    let trail = AuditTrail::new(Arc::clone(&store));

    store
        .append(aged_event(
            &store,
            "old-log",
            91,
            json!({ "note": "plain system log" }),
            metadata(&[("data_type", json!("system_logs"))]),
        ))
        .await;
    store
        .append(aged_event(
            &store,
            "old-profile",
            366,
            json!({ "name": "Alice", "email": "alice@example.com" }),
            metadata(&[
                ("data_type", json!("gdpr_personal_data")),
                ("contains_pii", json!(true)),
            ]),
        ))
        .await;
    store
        .append(aged_event(
            &store,
            "young-log",
            1,
            json!({ "note": "recent" }),
            metadata(&[("data_type", json!("system_logs"))]),
        ))
        .await;

    let sweep = trail.apply_retention().await;
    assert_eq!(sweep.removed, 1);
    assert_eq!(sweep.anonymized, 1);

    assert!(store.stream("old-log").is_empty());
    assert_eq!(store.stream("young-log").len(), 1);

    let anonymized = &store.stream("old-profile")[0];
    assert_eq!(anonymized.actor, hash_identifier("collector"));
    assert_eq!(anonymized.data["name"], json!(hash_identifier("Alice")));
    assert_eq!(
        anonymized.data["email"],
        json!(hash_identifier("alice@example.com"))
    );
}

#[tokio::test]
async fn retention_boundary_is_inclusive() {
    let store = Arc::new(EventStore::new());
    let trail = AuditTrail::new(Arc::clone(&store));

    // Exactly at the 90-day boundary: swept.
    store
        .append(aged_event(
            &store,
            "at-boundary",
            90,
            json!({ "note": "boundary" }),
            metadata(&[("data_type", json!("system_logs"))]),
        ))
        .await;
    // A hair younger than the boundary: survives.
    let mut younger = aged_event(
        &store,
        "under-boundary",
        0,
        json!({ "note": "younger" }),
        metadata(&[("data_type", json!("system_logs"))]),
    );
    younger.timestamp = Utc::now() - ChronoDuration::days(90) + ChronoDuration::seconds(5);
    store.append(younger).await;

    let sweep = trail.apply_retention().await;
    assert_eq!(sweep.removed, 1);
    assert!(store.stream("at-boundary").is_empty());
    assert_eq!(store.stream("under-boundary").len(), 1);
}

#[tokio::test]
async fn retention_respects_policy_overrides() {
    let store = Arc::new(EventStore::new());
    let mut overrides = HashMap::new();
    overrides.insert("system_logs".to_string(), 10_i64);
    let trail = AuditTrail::with_policies(Arc::clone(&store), &overrides, 30);

    store
        .append(aged_event(
            &store,
            "short-lived",
            11,
            json!({ "note": "x" }),
            metadata(&[("data_type", json!("system_logs"))]),
        ))
        .await;
    store
        .append(aged_event(
            &store,
            "unclassified",
            31,
            json!({ "note": "y" }),
            HashMap::new(),
        ))
        .await;

    trail.apply_retention().await;
    assert!(store.stream("short-lived").is_empty());
    // Metadata-less events fall into the system_logs class (10-day
    // override), so at 31 days this is swept too.
    assert!(store.stream("unclassified").is_empty());
}
