/// Integration tests for the orchestrator:
/// - Spawn admission (capacity, unknown type/parent, spawn rights)
/// - Cascade termination and idempotence
/// - Pause/resume with no message loss
/// - Message delivery and broadcast filtering
/// - Health checks and errored-agent recovery
/// - Hierarchy views and batch spawn
use async_trait::async_trait;
use meridian_core::agent::{
    Agent, AgentHandle, AgentPayload, AgentStatus, Capability, LoggingAgent,
};
use meridian_core::config::RuntimeConfig;
use meridian_core::errors::{AgentError, AgentResult, OrchestratorError};
use meridian_core::orchestrator::{Orchestrator, SpawnRequest, SYSTEM_TOPIC};
use meridian_core::queue::{Message, MessageQueue};
use meridian_core::registry::{AgentFactory, AgentRegistry};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

type MessageLog = Arc<parking_lot::Mutex<Vec<Message>>>;

/// Agent that records every message it processes.
struct RecorderAgent {
    log: MessageLog,
}

#[async_trait]
impl Agent for RecorderAgent {
    async fn process_message(&mut self, message: &Message) -> AgentResult<()> {
        self.log.lock().push(message.clone());
        Ok(())
    }
}

/// Agent that fails on messages tagged "explode".
struct FlakyAgent;

#[async_trait]
impl Agent for FlakyAgent {
    async fn process_message(&mut self, message: &Message) -> AgentResult<()> {
        if message.message_type.as_deref() == Some("explode") {
            return Err(AgentError::ProcessingFailed("boom".to_string()));
        }
        Ok(())
    }
}

fn setup(max_agents: usize) -> (Arc<MessageQueue>, Arc<AgentRegistry>, Arc<Orchestrator>) {
    let queue = MessageQueue::new();
    let registry = AgentRegistry::new();
    let config = RuntimeConfig {
        max_concurrent_agents: max_agents,
        ..RuntimeConfig::default()
    };
    let orchestrator = Orchestrator::new(Arc::clone(&queue), Arc::clone(&registry), &config);

    let factory: AgentFactory = Arc::new(|| Box::<LoggingAgent>::default());
    registry.register_type("research", factory);

    (queue, registry, orchestrator)
}

fn recorder_factory(log: &MessageLog) -> AgentFactory {
    let log = Arc::clone(log);
    Arc::new(move || {
        Box::new(RecorderAgent {
            log: Arc::clone(&log),
        })
    })
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(300)).await;
}

// ============================================================================
// Spawn admission
// ============================================================================

#[tokio::test]
async fn spawn_registers_a_ready_agent() {
    let (_, registry, orchestrator) = setup(10);

    let id = orchestrator
        .spawn(SpawnRequest::new("research", vec![Capability::WebSearch]))
        .await
        .unwrap();

    let handle = registry.get(id).unwrap();
    assert_eq!(handle.status(), AgentStatus::Ready);
    assert_eq!(handle.agent_type, "research");
    assert_eq!(orchestrator.active_count(), 1);
}

#[tokio::test]
async fn spawn_rejects_unknown_type() {
    let (_, _, orchestrator) = setup(10);
    let refused = orchestrator
        .spawn(SpawnRequest::new("time_traveler", vec![]))
        .await;
    assert!(matches!(refused, Err(OrchestratorError::UnknownType(_))));
}

#[tokio::test]
async fn spawn_rejects_unknown_parent() {
    let (_, _, orchestrator) = setup(10);
    let refused = orchestrator
        .spawn(SpawnRequest::new("research", vec![]).with_parent(Uuid::new_v4()))
        .await;
    assert!(matches!(refused, Err(OrchestratorError::UnknownParent(_))));
}

#[tokio::test]
async fn spawn_respects_parent_spawn_rights() {
    let (_, registry, orchestrator) = setup(10);
    let parent = AgentHandle::with_spawn_rights(
        "research",
        vec![],
        None,
        false,
        Box::<LoggingAgent>::default(),
    );
    let parent_id = parent.id;
    registry.register(parent).unwrap();

    let refused = orchestrator
        .spawn(SpawnRequest::new("research", vec![]).with_parent(parent_id))
        .await;
    assert!(matches!(
        refused,
        Err(OrchestratorError::ParentCannotSpawn(_))
    ));
}

#[tokio::test]
async fn capacity_boundary_is_exact() {
    let (_, _, orchestrator) = setup(2);

    orchestrator
        .spawn(SpawnRequest::new("research", vec![]))
        .await
        .unwrap();
    orchestrator
        .spawn(SpawnRequest::new("research", vec![]))
        .await
        .unwrap();

    let refused = orchestrator.spawn(SpawnRequest::new("research", vec![])).await;
    assert!(matches!(
        refused,
        Err(OrchestratorError::CapacityExceeded(2))
    ));
}

#[tokio::test]
async fn batch_spawn_is_fail_fast() {
    let (_, _, orchestrator) = setup(10);

    let result = orchestrator
        .spawn_parallel(vec![
            SpawnRequest::new("research", vec![]),
            SpawnRequest::new("research", vec![]),
            SpawnRequest::new("time_traveler", vec![]),
            SpawnRequest::new("research", vec![]),
        ])
        .await;

    assert_eq!(result.spawned.len(), 2);
    let (index, error) = result.failure.unwrap();
    assert_eq!(index, 2);
    assert!(matches!(error, OrchestratorError::UnknownType(_)));
    assert_eq!(orchestrator.active_count(), 2);
}

// ============================================================================
// Termination
// ============================================================================

#[tokio::test]
async fn terminate_cascades_to_descendants_post_order() {
    let (queue, registry, orchestrator) = setup(10);

    let a = orchestrator
        .spawn(SpawnRequest::new("research", vec![]))
        .await
        .unwrap();
    let b = orchestrator
        .spawn(SpawnRequest::new("research", vec![]).with_parent(a))
        .await
        .unwrap();
    let c = orchestrator
        .spawn(SpawnRequest::new("research", vec![]).with_parent(b))
        .await
        .unwrap();

    let handles: Vec<_> = [a, b, c]
        .iter()
        .map(|id| registry.get(*id).unwrap())
        .collect();

    orchestrator.terminate(a).await;

    for id in [a, b, c] {
        assert!(registry.get(id).is_none());
    }
    for handle in &handles {
        assert_eq!(handle.status(), AgentStatus::Terminated);
    }
    assert_eq!(orchestrator.active_count(), 0);

    let mut terminated_order = Vec::new();
    while let Some(event) = queue.consume(SYSTEM_TOPIC, Some(Duration::from_millis(50))).await {
        if event.payload["type"] == json!("agent_terminated") {
            terminated_order.push(event.payload["agent_id"].as_str().unwrap().to_string());
        }
    }
    assert_eq!(
        terminated_order,
        vec![c.to_string(), b.to_string(), a.to_string()]
    );
}

#[tokio::test]
async fn terminate_is_idempotent() {
    let (_, _, orchestrator) = setup(10);
    let id = orchestrator
        .spawn(SpawnRequest::new("research", vec![]))
        .await
        .unwrap();

    orchestrator.terminate(id).await;
    orchestrator.terminate(id).await;
    orchestrator.terminate(Uuid::new_v4()).await;
    assert_eq!(orchestrator.active_count(), 0);
}

// ============================================================================
// Messaging
// ============================================================================

#[tokio::test]
async fn sent_messages_reach_the_processing_loop() {
    let (_, registry, orchestrator) = setup(10);
    let log: MessageLog = Arc::new(parking_lot::Mutex::new(Vec::new()));
    registry.register_type("recorder", recorder_factory(&log));

    let sender = orchestrator
        .spawn(SpawnRequest::new("research", vec![]))
        .await
        .unwrap();
    let receiver = orchestrator
        .spawn(SpawnRequest::new("recorder", vec![]))
        .await
        .unwrap();

    orchestrator
        .send(
            sender,
            receiver,
            AgentPayload::new("task_assignment", json!({ "work": "summarize" })),
        )
        .await;
    settle().await;

    let seen = log.lock().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].source, Some(sender));
    assert_eq!(seen[0].target, Some(receiver));
    assert_eq!(seen[0].payload["type"], json!("task_assignment"));
    assert_eq!(seen[0].payload["data"]["work"], json!("summarize"));
}

#[tokio::test]
async fn broadcast_respects_capability_filter_and_skips_sender() {
    let (_, registry, orchestrator) = setup(10);
    let log: MessageLog = Arc::new(parking_lot::Mutex::new(Vec::new()));
    registry.register_type("recorder", recorder_factory(&log));

    let sender = orchestrator
        .spawn(SpawnRequest::new("recorder", vec![Capability::WebSearch]))
        .await
        .unwrap();
    let searcher = orchestrator
        .spawn(SpawnRequest::new("recorder", vec![Capability::WebSearch]))
        .await
        .unwrap();
    let analyst = orchestrator
        .spawn(SpawnRequest::new("recorder", vec![Capability::Analysis]))
        .await
        .unwrap();

    orchestrator
        .broadcast(
            sender,
            AgentPayload::new("filtered", json!({})),
            Some(Capability::WebSearch),
        )
        .await;
    settle().await;

    let filtered_targets: Vec<_> = log
        .lock()
        .iter()
        .filter(|m| m.payload["type"] == json!("filtered"))
        .map(|m| m.target.unwrap())
        .collect();
    assert_eq!(filtered_targets, vec![searcher]);

    orchestrator
        .broadcast(sender, AgentPayload::new("general", json!({})), None)
        .await;
    settle().await;

    let mut general_targets: Vec<_> = log
        .lock()
        .iter()
        .filter(|m| m.payload["type"] == json!("general"))
        .map(|m| m.target.unwrap())
        .collect();
    general_targets.sort();
    let mut expected = vec![searcher, analyst];
    expected.sort();
    assert_eq!(general_targets, expected);
}

// ============================================================================
// Pause and resume
// ============================================================================

#[tokio::test]
async fn paused_agent_requeues_messages_without_loss() {
    let (_, registry, orchestrator) = setup(10);
    let log: MessageLog = Arc::new(parking_lot::Mutex::new(Vec::new()));
    registry.register_type("recorder", recorder_factory(&log));

    let sender = orchestrator
        .spawn(SpawnRequest::new("research", vec![]))
        .await
        .unwrap();
    let receiver = orchestrator
        .spawn(SpawnRequest::new("recorder", vec![]))
        .await
        .unwrap();

    orchestrator.pause(receiver).await.unwrap();
    assert_eq!(registry.get(receiver).unwrap().status(), AgentStatus::Paused);

    orchestrator
        .send(sender, receiver, AgentPayload::new("while_paused", json!({})))
        .await;
    settle().await;
    assert!(log.lock().is_empty());

    orchestrator.resume(receiver).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let seen = log.lock().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].payload["type"], json!("while_paused"));
    assert_eq!(registry.get(receiver).unwrap().status(), AgentStatus::Ready);
}

// ============================================================================
// Health
// ============================================================================

#[tokio::test]
async fn errored_agents_are_restarted_by_health_check() {
    let (_, registry, orchestrator) = setup(10);
    let factory: AgentFactory = Arc::new(|| Box::new(FlakyAgent));
    registry.register_type("flaky", factory);

    let sender = orchestrator
        .spawn(SpawnRequest::new("research", vec![]))
        .await
        .unwrap();
    let flaky = orchestrator
        .spawn(SpawnRequest::new("flaky", vec![]))
        .await
        .unwrap();

    orchestrator
        .send(sender, flaky, AgentPayload::new("explode", json!({})))
        .await;
    settle().await;
    assert_eq!(registry.get(flaky).unwrap().status(), AgentStatus::Error);

    let report = orchestrator.health_check().await;
    assert!(report.recovery_attempted.contains(&flaky));
    assert!(report.unhealthy >= 1);
    assert_eq!(registry.get(flaky).unwrap().status(), AgentStatus::Ready);

    let healthy_report = orchestrator.health_check().await;
    assert_eq!(healthy_report.total, 2);
    assert_eq!(healthy_report.healthy, 2);
}

// ============================================================================
// Hierarchy view
// ============================================================================

#[tokio::test]
async fn tree_reflects_parent_child_structure() {
    let (_, _, orchestrator) = setup(10);

    let root = orchestrator
        .spawn(SpawnRequest::new(
            "research",
            vec![Capability::StrategicPlanning],
        ))
        .await
        .unwrap();
    let left = orchestrator
        .spawn(SpawnRequest::new("research", vec![]).with_parent(root))
        .await
        .unwrap();
    let right = orchestrator
        .spawn(SpawnRequest::new("research", vec![]).with_parent(root))
        .await
        .unwrap();

    let roots = orchestrator.tree(None);
    assert_eq!(roots.len(), 1);
    assert_eq!(roots[0].id, root);
    assert_eq!(roots[0].capabilities, vec![Capability::StrategicPlanning]);

    let mut child_ids: Vec<_> = roots[0].children.iter().map(|n| n.id).collect();
    child_ids.sort();
    let mut expected = vec![left, right];
    expected.sort();
    assert_eq!(child_ids, expected);

    let subtree = orchestrator.tree(Some(left));
    assert_eq!(subtree.len(), 1);
    assert!(subtree[0].children.is_empty());

    assert!(orchestrator.tree(Some(Uuid::new_v4())).is_empty());
}

// ============================================================================
// Background spawn queue
// ============================================================================

#[tokio::test]
async fn queued_spawns_publish_completion_events() {
    let (queue, _, orchestrator) = setup(10);
    orchestrator.start();

    orchestrator.enqueue_spawn(SpawnRequest::new("research", vec![]));
    orchestrator.enqueue_spawn(SpawnRequest::new("time_traveler", vec![]));
    settle().await;

    let mut event_types = Vec::new();
    while let Some(event) = queue.consume(SYSTEM_TOPIC, Some(Duration::from_millis(50))).await {
        event_types.push(event.payload["type"].as_str().unwrap_or("").to_string());
    }
    assert!(event_types.contains(&"spawn_completed".to_string()));
    assert!(event_types.contains(&"spawn_failed".to_string()));
    assert_eq!(orchestrator.active_count(), 1);

    orchestrator.shutdown().await;
    assert_eq!(orchestrator.active_count(), 0);
}
