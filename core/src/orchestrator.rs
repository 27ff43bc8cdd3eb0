//! Agent lifecycle orchestration: spawn admission, parent/child hierarchy,
//! messaging, pause/resume, cascade termination and health supervision.
//!
//! Each live agent gets a kernel-driven message loop consuming its
//! `agent.<id>` topic. Two background loops run alongside: a spawn-queue
//! drainer and a periodic health sweep that restarts agents stuck in
//! ERROR.

use crate::agent::{AgentContext, AgentHandle, AgentId, AgentPayload, AgentStatus, Capability};
use crate::config::RuntimeConfig;
use crate::errors::{OrchestratorError, OrchestratorResult};
use crate::queue::{Message, MessagePriority, MessageQueue};
use crate::registry::AgentRegistry;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Topic carrying orchestration events (spawn, pause, terminate, health).
pub const SYSTEM_TOPIC: &str = "system";

/// In-box backlog beyond which an agent is considered unhealthy.
const INBOX_BACKLOG_LIMIT: usize = 100;

/// Poll interval of the per-agent message loop.
const INBOX_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Pause backoff before the next in-box poll.
const PAUSE_BACKOFF: Duration = Duration::from_millis(100);

fn default_spawn_priority() -> u8 {
    5
}

/// Request to spawn a new agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub agent_type: String,
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub context: AgentContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<AgentId>,
    #[serde(default = "default_spawn_priority")]
    pub priority: u8,
}

impl SpawnRequest {
    pub fn new(agent_type: impl Into<String>, capabilities: Vec<Capability>) -> Self {
        Self {
            agent_type: agent_type.into(),
            capabilities,
            context: AgentContext::default(),
            parent_id: None,
            priority: default_spawn_priority(),
        }
    }

    pub fn with_context(mut self, context: AgentContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_parent(mut self, parent_id: AgentId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }
}

/// Result of a batch spawn. Admission is fail-fast: `spawned` holds the
/// ids created before the first failure, in request order.
#[derive(Debug)]
pub struct ParallelSpawn {
    pub spawned: Vec<AgentId>,
    pub failure: Option<(usize, OrchestratorError)>,
}

/// One node of the agent hierarchy view.
#[derive(Debug, Clone, Serialize)]
pub struct TreeNode {
    pub id: AgentId,
    #[serde(rename = "type")]
    pub agent_type: String,
    pub status: AgentStatus,
    pub capabilities: Vec<Capability>,
    pub children: Vec<TreeNode>,
}

/// Outcome of one health sweep.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub recovery_attempted: Vec<AgentId>,
}

struct AgentLoop {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Orchestrates the multi-agent system.
pub struct Orchestrator {
    queue: Arc<MessageQueue>,
    registry: Arc<AgentRegistry>,
    active: parking_lot::Mutex<HashSet<AgentId>>,
    max_concurrent: usize,
    health_interval: Duration,
    loops: DashMap<AgentId, AgentLoop>,
    spawn_tx: mpsc::UnboundedSender<SpawnRequest>,
    spawn_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<SpawnRequest>>>,
    shutdown: CancellationToken,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(
        queue: Arc<MessageQueue>,
        registry: Arc<AgentRegistry>,
        config: &RuntimeConfig,
    ) -> Arc<Self> {
        let (spawn_tx, spawn_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            queue,
            registry,
            active: parking_lot::Mutex::new(HashSet::new()),
            max_concurrent: config.max_concurrent_agents,
            health_interval: config.health_interval,
            loops: DashMap::new(),
            spawn_tx,
            spawn_rx: parking_lot::Mutex::new(Some(spawn_rx)),
            shutdown: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Start the spawn-queue drainer and the periodic health sweep.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();

        if let Some(rx) = self.spawn_rx.lock().take() {
            let orchestrator = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                orchestrator.drain_spawn_queue(rx).await;
            }));
        }

        let orchestrator = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            orchestrator.health_sweep().await;
        }));
    }

    /// Terminate every agent and stop the background loops.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }

        let active: Vec<AgentId> = self.active.lock().iter().copied().collect();
        for id in active {
            self.terminate(id).await;
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Spawn a new agent. Admission checks: capacity, known type, and a
    /// valid parent with spawn rights when one is named.
    pub async fn spawn(&self, request: SpawnRequest) -> OrchestratorResult<AgentId> {
        {
            let active = self.active.lock();
            if active.len() >= self.max_concurrent {
                return Err(OrchestratorError::CapacityExceeded(self.max_concurrent));
            }
        }

        if let Some(parent_id) = request.parent_id {
            let parent = self
                .registry
                .get(parent_id)
                .ok_or(OrchestratorError::UnknownParent(parent_id))?;
            if !parent.can_spawn_children {
                return Err(OrchestratorError::ParentCannotSpawn(parent_id));
            }
        }

        let mut behavior = self.registry.create(&request.agent_type)?;
        behavior
            .initialize(&request.context)
            .await
            .map_err(|e| OrchestratorError::SpawnFailed(e.to_string()))?;

        let handle = AgentHandle::new(
            request.agent_type.clone(),
            request.capabilities.clone(),
            request.parent_id,
            behavior,
        );
        handle.set_context(request.context.clone());
        handle.set_status(AgentStatus::Ready);

        self.registry.register(Arc::clone(&handle))?;
        self.active.lock().insert(handle.id);
        self.start_agent_loop(&handle);

        self.queue
            .publish(
                json!({
                    "type": "agent_spawned",
                    "agent_id": handle.id,
                    "agent_type": request.agent_type,
                    "parent_id": request.parent_id,
                    "timestamp": Utc::now(),
                }),
                SYSTEM_TOPIC,
                MessagePriority::Normal,
                None,
            )
            .await;

        tracing::info!(
            agent_id = %handle.id,
            agent_type = %request.agent_type,
            parent_id = ?request.parent_id,
            "agent spawned"
        );
        Ok(handle.id)
    }

    /// Spawn a batch of agents in request order, stopping at the first
    /// failure.
    pub async fn spawn_parallel(&self, requests: Vec<SpawnRequest>) -> ParallelSpawn {
        let mut spawned = Vec::with_capacity(requests.len());
        for (index, request) in requests.into_iter().enumerate() {
            match self.spawn(request).await {
                Ok(id) => spawned.push(id),
                Err(error) => {
                    return ParallelSpawn {
                        spawned,
                        failure: Some((index, error)),
                    }
                }
            }
        }
        ParallelSpawn {
            spawned,
            failure: None,
        }
    }

    /// Queue a spawn request for the background drainer, which publishes
    /// `spawn_completed` / `spawn_failed` system events.
    pub fn enqueue_spawn(&self, request: SpawnRequest) {
        let _ = self.spawn_tx.send(request);
    }

    /// Send a payload from one agent to another's in-box at NORMAL
    /// priority. Returns the message id.
    pub async fn send(&self, source: AgentId, target: AgentId, payload: AgentPayload) -> Uuid {
        let kind = payload.kind.clone();
        let message = Message::new(
            format!("agent.{target}"),
            json!({ "type": payload.kind, "data": payload.data }),
            MessagePriority::Normal,
        )
        .with_source(source)
        .with_target(target)
        .with_message_type(kind);
        self.queue.publish_message(message).await
    }

    /// Send a payload to every active agent except the sender, optionally
    /// filtered by capability.
    pub async fn broadcast(
        &self,
        source: AgentId,
        payload: AgentPayload,
        capability_filter: Option<Capability>,
    ) {
        let targets: Vec<Arc<AgentHandle>> = match capability_filter {
            Some(capability) => self.registry.list_by_capability(capability),
            None => {
                let active = self.active.lock().clone();
                active
                    .iter()
                    .filter_map(|id| self.registry.get(*id))
                    .collect()
            }
        };

        for target in targets {
            if target.id != source {
                self.send(source, target.id, payload.clone()).await;
            }
        }
    }

    pub async fn pause(&self, id: AgentId) -> OrchestratorResult<()> {
        let handle = self
            .registry
            .get(id)
            .ok_or(OrchestratorError::AgentNotFound(id))?;
        handle.behavior().lock().await.pause().await;
        handle.set_status(AgentStatus::Paused);

        self.queue
            .publish(
                json!({ "type": "agent_paused", "agent_id": id, "timestamp": Utc::now() }),
                SYSTEM_TOPIC,
                MessagePriority::Normal,
                None,
            )
            .await;
        Ok(())
    }

    pub async fn resume(&self, id: AgentId) -> OrchestratorResult<()> {
        let handle = self
            .registry
            .get(id)
            .ok_or(OrchestratorError::AgentNotFound(id))?;
        handle.behavior().lock().await.resume().await;
        handle.set_status(AgentStatus::Ready);

        self.queue
            .publish(
                json!({ "type": "agent_resumed", "agent_id": id, "timestamp": Utc::now() }),
                SYSTEM_TOPIC,
                MessagePriority::Normal,
                None,
            )
            .await;
        Ok(())
    }

    /// Terminate an agent and all of its descendants, children before
    /// parents. Idempotent: unknown ids are ignored.
    pub async fn terminate(&self, id: AgentId) {
        if !self.registry.exists(id) {
            return;
        }

        let descendants = self.registry.descendants(id);
        for handle in descendants.into_iter().rev() {
            self.terminate_single(handle).await;
        }
        if let Some(handle) = self.registry.get(id) {
            self.terminate_single(handle).await;
        }
    }

    async fn terminate_single(&self, handle: Arc<AgentHandle>) {
        if let Some((_, agent_loop)) = self.loops.remove(&handle.id) {
            agent_loop.token.cancel();
            let _ = agent_loop.task.await;
        }

        handle.behavior().lock().await.terminate().await;
        handle.set_status(AgentStatus::Terminated);

        self.active.lock().remove(&handle.id);
        self.registry.unregister(handle.id);
        self.queue.purge_topic(&handle.inbox_topic());

        self.queue
            .publish(
                json!({ "type": "agent_terminated", "agent_id": handle.id, "timestamp": Utc::now() }),
                SYSTEM_TOPIC,
                MessagePriority::Normal,
                None,
            )
            .await;

        tracing::info!(agent_id = %handle.id, "agent terminated");
    }

    pub fn find_by_capability(&self, capability: Capability) -> Vec<Arc<AgentHandle>> {
        self.registry.list_by_capability(capability)
    }

    /// Hierarchy view. With a root id, the subtree below it (empty when
    /// unknown); without, one tree per parentless active agent.
    pub fn tree(&self, root: Option<AgentId>) -> Vec<TreeNode> {
        match root {
            Some(id) => self
                .registry
                .get(id)
                .map(|handle| vec![self.build_tree_node(&handle)])
                .unwrap_or_default(),
            None => self
                .registry
                .list_all()
                .into_iter()
                .filter(|handle| handle.parent_id.is_none())
                .map(|handle| self.build_tree_node(&handle))
                .collect(),
        }
    }

    fn build_tree_node(&self, handle: &AgentHandle) -> TreeNode {
        let children = self
            .registry
            .children(handle.id)
            .iter()
            .map(|child| self.build_tree_node(child))
            .collect();
        TreeNode {
            id: handle.id,
            agent_type: handle.agent_type.clone(),
            status: handle.status(),
            capabilities: handle.capabilities.clone(),
            children,
        }
    }

    /// Probe every registered agent; agents in ERROR are restarted with
    /// their stored context.
    pub async fn health_check(&self) -> HealthReport {
        let agents = self.registry.list_all();
        let mut report = HealthReport {
            total: agents.len(),
            healthy: 0,
            unhealthy: 0,
            recovery_attempted: Vec::new(),
        };

        for handle in agents {
            let status = handle.status();
            let backlog = self.queue.depth(&handle.inbox_topic());
            let probe = handle.behavior().lock().await.health_probe().await;
            let healthy = probe
                && backlog <= INBOX_BACKLOG_LIMIT
                && !matches!(status, AgentStatus::Error | AgentStatus::Terminated);

            if healthy {
                report.healthy += 1;
            } else {
                report.unhealthy += 1;
                if status == AgentStatus::Error {
                    self.restart_agent(&handle).await;
                    report.recovery_attempted.push(handle.id);
                }
            }
        }
        report
    }

    /// Terminate-and-reinitialise an errored agent in place, keeping its
    /// id and registration.
    async fn restart_agent(&self, handle: &Arc<AgentHandle>) {
        tracing::warn!(agent_id = %handle.id, "restarting errored agent");

        if let Some((_, agent_loop)) = self.loops.remove(&handle.id) {
            agent_loop.token.cancel();
            let _ = agent_loop.task.await;
        }

        let context = handle.context().unwrap_or_default();
        handle.set_status(AgentStatus::Initializing);
        let initialized = {
            let mut behavior = handle.behavior().lock().await;
            behavior.terminate().await;
            behavior.initialize(&context).await
        };

        match initialized {
            Ok(()) => {
                handle.set_status(AgentStatus::Ready);
                self.start_agent_loop(handle);
            }
            Err(error) => {
                tracing::error!(agent_id = %handle.id, %error, "agent restart failed");
                handle.set_status(AgentStatus::Error);
            }
        }
    }

    fn start_agent_loop(&self, handle: &Arc<AgentHandle>) {
        let token = self.shutdown.child_token();
        let task = tokio::spawn(run_agent_loop(
            Arc::clone(&self.queue),
            Arc::clone(handle),
            token.clone(),
        ));
        self.loops.insert(handle.id, AgentLoop { token, task });
    }

    async fn drain_spawn_queue(&self, mut rx: mpsc::UnboundedReceiver<SpawnRequest>) {
        loop {
            let request = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                request = rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            let agent_type = request.agent_type.clone();
            match self.spawn(request).await {
                Ok(agent_id) => {
                    self.queue
                        .publish(
                            json!({ "type": "spawn_completed", "agent_id": agent_id }),
                            SYSTEM_TOPIC,
                            MessagePriority::Normal,
                            None,
                        )
                        .await;
                }
                Err(error) => {
                    tracing::warn!(%agent_type, %error, "queued spawn failed");
                    self.queue
                        .publish(
                            json!({
                                "type": "spawn_failed",
                                "agent_type": agent_type,
                                "error": error.to_string(),
                            }),
                            SYSTEM_TOPIC,
                            MessagePriority::Normal,
                            None,
                        )
                        .await;
                }
            }
        }
    }

    async fn health_sweep(&self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.health_interval) => {}
            }

            let report = self.health_check().await;
            self.queue
                .publish(
                    json!({ "type": "health_report", "report": report, "timestamp": Utc::now() }),
                    SYSTEM_TOPIC,
                    MessagePriority::Normal,
                    None,
                )
                .await;
        }
    }
}

/// Kernel-driven message loop for one agent: dequeue from the in-box with
/// a short poll timeout; while paused, re-enqueue (priority and timestamp
/// preserved) and back off; otherwise process under BUSY and restore the
/// previous status. Processing errors move the agent to ERROR for the
/// health sweep to repair.
async fn run_agent_loop(
    queue: Arc<MessageQueue>,
    handle: Arc<AgentHandle>,
    token: CancellationToken,
) {
    let topic = handle.inbox_topic();
    loop {
        let message = tokio::select! {
            _ = token.cancelled() => break,
            message = queue.consume(&topic, Some(INBOX_POLL_INTERVAL)) => message,
        };
        let Some(message) = message else { continue };

        if handle.status() == AgentStatus::Paused {
            queue.requeue(message);
            tokio::time::sleep(PAUSE_BACKOFF).await;
            continue;
        }

        let previous = handle.status();
        handle.set_status(AgentStatus::Busy);
        handle.touch();

        let result = {
            let mut behavior = handle.behavior().lock().await;
            behavior.process_message(&message).await
        };

        match result {
            Ok(()) => {
                handle.set_status(previous);
            }
            Err(error) => {
                tracing::error!(agent_id = %handle.id, %error, "message processing failed");
                handle.set_status(AgentStatus::Error);
                let mut behavior = handle.behavior().lock().await;
                behavior.on_error(&error, Some(&message)).await;
            }
        }
    }
}
