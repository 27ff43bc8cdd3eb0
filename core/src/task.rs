//! Quality-gated task execution: budget admission, prompt construction,
//! monitored execution, quality scoring and per-agent metrics.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Quality scores retained per agent.
const QUALITY_HISTORY_LIMIT: usize = 100;

fn default_task_priority() -> u8 {
    5
}

/// A unit of work handed to a task agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub query: String,
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default = "default_task_priority")]
    pub priority: u8,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            query: query.into(),
            parameters: HashMap::new(),
            metadata: HashMap::new(),
            priority: default_task_priority(),
            created_at: Utc::now(),
        }
    }
}

/// Result of executing a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub success: bool,
    pub content: String,
    #[serde(default)]
    pub sources: Vec<Value>,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub execution_time_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default)]
    pub degraded: bool,
}

impl TaskOutcome {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            success: true,
            content: content.into(),
            sources: Vec::new(),
            tokens_used: 0,
            execution_time_ms: 0.0,
            quality_score: None,
            metadata: HashMap::new(),
            degraded: false,
        }
    }

    pub fn failure(content: impl Into<String>) -> Self {
        let mut outcome = Self::success(content);
        outcome.success = false;
        outcome
    }
}

/// Per-agent performance counters with a bounded quality history.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentMetrics {
    pub task_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub total_latency_ms: f64,
    pub tokens_used: u64,
    pub quality_scores: Vec<f64>,
}

impl AgentMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.task_count == 0 {
            return 0.0;
        }
        self.success_count as f64 / self.task_count as f64
    }

    pub fn average_latency_ms(&self) -> f64 {
        if self.task_count == 0 {
            return 0.0;
        }
        self.total_latency_ms / self.task_count as f64
    }

    pub fn average_quality(&self) -> f64 {
        if self.quality_scores.is_empty() {
            return 0.0;
        }
        self.quality_scores.iter().sum::<f64>() / self.quality_scores.len() as f64
    }

    pub fn tokens_per_task(&self) -> f64 {
        if self.task_count == 0 {
            return 0.0;
        }
        self.tokens_used as f64 / self.task_count as f64
    }

    fn record_quality(&mut self, score: f64) {
        if self.quality_scores.len() >= QUALITY_HISTORY_LIMIT {
            self.quality_scores.remove(0);
        }
        self.quality_scores.push(score);
    }
}

/// Admission control for task spending.
#[async_trait]
pub trait BudgetGate: Send + Sync {
    async fn can_proceed(&self, agent_id: &str) -> bool;
    async fn record_usage(&self, agent_id: &str, tokens: u64);
}

/// Simple per-agent token budget.
pub struct TokenBudget {
    limit_per_agent: u64,
    usage: parking_lot::Mutex<HashMap<String, u64>>,
}

impl TokenBudget {
    pub fn new(limit_per_agent: u64) -> Arc<Self> {
        Arc::new(Self {
            limit_per_agent,
            usage: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    pub fn used(&self, agent_id: &str) -> u64 {
        self.usage.lock().get(agent_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl BudgetGate for TokenBudget {
    async fn can_proceed(&self, agent_id: &str) -> bool {
        self.used(agent_id) < self.limit_per_agent
    }

    async fn record_usage(&self, agent_id: &str, tokens: u64) {
        *self
            .usage
            .lock()
            .entry(agent_id.to_string())
            .or_default() += tokens;
    }
}

/// Behaviour of a quality-gated agent: the hooks the runner composes into
/// an execution pipeline.
#[async_trait]
pub trait TaskAgent: Send + Sync {
    fn id(&self) -> &str;

    fn role(&self) -> &str;

    /// Context fetched before prompting; defaults to nothing.
    async fn fetch_context(&self, _task: &Task) -> Value {
        Value::Null
    }

    async fn build_prompt(&self, task: &Task, context: &Value) -> String;

    /// Run the prompt and return an outcome, or an error description.
    async fn execute_monitored(&self, prompt: &str) -> Result<TaskOutcome, String>;

    /// Score the outcome in [0, 1].
    async fn evaluate_quality(&self, outcome: &TaskOutcome) -> f64;

    /// Reduced-resource path taken when the budget gate denies the task.
    async fn graceful_degradation(&self, _task: &Task) -> TaskOutcome {
        let mut outcome = TaskOutcome::success("Task completed with reduced resources");
        outcome.degraded = true;
        outcome
    }

    /// Failure path; the default reports the error in the outcome.
    async fn on_failure(&self, reason: &str, _task: &Task) -> TaskOutcome {
        TaskOutcome::failure(format!("Error executing task: {reason}"))
    }
}

/// Drives task agents through the execution pipeline and tracks their
/// metrics.
pub struct TaskRunner {
    budget: Arc<dyn BudgetGate>,
    metrics: parking_lot::Mutex<HashMap<String, AgentMetrics>>,
}

impl TaskRunner {
    pub fn new(budget: Arc<dyn BudgetGate>) -> Self {
        Self {
            budget,
            metrics: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Budget check, context fetch, prompt, monitored execution, quality
    /// scoring, metrics and budget accounting. Budget denial delegates to
    /// the agent's degradation path.
    pub async fn execute(&self, agent: &dyn TaskAgent, task: Task) -> TaskOutcome {
        let started = Instant::now();
        let agent_id = agent.id().to_string();

        {
            let mut metrics = self.metrics.lock();
            metrics.entry(agent_id.clone()).or_default().task_count += 1;
        }

        if !self.budget.can_proceed(&agent_id).await {
            tracing::info!(agent_id = %agent_id, task_id = %task.id, "budget denied, degrading");
            return agent.graceful_degradation(&task).await;
        }

        let context = agent.fetch_context(&task).await;
        let prompt = agent.build_prompt(&task, &context).await;

        match agent.execute_monitored(&prompt).await {
            Ok(mut outcome) => {
                let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                outcome.execution_time_ms = elapsed_ms;

                let quality = agent.evaluate_quality(&outcome).await;
                outcome.quality_score = Some(quality);

                {
                    let mut metrics = self.metrics.lock();
                    let entry = metrics.entry(agent_id.clone()).or_default();
                    entry.total_latency_ms += elapsed_ms;
                    entry.success_count += 1;
                    entry.tokens_used += outcome.tokens_used;
                    entry.record_quality(quality);
                }

                self.budget
                    .record_usage(&agent_id, outcome.tokens_used)
                    .await;
                outcome
            }
            Err(reason) => {
                let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                {
                    let mut metrics = self.metrics.lock();
                    let entry = metrics.entry(agent_id.clone()).or_default();
                    entry.error_count += 1;
                    entry.total_latency_ms += elapsed_ms;
                }
                tracing::warn!(agent_id = %agent_id, task_id = %task.id, %reason, "task failed");
                agent.on_failure(&reason, &task).await
            }
        }
    }

    pub fn metrics(&self, agent_id: &str) -> Option<AgentMetrics> {
        self.metrics.lock().get(agent_id).cloned()
    }

    pub fn all_metrics(&self) -> HashMap<String, AgentMetrics> {
        self.metrics.lock().clone()
    }
}
