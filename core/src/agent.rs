//! Agent contract: capability and status enums, execution context, the
//! behaviour trait implemented by every agent, and the handle the kernel
//! keeps per live agent.
//!
//! # Status transition model
//!
//! ```text
//!             initialize            receive message
//! INITIALIZING ──────────► READY ◄──────────────► BUSY
//!                            │  ▲
//!                            │  └── resume ── PAUSED ◄── pause
//!                            │
//!              error (any state except TERMINATED) ──► ERROR
//!              terminate (any state)                ──► TERMINATED
//! ```

use crate::errors::{AgentError, AgentResult};
use crate::queue::Message;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// Identifier of a live agent, stable for the process lifetime.
pub type AgentId = Uuid;

/// Capabilities an agent can advertise. The set is closed; spawn requests
/// and capability lookups both draw from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    WebSearch,
    AcademicSearch,
    DataCollection,
    Analysis,
    StatisticalAnalysis,
    SentimentAnalysis,
    Synthesis,
    Summarization,
    ReportGeneration,
    Translation,
    Multilingual,
    FactChecking,
    CriticalThinking,
    CreativeThinking,
    FinancialAnalysis,
    StrategicPlanning,
    CodeAnalysis,
    TechnicalWriting,
    QualityAssurance,
    Judging,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::WebSearch => "web_search",
            Capability::AcademicSearch => "academic_search",
            Capability::DataCollection => "data_collection",
            Capability::Analysis => "analysis",
            Capability::StatisticalAnalysis => "statistical_analysis",
            Capability::SentimentAnalysis => "sentiment_analysis",
            Capability::Synthesis => "synthesis",
            Capability::Summarization => "summarization",
            Capability::ReportGeneration => "report_generation",
            Capability::Translation => "translation",
            Capability::Multilingual => "multilingual",
            Capability::FactChecking => "fact_checking",
            Capability::CriticalThinking => "critical_thinking",
            Capability::CreativeThinking => "creative_thinking",
            Capability::FinancialAnalysis => "financial_analysis",
            Capability::StrategicPlanning => "strategic_planning",
            Capability::CodeAnalysis => "code_analysis",
            Capability::TechnicalWriting => "technical_writing",
            Capability::QualityAssurance => "quality_assurance",
            Capability::Judging => "judging",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "web_search" => Ok(Capability::WebSearch),
            "academic_search" => Ok(Capability::AcademicSearch),
            "data_collection" => Ok(Capability::DataCollection),
            "analysis" => Ok(Capability::Analysis),
            "statistical_analysis" => Ok(Capability::StatisticalAnalysis),
            "sentiment_analysis" => Ok(Capability::SentimentAnalysis),
            "synthesis" => Ok(Capability::Synthesis),
            "summarization" => Ok(Capability::Summarization),
            "report_generation" => Ok(Capability::ReportGeneration),
            "translation" => Ok(Capability::Translation),
            "multilingual" => Ok(Capability::Multilingual),
            "fact_checking" => Ok(Capability::FactChecking),
            "critical_thinking" => Ok(Capability::CriticalThinking),
            "creative_thinking" => Ok(Capability::CreativeThinking),
            "financial_analysis" => Ok(Capability::FinancialAnalysis),
            "strategic_planning" => Ok(Capability::StrategicPlanning),
            "code_analysis" => Ok(Capability::CodeAnalysis),
            "technical_writing" => Ok(Capability::TechnicalWriting),
            "quality_assurance" => Ok(Capability::QualityAssurance),
            "judging" => Ok(Capability::Judging),
            other => Err(format!("unknown capability: {other}")),
        }
    }
}

/// Lifecycle status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Initializing,
    Ready,
    Busy,
    Paused,
    Error,
    Terminated,
}

impl AgentStatus {
    /// Whether the transition to `target` is allowed by the state machine.
    /// Termination is allowed from any state; ERROR from any non-terminal
    /// state; TERMINATED is final.
    pub fn can_transition_to(&self, target: AgentStatus) -> bool {
        if *self == AgentStatus::Terminated {
            return false;
        }
        match (self, target) {
            (_, AgentStatus::Terminated) => true,
            (_, AgentStatus::Error) => true,
            (AgentStatus::Initializing, AgentStatus::Ready) => true,
            (AgentStatus::Ready, AgentStatus::Busy) => true,
            (AgentStatus::Busy, AgentStatus::Ready) => true,
            (AgentStatus::Ready, AgentStatus::Paused) => true,
            (AgentStatus::Busy, AgentStatus::Paused) => true,
            (AgentStatus::Paused, AgentStatus::Ready) => true,
            (AgentStatus::Error, AgentStatus::Initializing) => true,
            (AgentStatus::Error, AgentStatus::Ready) => true,
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentStatus::Terminated)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentStatus::Initializing => "initializing",
            AgentStatus::Ready => "ready",
            AgentStatus::Busy => "busy",
            AgentStatus::Paused => "paused",
            AgentStatus::Error => "error",
            AgentStatus::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Context handed to an agent at spawn time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentContext {
    #[serde(default)]
    pub research_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub shared_memory: HashMap<String, Value>,
    #[serde(default)]
    pub constraints: HashMap<String, Value>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// Typed payload carried inside an agent-to-agent message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPayload {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl AgentPayload {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }
}

/// Behaviour implemented by every agent. The kernel owns the message loop
/// and the status machine; implementations only provide the hooks.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Called once at spawn (and again on health-sweep restart).
    async fn initialize(&mut self, _context: &AgentContext) -> AgentResult<()> {
        Ok(())
    }

    /// Called before the agent is removed. Must not fail.
    async fn terminate(&mut self) {}

    async fn pause(&mut self) {}

    async fn resume(&mut self) {}

    /// Agent-specific liveness probe; the kernel combines it with status
    /// and in-box backlog checks.
    async fn health_probe(&self) -> bool {
        true
    }

    /// Handle one dequeued message. An error here moves the agent to ERROR.
    async fn process_message(&mut self, message: &Message) -> AgentResult<()>;

    /// Called after a processing error, with the offending message when one
    /// exists.
    async fn on_error(&mut self, error: &AgentError, message: Option<&Message>) {
        let _ = (error, message);
    }

    /// Agent-specific metrics merged into the kernel snapshot.
    fn custom_metrics(&self) -> HashMap<String, Value> {
        HashMap::new()
    }
}

/// Point-in-time metrics for one agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentSnapshot {
    pub agent_id: AgentId,
    pub agent_type: String,
    pub status: AgentStatus,
    pub uptime_seconds: i64,
    pub inbox_depth: usize,
    pub last_activity: DateTime<Utc>,
    pub custom_metrics: HashMap<String, Value>,
}

/// Kernel-side handle for a live agent: identity, capability set, status,
/// context, and the boxed behaviour.
pub struct AgentHandle {
    pub id: AgentId,
    pub agent_type: String,
    pub capabilities: Vec<Capability>,
    pub parent_id: Option<AgentId>,
    pub can_spawn_children: bool,
    pub created_at: DateTime<Utc>,
    status: parking_lot::RwLock<AgentStatus>,
    last_activity: parking_lot::RwLock<DateTime<Utc>>,
    context: parking_lot::RwLock<Option<AgentContext>>,
    behavior: tokio::sync::Mutex<Box<dyn Agent>>,
}

impl AgentHandle {
    pub fn new(
        agent_type: impl Into<String>,
        capabilities: Vec<Capability>,
        parent_id: Option<AgentId>,
        behavior: Box<dyn Agent>,
    ) -> Arc<Self> {
        Self::with_spawn_rights(agent_type, capabilities, parent_id, true, behavior)
    }

    pub fn with_spawn_rights(
        agent_type: impl Into<String>,
        capabilities: Vec<Capability>,
        parent_id: Option<AgentId>,
        can_spawn_children: bool,
        behavior: Box<dyn Agent>,
    ) -> Arc<Self> {
        let now = Utc::now();
        Arc::new(Self {
            id: Uuid::new_v4(),
            agent_type: agent_type.into(),
            capabilities,
            parent_id,
            can_spawn_children,
            created_at: now,
            status: parking_lot::RwLock::new(AgentStatus::Initializing),
            last_activity: parking_lot::RwLock::new(now),
            context: parking_lot::RwLock::new(None),
            behavior: tokio::sync::Mutex::new(behavior),
        })
    }

    /// The topic carrying this agent's in-box.
    pub fn inbox_topic(&self) -> String {
        format!("agent.{}", self.id)
    }

    pub fn status(&self) -> AgentStatus {
        *self.status.read()
    }

    /// Drive the status machine. Returns false (leaving the status
    /// untouched) when the transition is not allowed.
    pub fn set_status(&self, target: AgentStatus) -> bool {
        let mut status = self.status.write();
        if status.can_transition_to(target) {
            tracing::trace!(agent_id = %self.id, from = %status, to = %target, "status transition");
            *status = target;
            true
        } else {
            false
        }
    }

    pub fn touch(&self) {
        *self.last_activity.write() = Utc::now();
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.read()
    }

    pub fn context(&self) -> Option<AgentContext> {
        self.context.read().clone()
    }

    pub fn set_context(&self, context: AgentContext) {
        *self.context.write() = Some(context);
    }

    pub(crate) fn behavior(&self) -> &tokio::sync::Mutex<Box<dyn Agent>> {
        &self.behavior
    }

    pub async fn snapshot(&self, inbox_depth: usize) -> AgentSnapshot {
        let custom_metrics = self.behavior.lock().await.custom_metrics();
        AgentSnapshot {
            agent_id: self.id,
            agent_type: self.agent_type.clone(),
            status: self.status(),
            uptime_seconds: (Utc::now() - self.created_at).num_seconds(),
            inbox_depth,
            last_activity: self.last_activity(),
            custom_metrics,
        }
    }
}

/// Minimal agent that logs every message it processes. Used by the daemon
/// for core agent types and as a default factory for plugin-declared types
/// without an explicit behaviour.
#[derive(Default)]
pub struct LoggingAgent {
    processed: u64,
}

#[async_trait]
impl Agent for LoggingAgent {
    async fn process_message(&mut self, message: &Message) -> AgentResult<()> {
        self.processed += 1;
        tracing::info!(
            message_id = %message.id,
            message_type = message.message_type.as_deref().unwrap_or(""),
            "message received"
        );
        Ok(())
    }

    fn custom_metrics(&self) -> HashMap<String, Value> {
        let mut metrics = HashMap::new();
        metrics.insert("processed".to_string(), Value::from(self.processed));
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminate_allowed_from_any_live_state() {
        for status in [
            AgentStatus::Initializing,
            AgentStatus::Ready,
            AgentStatus::Busy,
            AgentStatus::Paused,
            AgentStatus::Error,
        ] {
            assert!(status.can_transition_to(AgentStatus::Terminated));
        }
    }

    #[test]
    fn terminated_is_final() {
        for status in [
            AgentStatus::Initializing,
            AgentStatus::Ready,
            AgentStatus::Error,
            AgentStatus::Terminated,
        ] {
            assert!(!AgentStatus::Terminated.can_transition_to(status));
        }
    }

    #[test]
    fn pause_resume_cycle() {
        assert!(AgentStatus::Ready.can_transition_to(AgentStatus::Paused));
        assert!(AgentStatus::Paused.can_transition_to(AgentStatus::Ready));
        assert!(!AgentStatus::Paused.can_transition_to(AgentStatus::Busy));
    }

    #[test]
    fn capability_round_trips_through_names() {
        for cap in [
            Capability::WebSearch,
            Capability::StatisticalAnalysis,
            Capability::Judging,
        ] {
            assert_eq!(cap.as_str().parse::<Capability>().unwrap(), cap);
        }
        assert!("astrology".parse::<Capability>().is_err());
    }
}
