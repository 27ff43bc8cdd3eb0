/// Error types for the Meridian orchestration runtime.
use thiserror::Error;
use uuid::Uuid;

/// Core error type for orchestrator operations.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Maximum concurrent agent limit reached ({0})")]
    CapacityExceeded(usize),

    #[error("Unknown agent type: {0}")]
    UnknownType(String),

    #[error("Parent agent {0} not found")]
    UnknownParent(Uuid),

    #[error("Parent agent {0} cannot spawn children")]
    ParentCannotSpawn(Uuid),

    #[error("Agent {0} not found")]
    AgentNotFound(Uuid),

    #[error("Agent {0} is already registered")]
    AlreadyRegistered(Uuid),

    #[error("Agent spawn failed: {0}")]
    SpawnFailed(String),
}

/// Result type for orchestrator operations.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Core error type for agent behaviour hooks.
///
/// A failure inside `process_message` transitions the owning agent to
/// ERROR and is repaired by the next health sweep rather than being
/// surfaced to the publisher.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Agent initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Message processing failed: {0}")]
    ProcessingFailed(String),

    #[error("Invalid agent context: {0}")]
    InvalidContext(String),
}

/// Result type for agent behaviour hooks.
pub type AgentResult<T> = Result<T, AgentError>;

/// Core error type for plugin loader operations.
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Plugin '{0}' not found")]
    NotFound(String),

    #[error("Plugin '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("Plugin '{plugin}' is missing dependency '{dependency}'")]
    MissingDependency { plugin: String, dependency: String },

    #[error("Invalid plugin version '{0}' (expected MAJOR.MINOR.PATCH)")]
    InvalidVersion(String),

    #[error("Invalid plugin manifest: {0}")]
    InvalidManifest(String),

    #[error("Plugin '{plugin}' failed to initialize: {reason}")]
    InitializationFailed { plugin: String, reason: String },

    #[error("Tool '{0}' not found")]
    ToolNotFound(String),
}

/// Result type for plugin loader operations.
pub type PluginResult<T> = Result<T, PluginError>;

/// Core error type for consent-gated memory operations.
#[derive(Error, Debug)]
pub enum ConsentError {
    #[error("No consent recorded for purpose '{0}'")]
    ConsentRequired(String),

    #[error("Invalid processing purpose: {0}")]
    InvalidPurpose(String),
}

/// Result type for consent-gated operations.
pub type ConsentResult<T> = Result<T, ConsentError>;
