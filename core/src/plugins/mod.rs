//! Plugin system: versioned bundles of agent types and tools, registered
//! and unregistered dynamically subject to dependency order.

mod loader;

pub use loader::{PluginInfo, PluginLoader, PluginMetrics, PluginNamespace, ToolInfo};

use crate::errors::{PluginError, PluginResult};
use crate::registry::AgentFactory;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

static SEMVER_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d+\.\d+\.\d+(?:-[\w.]+)?(?:\+[\w.]+)?$")
        .unwrap_or_else(|e| panic!("invalid semver pattern: {e}"))
});

/// Lifecycle status of a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    Uninitialized,
    Active,
    Error,
    Shutdown,
}

/// Static description of a plugin: identity, contributed agent-type and
/// tool names, configuration and dependencies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub agents: Vec<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub config: HashMap<String, Value>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PluginManifest {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            agents: Vec::new(),
            tools: Vec::new(),
            config: HashMap::new(),
            dependencies: Vec::new(),
            author: None,
            description: None,
        }
    }

    pub fn with_agents(mut self, agents: Vec<String>) -> Self {
        self.agents = agents;
        self
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_config(mut self, config: HashMap<String, Value>) -> Self {
        self.config = config;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// A manifest must carry a name, a semantic version, and at least one
    /// agent type or tool.
    pub fn validate(&self) -> PluginResult<()> {
        if self.name.is_empty() {
            return Err(PluginError::InvalidManifest(
                "plugin name cannot be empty".to_string(),
            ));
        }
        if !SEMVER_PATTERN.is_match(&self.version) {
            return Err(PluginError::InvalidVersion(self.version.clone()));
        }
        if self.agents.is_empty() && self.tools.is_empty() {
            return Err(PluginError::InvalidManifest(
                "plugin must provide at least one agent or tool".to_string(),
            ));
        }
        Ok(())
    }
}

/// A loadable plugin. Implementations provide the manifest plus lifecycle
/// hooks; the loader owns registration order and the registries.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn manifest(&self) -> &PluginManifest;

    /// Prepare the plugin's contributions. Failure leaves the plugin
    /// unregistered.
    async fn initialize(&mut self) -> PluginResult<()>;

    async fn shutdown(&mut self);

    /// Factories for the agent types this plugin contributes, keyed by
    /// agent-type name.
    fn agent_factories(&self) -> HashMap<String, AgentFactory> {
        HashMap::new()
    }

    /// Merge configuration updates into the plugin's own copy.
    fn update_config(&mut self, _updates: &HashMap<String, Value>) {}
}

/// Standard plugin implementation: a manifest plus per-agent-type
/// factories. Agent types declared without an explicit factory fall back
/// to a logging behaviour.
pub struct AgentBundle {
    manifest: PluginManifest,
    factories: HashMap<String, AgentFactory>,
}

impl AgentBundle {
    pub fn new(manifest: PluginManifest) -> PluginResult<Self> {
        manifest.validate()?;
        Ok(Self {
            manifest,
            factories: HashMap::new(),
        })
    }

    pub fn with_factory(mut self, agent_type: &str, factory: AgentFactory) -> Self {
        self.factories.insert(agent_type.to_string(), factory);
        self
    }
}

#[async_trait]
impl Plugin for AgentBundle {
    fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    async fn initialize(&mut self) -> PluginResult<()> {
        for agent_type in &self.manifest.agents {
            self.factories
                .entry(agent_type.clone())
                .or_insert_with(|| {
                    std::sync::Arc::new(|| {
                        Box::<crate::agent::LoggingAgent>::default() as Box<dyn crate::agent::Agent>
                    })
                });
        }
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.factories.clear();
    }

    fn agent_factories(&self) -> HashMap<String, AgentFactory> {
        self.factories.clone()
    }

    fn update_config(&mut self, updates: &HashMap<String, Value>) {
        for (key, value) in updates {
            self.manifest.config.insert(key.clone(), value.clone());
        }
    }
}
