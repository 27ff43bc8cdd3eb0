//! Plugin loader: registration with dependency checks, hot reload, and
//! namespace-isolated accessors.

use super::{Plugin, PluginStatus};
use crate::errors::{PluginError, PluginResult};
use crate::registry::AgentRegistry;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Metadata for one registered plugin.
#[derive(Debug, Clone, Serialize)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
    pub status: PluginStatus,
    pub registered_at: DateTime<Utc>,
    pub author: Option<String>,
    pub description: Option<String>,
    pub agent_count: usize,
    pub tool_count: usize,
    pub dependencies: Vec<String>,
    pub load_time_ms: f64,
    pub usage_count: usize,
}

/// Metrics for one registered plugin.
#[derive(Debug, Clone, Serialize)]
pub struct PluginMetrics {
    pub status: PluginStatus,
    pub usage_count: usize,
    pub load_time_ms: f64,
    pub agent_count: usize,
    pub tool_count: usize,
}

/// A plugin's isolated view: only its own contributions.
#[derive(Debug, Clone, Serialize)]
pub struct PluginNamespace {
    pub name: String,
    pub agents: Vec<String>,
    pub tools: Vec<String>,
}

/// Resolution of a tool name to its owning plugin.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub plugin: String,
    pub full_name: String,
}

#[derive(Debug, Clone)]
struct UsageEvent {
    plugin: String,
    #[allow(dead_code)]
    kind: String,
    #[allow(dead_code)]
    at: DateTime<Utc>,
}

struct PluginRecord {
    plugin: Box<dyn Plugin>,
    status: PluginStatus,
    registered_at: DateTime<Utc>,
    load_time_ms: f64,
}

struct LoaderInner {
    plugins: HashMap<String, PluginRecord>,
    order: Vec<String>,
    tools: HashMap<String, String>,
    configs: HashMap<String, HashMap<String, Value>>,
    usage_events: Vec<UsageEvent>,
}

impl LoaderInner {
    fn record_usage(&mut self, plugin: &str, kind: &str) {
        self.usage_events.push(UsageEvent {
            plugin: plugin.to_string(),
            kind: kind.to_string(),
            at: Utc::now(),
        });
    }

    fn usage_count(&self, plugin: &str) -> usize {
        self.usage_events.iter().filter(|e| e.plugin == plugin).count()
    }
}

/// Loads and unloads plugins, contributing their agent types into the
/// shared registry and their tools into a prefixed tool table.
pub struct PluginLoader {
    registry: Arc<AgentRegistry>,
    inner: tokio::sync::Mutex<LoaderInner>,
}

impl PluginLoader {
    pub fn new(registry: Arc<AgentRegistry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            inner: tokio::sync::Mutex::new(LoaderInner {
                plugins: HashMap::new(),
                order: Vec::new(),
                tools: HashMap::new(),
                configs: HashMap::new(),
                usage_events: Vec::new(),
            }),
        })
    }

    /// Register a plugin. Validates its manifest, requires every
    /// dependency to be registered and active, initialises it, then loads
    /// its agent types into the registry and its tools under
    /// `<plugin>.<tool>`.
    pub async fn register(&self, mut plugin: Box<dyn Plugin>) -> PluginResult<()> {
        let manifest = plugin.manifest().clone();
        manifest.validate()?;

        let mut inner = self.inner.lock().await;
        if inner.plugins.contains_key(&manifest.name) {
            return Err(PluginError::AlreadyRegistered(manifest.name));
        }
        for dependency in &manifest.dependencies {
            let active = inner
                .plugins
                .get(dependency)
                .map_or(false, |record| record.status == PluginStatus::Active);
            if !active {
                return Err(PluginError::MissingDependency {
                    plugin: manifest.name.clone(),
                    dependency: dependency.clone(),
                });
            }
        }

        let started = std::time::Instant::now();
        if let Err(error) = plugin.initialize().await {
            return Err(PluginError::InitializationFailed {
                plugin: manifest.name.clone(),
                reason: error.to_string(),
            });
        }
        let load_time_ms = started.elapsed().as_secs_f64() * 1000.0;

        for (agent_type, factory) in plugin.agent_factories() {
            self.registry.register_type(&agent_type, factory);
        }
        for tool in &manifest.tools {
            inner
                .tools
                .insert(tool.clone(), format!("{}.{}", manifest.name, tool));
        }
        inner
            .configs
            .insert(manifest.name.clone(), manifest.config.clone());

        inner.plugins.insert(
            manifest.name.clone(),
            PluginRecord {
                plugin,
                status: PluginStatus::Active,
                registered_at: Utc::now(),
                load_time_ms,
            },
        );
        inner.order.push(manifest.name.clone());
        inner.record_usage(&manifest.name, "registered");

        tracing::info!(
            plugin = %manifest.name,
            version = %manifest.version,
            agents = manifest.agents.len(),
            tools = manifest.tools.len(),
            "plugin registered"
        );
        Ok(())
    }

    /// Unregister a plugin, removing its agent types and tools.
    pub async fn unregister(&self, name: &str) -> PluginResult<()> {
        let mut inner = self.inner.lock().await;
        let mut record = inner
            .plugins
            .remove(name)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;

        record.plugin.shutdown().await;
        record.status = PluginStatus::Shutdown;

        let manifest = record.plugin.manifest().clone();
        for agent_type in &manifest.agents {
            self.registry.unregister_type(agent_type);
        }
        for tool in &manifest.tools {
            inner.tools.remove(tool);
        }
        inner.configs.remove(name);
        inner.order.retain(|n| n != name);
        inner.record_usage(name, "unregistered");

        tracing::info!(plugin = name, "plugin unregistered");
        Ok(())
    }

    /// Hot reload: unregister the existing version, register the new one.
    pub async fn reload(&self, name: &str, replacement: Box<dyn Plugin>) -> PluginResult<()> {
        if !self.is_registered(name).await {
            return Err(PluginError::NotFound(name.to_string()));
        }
        self.unregister(name).await?;
        self.register(replacement).await
    }

    /// Shut everything down, in reverse registration order. Individual
    /// failures are logged and do not stop the rest.
    pub async fn shutdown(&self) {
        let order: Vec<String> = {
            let inner = self.inner.lock().await;
            inner.order.iter().rev().cloned().collect()
        };
        for name in order {
            if let Err(error) = self.unregister(&name).await {
                tracing::warn!(plugin = %name, %error, "plugin shutdown failed");
            }
        }
        let mut inner = self.inner.lock().await;
        inner.tools.clear();
        inner.configs.clear();
        inner.usage_events.clear();
    }

    pub async fn is_registered(&self, name: &str) -> bool {
        self.inner.lock().await.plugins.contains_key(name)
    }

    pub async fn list_plugins(&self) -> Vec<String> {
        self.inner.lock().await.order.clone()
    }

    pub async fn plugin_info(&self, name: &str) -> PluginResult<PluginInfo> {
        let inner = self.inner.lock().await;
        let record = inner
            .plugins
            .get(name)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
        let manifest = record.plugin.manifest();
        Ok(PluginInfo {
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            status: record.status,
            registered_at: record.registered_at,
            author: manifest.author.clone(),
            description: manifest.description.clone(),
            agent_count: manifest.agents.len(),
            tool_count: manifest.tools.len(),
            dependencies: manifest.dependencies.clone(),
            load_time_ms: record.load_time_ms,
            usage_count: inner.usage_count(name),
        })
    }

    pub async fn plugin_metrics(&self, name: &str) -> PluginResult<PluginMetrics> {
        let inner = self.inner.lock().await;
        let record = inner
            .plugins
            .get(name)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
        let manifest = record.plugin.manifest();
        Ok(PluginMetrics {
            status: record.status,
            usage_count: inner.usage_count(name),
            load_time_ms: record.load_time_ms,
            agent_count: manifest.agents.len(),
            tool_count: manifest.tools.len(),
        })
    }

    /// A plugin's own contributions only; one plugin's names are never
    /// merged into another's view.
    pub async fn plugin_namespace(&self, name: &str) -> PluginResult<PluginNamespace> {
        let inner = self.inner.lock().await;
        let record = inner
            .plugins
            .get(name)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
        let manifest = record.plugin.manifest();
        Ok(PluginNamespace {
            name: manifest.name.clone(),
            agents: manifest.agents.clone(),
            tools: manifest.tools.clone(),
        })
    }

    pub async fn plugin_config(&self, name: &str) -> PluginResult<HashMap<String, Value>> {
        let inner = self.inner.lock().await;
        if !inner.plugins.contains_key(name) {
            return Err(PluginError::NotFound(name.to_string()));
        }
        Ok(inner.configs.get(name).cloned().unwrap_or_default())
    }

    /// Merge updates into both the loader's copy and the plugin's own
    /// config map.
    pub async fn update_plugin_config(
        &self,
        name: &str,
        updates: HashMap<String, Value>,
    ) -> PluginResult<()> {
        let mut inner = self.inner.lock().await;
        if !inner.plugins.contains_key(name) {
            return Err(PluginError::NotFound(name.to_string()));
        }
        inner
            .configs
            .entry(name.to_string())
            .or_default()
            .extend(updates.clone());
        if let Some(record) = inner.plugins.get_mut(name) {
            record.plugin.update_config(&updates);
        }
        Ok(())
    }

    /// All agent types contributed by registered plugins.
    pub async fn agent_types(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        let mut types: Vec<String> = inner
            .plugins
            .values()
            .flat_map(|record| record.plugin.manifest().agents.clone())
            .collect();
        types.sort();
        types.dedup();
        types
    }

    /// All tool names contributed by registered plugins.
    pub async fn available_tools(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        let mut tools: Vec<String> = inner.tools.keys().cloned().collect();
        tools.sort();
        tools
    }

    pub async fn tool_info(&self, tool: &str) -> PluginResult<ToolInfo> {
        let inner = self.inner.lock().await;
        let full_name = inner
            .tools
            .get(tool)
            .ok_or_else(|| PluginError::ToolNotFound(tool.to_string()))?;
        let plugin = full_name
            .split('.')
            .next()
            .unwrap_or_default()
            .to_string();
        Ok(ToolInfo {
            name: tool.to_string(),
            plugin,
            full_name: full_name.clone(),
        })
    }
}
