//! Canonical agent table with type, capability and parent indices, the
//! agent-type factory map, and capability-scored discovery.

use crate::agent::{Agent, AgentHandle, AgentId, AgentStatus, Capability};
use crate::errors::{OrchestratorError, OrchestratorResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Factory producing a fresh behaviour for a registered agent type.
pub type AgentFactory = Arc<dyn Fn() -> Box<dyn Agent> + Send + Sync>;

/// Registration bookkeeping for one agent.
struct Registration {
    handle: Arc<AgentHandle>,
    registered_at: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    metadata: HashMap<String, Value>,
}

/// Search criteria for `find`.
#[derive(Debug, Clone, Default)]
pub struct AgentFilter {
    pub agent_type: Option<String>,
    pub capabilities: Option<Vec<Capability>>,
    pub status: Option<AgentStatus>,
}

/// Registry statistics.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStatistics {
    pub total_agents: usize,
    pub by_status: HashMap<String, usize>,
    pub by_type: HashMap<String, usize>,
    pub by_capability: HashMap<String, usize>,
    pub parent_child_edges: usize,
}

struct RegistryInner {
    agents: HashMap<AgentId, Registration>,
    by_type: HashMap<String, HashSet<AgentId>>,
    by_capability: HashMap<Capability, HashSet<AgentId>>,
    by_parent: HashMap<AgentId, HashSet<AgentId>>,
    factories: HashMap<String, AgentFactory>,
}

impl RegistryInner {
    fn handle(&self, id: &AgentId) -> Option<Arc<AgentHandle>> {
        self.agents.get(id).map(|r| Arc::clone(&r.handle))
    }

    fn children_of(&self, id: &AgentId) -> Vec<Arc<AgentHandle>> {
        self.by_parent
            .get(id)
            .map(|children| children.iter().filter_map(|c| self.handle(c)).collect())
            .unwrap_or_default()
    }

    fn index(&mut self, handle: &AgentHandle) {
        self.by_type
            .entry(handle.agent_type.clone())
            .or_default()
            .insert(handle.id);
        for capability in &handle.capabilities {
            self.by_capability
                .entry(*capability)
                .or_default()
                .insert(handle.id);
        }
        if let Some(parent) = handle.parent_id {
            self.by_parent.entry(parent).or_default().insert(handle.id);
        }
    }

    fn unindex(&mut self, handle: &AgentHandle) {
        if let Some(ids) = self.by_type.get_mut(&handle.agent_type) {
            ids.remove(&handle.id);
            if ids.is_empty() {
                self.by_type.remove(&handle.agent_type);
            }
        }
        for capability in &handle.capabilities {
            if let Some(ids) = self.by_capability.get_mut(capability) {
                ids.remove(&handle.id);
                if ids.is_empty() {
                    self.by_capability.remove(capability);
                }
            }
        }
        if let Some(parent) = handle.parent_id {
            if let Some(ids) = self.by_parent.get_mut(&parent) {
                ids.remove(&handle.id);
                if ids.is_empty() {
                    self.by_parent.remove(&parent);
                }
            }
        }
    }
}

/// In-memory catalogue of live agents and registered agent types.
pub struct AgentRegistry {
    inner: parking_lot::Mutex<RegistryInner>,
}

impl AgentRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: parking_lot::Mutex::new(RegistryInner {
                agents: HashMap::new(),
                by_type: HashMap::new(),
                by_capability: HashMap::new(),
                by_parent: HashMap::new(),
                factories: HashMap::new(),
            }),
        })
    }

    /// Register a factory for an agent type (core or plugin-contributed).
    pub fn register_type(&self, agent_type: &str, factory: AgentFactory) {
        self.inner
            .lock()
            .factories
            .insert(agent_type.to_string(), factory);
    }

    pub fn unregister_type(&self, agent_type: &str) -> bool {
        self.inner.lock().factories.remove(agent_type).is_some()
    }

    pub fn has_type(&self, agent_type: &str) -> bool {
        self.inner.lock().factories.contains_key(agent_type)
    }

    pub fn registered_types(&self) -> Vec<String> {
        self.inner.lock().factories.keys().cloned().collect()
    }

    /// Build a behaviour for a registered type.
    pub fn create(&self, agent_type: &str) -> OrchestratorResult<Box<dyn Agent>> {
        let factory = self
            .inner
            .lock()
            .factories
            .get(agent_type)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownType(agent_type.to_string()))?;
        Ok(factory())
    }

    pub fn register(&self, handle: Arc<AgentHandle>) -> OrchestratorResult<()> {
        let mut inner = self.inner.lock();
        if inner.agents.contains_key(&handle.id) {
            return Err(OrchestratorError::AlreadyRegistered(handle.id));
        }
        inner.index(&handle);
        let now = Utc::now();
        inner.agents.insert(
            handle.id,
            Registration {
                handle,
                registered_at: now,
                last_seen: now,
                metadata: HashMap::new(),
            },
        );
        Ok(())
    }

    pub fn unregister(&self, id: AgentId) -> Option<Arc<AgentHandle>> {
        let mut inner = self.inner.lock();
        let registration = inner.agents.remove(&id)?;
        inner.unindex(&registration.handle);
        Some(registration.handle)
    }

    /// Fetch an agent, refreshing its last-seen time.
    pub fn get(&self, id: AgentId) -> Option<Arc<AgentHandle>> {
        let mut inner = self.inner.lock();
        let registration = inner.agents.get_mut(&id)?;
        registration.last_seen = Utc::now();
        Some(Arc::clone(&registration.handle))
    }

    pub fn exists(&self, id: AgentId) -> bool {
        self.inner.lock().agents.contains_key(&id)
    }

    pub fn registered_at(&self, id: AgentId) -> Option<DateTime<Utc>> {
        self.inner.lock().agents.get(&id).map(|r| r.registered_at)
    }

    pub fn list_all(&self) -> Vec<Arc<AgentHandle>> {
        self.inner
            .lock()
            .agents
            .values()
            .map(|r| Arc::clone(&r.handle))
            .collect()
    }

    pub fn list_by_type(&self, agent_type: &str) -> Vec<Arc<AgentHandle>> {
        let inner = self.inner.lock();
        inner
            .by_type
            .get(agent_type)
            .map(|ids| ids.iter().filter_map(|id| inner.handle(id)).collect())
            .unwrap_or_default()
    }

    pub fn list_by_capability(&self, capability: Capability) -> Vec<Arc<AgentHandle>> {
        let inner = self.inner.lock();
        inner
            .by_capability
            .get(&capability)
            .map(|ids| ids.iter().filter_map(|id| inner.handle(id)).collect())
            .unwrap_or_default()
    }

    pub fn list_by_status(&self, status: AgentStatus) -> Vec<Arc<AgentHandle>> {
        self.inner
            .lock()
            .agents
            .values()
            .filter(|r| r.handle.status() == status)
            .map(|r| Arc::clone(&r.handle))
            .collect()
    }

    /// Agents matching every given criterion.
    pub fn find(&self, filter: &AgentFilter) -> Vec<Arc<AgentHandle>> {
        self.inner
            .lock()
            .agents
            .values()
            .map(|r| &r.handle)
            .filter(|handle| {
                filter
                    .agent_type
                    .as_ref()
                    .map_or(true, |t| &handle.agent_type == t)
            })
            .filter(|handle| {
                filter.capabilities.as_ref().map_or(true, |required| {
                    required.iter().all(|c| handle.capabilities.contains(c))
                })
            })
            .filter(|handle| filter.status.map_or(true, |s| handle.status() == s))
            .map(Arc::clone)
            .collect()
    }

    pub fn children(&self, id: AgentId) -> Vec<Arc<AgentHandle>> {
        self.inner.lock().children_of(&id)
    }

    pub fn parent(&self, id: AgentId) -> Option<Arc<AgentHandle>> {
        let inner = self.inner.lock();
        let parent_id = inner.handle(&id)?.parent_id?;
        inner.handle(&parent_id)
    }

    /// Parent, grandparent and so on up to a root.
    pub fn ancestry(&self, id: AgentId) -> Vec<Arc<AgentHandle>> {
        let inner = self.inner.lock();
        let mut ancestors = Vec::new();
        let mut current = inner.handle(&id).and_then(|h| h.parent_id);
        while let Some(parent_id) = current {
            match inner.handle(&parent_id) {
                Some(parent) => {
                    current = parent.parent_id;
                    ancestors.push(parent);
                }
                None => break,
            }
        }
        ancestors
    }

    /// All transitive children, breadth-first.
    pub fn descendants(&self, id: AgentId) -> Vec<Arc<AgentHandle>> {
        let inner = self.inner.lock();
        let mut descendants = Vec::new();
        let mut frontier = VecDeque::from([id]);
        while let Some(current) = frontier.pop_front() {
            for child in inner.children_of(&current) {
                frontier.push_back(child.id);
                descendants.push(child);
            }
        }
        descendants
    }

    pub fn metadata(&self, id: AgentId) -> Option<HashMap<String, Value>> {
        self.inner.lock().agents.get(&id).map(|r| r.metadata.clone())
    }

    pub fn update_metadata(&self, id: AgentId, updates: HashMap<String, Value>) -> bool {
        let mut inner = self.inner.lock();
        match inner.agents.get_mut(&id) {
            Some(registration) => {
                registration.metadata.extend(updates);
                true
            }
            None => false,
        }
    }

    pub fn statistics(&self) -> RegistryStatistics {
        let inner = self.inner.lock();
        let mut by_status: HashMap<String, usize> = HashMap::new();
        let mut by_type: HashMap<String, usize> = HashMap::new();
        let mut by_capability: HashMap<String, usize> = HashMap::new();

        for registration in inner.agents.values() {
            let handle = &registration.handle;
            *by_status.entry(handle.status().to_string()).or_default() += 1;
            *by_type.entry(handle.agent_type.clone()).or_default() += 1;
            for capability in &handle.capabilities {
                *by_capability
                    .entry(capability.as_str().to_string())
                    .or_default() += 1;
            }
        }

        RegistryStatistics {
            total_agents: inner.agents.len(),
            by_status,
            by_type,
            by_capability,
            parent_child_edges: inner.by_parent.values().map(HashSet::len).sum(),
        }
    }

    pub fn agent_count(&self) -> usize {
        self.inner.lock().agents.len()
    }

    /// Best READY agent for a set of required capabilities, preferring the
    /// given type when any match it. Ties resolve by id for stability.
    pub fn find_best_agent(
        &self,
        required: &[Capability],
        preferred_type: Option<&str>,
    ) -> Option<Arc<AgentHandle>> {
        let mut candidates = self.find(&AgentFilter {
            agent_type: preferred_type.map(str::to_string),
            capabilities: Some(required.to_vec()),
            status: Some(AgentStatus::Ready),
        });
        if candidates.is_empty() && preferred_type.is_some() {
            candidates = self.find(&AgentFilter {
                agent_type: None,
                capabilities: Some(required.to_vec()),
                status: Some(AgentStatus::Ready),
            });
        }

        candidates
            .into_iter()
            .map(|handle| (score_agent(&handle, required), handle))
            .max_by(|a, b| {
                a.0.total_cmp(&b.0)
                    .then_with(|| b.1.id.cmp(&a.1.id))
            })
            .map(|(_, handle)| handle)
    }
}

/// Capability-match score: base 10 for covering the requirements, +0.5 per
/// additional capability, +2 when the agent's set exceeds the requirement
/// by at most two (a specialist rather than a generalist).
fn score_agent(handle: &AgentHandle, required: &[Capability]) -> f64 {
    let required_set: HashSet<&Capability> = required.iter().collect();
    let extra = handle
        .capabilities
        .iter()
        .filter(|c| !required_set.contains(c))
        .count();

    let mut score = 10.0 + extra as f64 * 0.5;
    if handle.capabilities.len() <= required.len() + 2 {
        score += 2.0;
    }
    score
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::LoggingAgent;

    fn handle(capabilities: Vec<Capability>) -> Arc<AgentHandle> {
        AgentHandle::new("research", capabilities, None, Box::<LoggingAgent>::default())
    }

    #[test]
    fn specialist_outranks_generalist() {
        let required = [Capability::WebSearch];
        let specialist = handle(vec![Capability::WebSearch, Capability::Summarization]);
        let generalist = handle(vec![
            Capability::WebSearch,
            Capability::Analysis,
            Capability::Synthesis,
            Capability::Translation,
            Capability::Judging,
        ]);

        // specialist: 10 + 0.5 + 2; generalist: 10 + 2.0 and no bonus
        assert!(score_agent(&specialist, &required) > score_agent(&generalist, &required));
    }

    #[test]
    fn indices_are_consistent_after_unregister() {
        let registry = AgentRegistry::new();
        let agent = handle(vec![Capability::WebSearch, Capability::Analysis]);
        let id = agent.id;
        registry.register(agent).unwrap();

        assert_eq!(registry.list_by_type("research").len(), 1);
        assert_eq!(registry.list_by_capability(Capability::Analysis).len(), 1);

        registry.unregister(id);
        assert!(registry.get(id).is_none());
        assert!(registry.list_by_type("research").is_empty());
        assert!(registry.list_by_capability(Capability::WebSearch).is_empty());
        assert!(registry.list_by_capability(Capability::Analysis).is_empty());
    }
}
