//! Top-level runtime owning every component, with explicit lifecycle:
//! construction leaves-first, background loops on `start`, shutdown in
//! reverse dependency order.

use crate::bus::MessageBus;
use crate::config::RuntimeConfig;
use crate::consent::ConsentGate;
use crate::memory::MemoryManager;
use crate::orchestrator::Orchestrator;
use crate::plugins::PluginLoader;
use crate::quality::QualityMonitor;
use crate::queue::MessageQueue;
use crate::registry::AgentRegistry;
use std::sync::Arc;

/// The assembled runtime.
pub struct Runtime {
    config: RuntimeConfig,
    queue: Arc<MessageQueue>,
    bus: Arc<MessageBus>,
    registry: Arc<AgentRegistry>,
    memory: Arc<MemoryManager>,
    consent: Arc<ConsentGate>,
    plugins: Arc<PluginLoader>,
    orchestrator: Arc<Orchestrator>,
    quality: Arc<QualityMonitor>,
}

impl Runtime {
    /// Build all components and start the background loops.
    pub fn initialize(config: RuntimeConfig) -> Self {
        let queue = MessageQueue::with_intervals(
            config.dead_letter_interval,
            config.expiry_sweep_interval,
        );
        queue.start();
        tracing::info!("message queue initialized");

        let bus = MessageBus::new(Arc::clone(&queue));
        bus.initialize();
        tracing::info!("message bus initialized");

        let registry = AgentRegistry::new();
        tracing::info!("agent registry initialized");

        let memory = MemoryManager::new(&config);
        let consent = Arc::new(ConsentGate::new(Arc::clone(&memory)));
        tracing::info!("memory manager initialized");

        let plugins = PluginLoader::new(Arc::clone(&registry));
        let quality = Arc::new(QualityMonitor::with_overrides(&config.quality_thresholds));

        let orchestrator = Orchestrator::new(Arc::clone(&queue), Arc::clone(&registry), &config);
        orchestrator.start();
        tracing::info!(
            max_concurrent_agents = config.max_concurrent_agents,
            "orchestrator initialized"
        );

        Self {
            config,
            queue,
            bus,
            registry,
            memory,
            consent,
            plugins,
            orchestrator,
            quality,
        }
    }

    /// Shut down in reverse order of initialisation: agents first, then
    /// plugins, then the queue's background loops.
    pub async fn shutdown(&self) {
        tracing::info!("runtime shutting down");
        self.orchestrator.shutdown().await;
        self.plugins.shutdown().await;
        self.queue.shutdown().await;
        tracing::info!("runtime stopped");
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<MessageQueue> {
        &self.queue
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    pub fn consent(&self) -> &Arc<ConsentGate> {
        &self.consent
    }

    pub fn plugins(&self) -> &Arc<PluginLoader> {
        &self.plugins
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn quality(&self) -> &Arc<QualityMonitor> {
        &self.quality
    }
}
