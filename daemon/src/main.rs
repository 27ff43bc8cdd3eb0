/// Meridian daemon - process entry point.
/// Initialises the orchestration runtime, registers the core agent types,
/// and runs until interrupted.
use clap::Parser;
use meridian_core::{
    AgentFactory, Capability, LoggingAgent, Runtime, RuntimeConfig, SpawnRequest,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "meridian-daemon",
    about = "Multi-agent research orchestration runtime",
    version = env!("CARGO_PKG_VERSION")
)]
struct Args {
    /// Maximum concurrent agents (overrides MAX_CONCURRENT_AGENTS)
    #[arg(long, value_name = "COUNT")]
    max_agents: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", default_value = "info")]
    log_level: String,

    /// Spawn a root research agent at startup
    #[arg(long)]
    seed_agent: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Core agent types available without any plugin.
const CORE_AGENT_TYPES: [&str; 4] = ["research", "analysis", "synthesis", "judge"];

fn register_core_agent_types(runtime: &Runtime) {
    for agent_type in CORE_AGENT_TYPES {
        let factory: AgentFactory = Arc::new(|| Box::<LoggingAgent>::default());
        runtime.registry().register_type(agent_type, factory);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)),
        )
        .init();

    let mut config = RuntimeConfig::from_env();
    if let Some(max_agents) = args.max_agents {
        config.max_concurrent_agents = max_agents;
    }

    let runtime = Runtime::initialize(config);
    register_core_agent_types(&runtime);
    info!("meridian runtime is ready");

    if args.seed_agent {
        let request = SpawnRequest::new(
            "research",
            vec![Capability::WebSearch, Capability::Summarization],
        );
        match runtime.orchestrator().spawn(request).await {
            Ok(agent_id) => info!(%agent_id, "seed research agent spawned"),
            Err(error) => tracing::warn!(%error, "seed agent spawn failed"),
        }
    }

    wait_for_shutdown_signal().await;
    runtime.shutdown().await;
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                    _ = terminate.recv() => info!("received SIGTERM"),
                }
            }
            Err(error) => {
                tracing::warn!(%error, "SIGTERM handler unavailable, waiting for SIGINT");
                let _ = tokio::signal::ctrl_c().await;
                info!("received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received interrupt");
    }
}
