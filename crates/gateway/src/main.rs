use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use sa_gateway::cli::{self, Cli, Command, ConfigCommand};
use sa_gateway::health::{AdapterClassifier, HealthSupervisor};
use sa_gateway::idle_reaper::IdleReaper;
use sa_gateway::interfaces::{ConfigContactsDirectory, DisabledVisionAnalyzer, InMemoryReplyChainReader, NoopSummarizeHook};
use sa_gateway::ipc::IpcServer;
use sa_gateway::orchestrator::{AgentAdapterFactory, Orchestrator};

use sa_sessions::adapter::fake::FakeAgentAdapter;
use sa_sessions::adapter::AgentAdapter;
use sa_sessions::registry::SessionRegistry;
use sa_sessions::TranscriptReader;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let (config, config_path) = cli::load_config()?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Doctor => {
            let passed = sa_gateway::cli::doctor::run(&config, &config_path).await?;
            std::process::exit(if passed { 0 } else { 1 });
        }
        Command::Config(ConfigCommand::Validate) => {
            let ok = sa_gateway::cli::config::validate(&config, &config_path);
            std::process::exit(if ok { 0 } else { 1 });
        }
        Command::Config(ConfigCommand::Show) => {
            sa_gateway::cli::config::show(&config);
            Ok(())
        }
        Command::Version => {
            println!("serialagent {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// `[Open Question, §9 #1]`: no real agent CLI is available in this
/// environment to shell out to. `FakeAgentAdapter` is the spec-sanctioned
/// stand-in — a real deployment swaps this factory for one wrapping its
/// own CLI, without touching the orchestrator.
fn default_adapter_factory() -> Arc<dyn AgentAdapterFactory> {
    Arc::new(|| Box::new(FakeAgentAdapter::new()) as Box<dyn AgentAdapter>)
}

async fn serve(config: sa_domain::config::Config) -> anyhow::Result<()> {
    let issues = config.validate();
    let fatal: Vec<_> = issues
        .iter()
        .filter(|e| e.severity == sa_domain::config::ConfigSeverity::Error)
        .collect();
    for issue in &issues {
        tracing::warn!(%issue, "config issue");
    }
    if !fatal.is_empty() {
        anyhow::bail!("refusing to start: {} configuration error(s)", fatal.len());
    }

    std::fs::create_dir_all(&config.paths.state_dir)?;
    std::fs::create_dir_all(&config.paths.transcripts_root)?;
    std::fs::create_dir_all(&config.paths.logs_root)?;

    let config = Arc::new(config);
    let registry = Arc::new(SessionRegistry::load(config.paths.registry_path()));
    let contacts = Arc::new(ConfigContactsDirectory::new(
        config.owner.phone.clone(),
        config.owner.name.clone(),
    ));
    let reply_chain = Arc::new(InMemoryReplyChainReader);
    let vision = Arc::new(DisabledVisionAnalyzer);
    let summarize = Arc::new(NoopSummarizeHook);
    let workspace_root = config.paths.state_dir.join("workspaces");

    let orchestrator = Arc::new(Orchestrator::new(
        registry.clone(),
        contacts,
        reply_chain,
        vision,
        summarize,
        default_adapter_factory(),
        config.clone(),
        workspace_root,
    ));

    orchestrator.create_master_session().await?;

    let transcripts = Arc::new(TranscriptReader::new(config.paths.transcripts_root.clone()));
    let classifier = Arc::new(AdapterClassifier::new(
        default_adapter_factory(),
        config.paths.state_dir.join("health-scratch"),
        config.session.default_model.clone(),
        config.session.max_buffer_size_bytes as usize,
    ));
    let health = Arc::new(HealthSupervisor::new(
        orchestrator.clone(),
        transcripts,
        classifier,
        config.health.clone(),
    ));
    health.spawn();

    let idle_reaper = Arc::new(IdleReaper::new(orchestrator.clone(), config.idle_reaper.clone()));
    idle_reaper.spawn();

    spawn_registry_flush_loop(registry.clone());

    let ipc = Arc::new(IpcServer::new(orchestrator.clone(), config.ipc.clone()));
    ipc.spawn().await?;

    // Backend ingress (iMessage/Signal/voice-app polling) is out of scope
    // for this core (§1 "Out of scope"): no `MessageSource`s are registered
    // by default. A deployment that owns a backend constructs its own
    // `IngressMultiplexer` with that backend's `MessageSource` wired in.

    // §4.7 "Startup" step 2: deferred until after the IPC listener is bound
    // and the process is responsive, per the oddjobs daemon's
    // reconciliation-after-READY convention.
    match orchestrator.resume_pending_summaries().await {
        Ok(resumed) => {
            if resumed > 0 {
                tracing::info!(resumed, "recreated sessions from pending-summary files");
            }
        }
        Err(e) => tracing::warn!(error = %e, "pending-summary startup scan failed"),
    }

    tracing::info!("serialagent started");
    shutdown_signal().await;
    tracing::info!("shutting down");
    orchestrator.shutdown().await?;
    Ok(())
}

/// Background debounce flush (§4.1): collapses bursts of
/// `update_last_message_time` calls into at most one disk write per tick.
/// `flush()` itself is still called unconditionally on graceful shutdown.
const REGISTRY_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

fn spawn_registry_flush_loop(registry: Arc<SessionRegistry>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REGISTRY_FLUSH_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(e) = registry.flush_if_dirty() {
                tracing::warn!(error = %e, "debounced registry flush failed");
            }
        }
    });
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::select! {
        _ = sigterm.recv() => {},
        _ = ctrl_c => {},
    }
}
