//! CLI command definitions for jobforge.

use std::sync::Arc;

use clap::Parser;
use tracing::info;
use uuid::Uuid;

use crate::agent::HttpAgentClient;
use crate::api::{self, AppState};
use crate::config::OrchestratorConfig;
use crate::dispatch::{Dispatcher, HealthChecker, JobExecutor};
use crate::engine::{LocalEngine, Schedules};
use crate::metrics;
use crate::registry::{hash_secret, AgentRegistry};
use crate::store::{JobStore, MemStore, PgStore};
use crate::stream::{LogNotifier, StreamManager};

/// Multi-tenant dispatch engine for long-running code-generation jobs.
#[derive(Parser)]
#[command(name = "jobforge")]
#[command(about = "Dispatch long-running code-generation jobs to remote agents")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the orchestrator: REST surface, agent stream, and schedules.
    Serve(ServeArgs),

    /// Register an agent API key for an organization.
    SeedKey(SeedKeyArgs),
}

/// Arguments for `jobforge serve`.
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Listen address for the HTTP server.
    #[arg(long)]
    pub listen: Option<String>,

    /// PostgreSQL connection URL.
    #[arg(long)]
    pub database_url: Option<String>,

    /// Storage backend.
    #[arg(long, default_value = "postgres", value_parser = ["postgres", "memory"])]
    pub store: String,
}

/// Arguments for `jobforge seed-key`.
#[derive(Parser, Debug)]
pub struct SeedKeyArgs {
    /// Organization id the key belongs to.
    #[arg(long)]
    pub org_id: Uuid,

    /// The raw API key; only its hash is stored.
    #[arg(long)]
    pub api_key: String,

    /// PostgreSQL connection URL.
    #[arg(long)]
    pub database_url: Option<String>,
}

/// Parses command-line arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Runs the parsed CLI command.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::SeedKey(args) => seed_key(args).await,
    }
}

async fn build_store(kind: &str, database_url: &str) -> anyhow::Result<Arc<dyn JobStore>> {
    match kind {
        "memory" => Ok(Arc::new(MemStore::new())),
        _ => Ok(Arc::new(PgStore::connect(database_url).await?)),
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = OrchestratorConfig::from_env()?;
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(database_url) = args.database_url {
        config.database_url = database_url;
    }

    metrics::init_metrics()?;
    let store = build_store(&args.store, &config.database_url).await?;

    let streams = Arc::new(StreamManager::new());
    let notifier = Arc::new(LogNotifier::new());
    let client = Arc::new(HttpAgentClient::new());
    let executor = Arc::new(JobExecutor::new(
        Arc::clone(&store),
        Arc::clone(&streams),
        Arc::clone(&notifier),
        client,
        config.clone(),
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        Arc::clone(&streams),
        executor,
        config.clone(),
    ));
    let health = Arc::new(HealthChecker::new(
        Arc::clone(&store),
        Arc::clone(&streams),
        config.clone(),
    ));
    let engine = Arc::new(LocalEngine::new(
        Arc::clone(&dispatcher),
        Arc::clone(&health),
        config.clone(),
    ));
    let schedules: Arc<dyn Schedules> = engine.clone();
    let registry = Arc::new(AgentRegistry::new(
        Arc::clone(&store),
        Arc::clone(&schedules),
    ));

    let state = AppState {
        store,
        streams,
        notifier,
        registry,
        health,
        dispatcher,
        schedules,
        config,
    };

    let engine_for_shutdown = Arc::clone(&engine);
    let shutdown = async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received");
        engine_for_shutdown.shutdown().await;
    };

    api::serve(state, shutdown).await
}

async fn seed_key(args: SeedKeyArgs) -> anyhow::Result<()> {
    let mut config = OrchestratorConfig::from_env()?;
    if let Some(database_url) = args.database_url {
        config.database_url = database_url;
    }
    let store = PgStore::connect(&config.database_url).await?;
    store
        .insert_api_key(args.org_id, &hash_secret(&args.api_key))
        .await?;
    info!(org_id = %args.org_id, "API key registered");
    Ok(())
}
