use intents_orchestrator::{
    agent::Orchestrator,
    api::start_server,
    config::{EngineConfig, ServerConfig},
    state::{InMemoryOperationStore, OperationStore, PostgresOperationStore},
    tools::{ExecutionCapability, SimulatedSolver, SolverApiClient},
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let server = ServerConfig::from_env()?;
    let engine = EngineConfig::from_env()?;

    info!("🚀 Intents Orchestrator - API Server");
    info!("📍 Port: {}", server.port);

    let store: Arc<dyn OperationStore> = match server.database_url.as_deref() {
        Some(url) => Arc::new(PostgresOperationStore::connect_lazy(url)?),
        None => {
            warn!("DATABASE_URL not set; operations are kept in memory only");
            Arc::new(InMemoryOperationStore::new())
        }
    };

    let capability: Arc<dyn ExecutionCapability> = match server.solver_api_base_url.as_deref() {
        Some(base_url) => Arc::new(SolverApiClient::new(base_url)?),
        None => {
            warn!("SOLVER_API_BASE_URL not set; using the simulated solver");
            Arc::new(SimulatedSolver::new(1.0))
        }
    };
    info!(capability = capability.name(), "Execution capability ready");

    let orchestrator = Arc::new(Orchestrator::new(store, capability, engine));
    info!("✅ Orchestrator initialized");

    let shutdown = CancellationToken::new();
    let scheduler = {
        let orchestrator = orchestrator.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { orchestrator.run_scheduler(shutdown).await })
    };

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
                shutdown.cancel();
            }
        });
    }

    info!("📡 Starting API server...");
    tokio::select! {
        result = start_server(orchestrator, server.port) => result?,
        _ = shutdown.cancelled() => {}
    }

    shutdown.cancel();
    scheduler.await?;
    Ok(())
}
