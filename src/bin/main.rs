use intents_orchestrator::{
    agent::Orchestrator,
    config::EngineConfig,
    models::{
        ApprovalDecision, ApprovalInput, OperationKind, OperationParameters, StructuredRequest,
    },
    state::InMemoryOperationStore,
    tools::SimulatedSolver,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .init();

    info!("Intents orchestrator demo starting");

    let orchestrator = Orchestrator::new(
        Arc::new(InMemoryOperationStore::new()),
        Arc::new(SimulatedSolver::new(0.00125)),
        EngineConfig::immediate(),
    );
    let mut events = orchestrator.subscribe();

    let request = StructuredRequest {
        operation_kind: OperationKind::Swap,
        parameters: OperationParameters {
            source_asset: Some("NEAR".to_string()),
            destination_asset: Some("ETH".to_string()),
            amount: Some(5.0),
            ..Default::default()
        },
        session_id: "demo-session".to_string(),
        requester: "demo-user".to_string(),
    };

    let routed = orchestrator
        .route_message(&request.session_id, "swap 5 NEAR for ETH", None)
        .await?;
    info!(mode = ?routed.mode, confidence = routed.confidence, "Message routed");

    let operation_id = orchestrator.submit(request).await?;
    orchestrator
        .resolve_approval(ApprovalInput {
            operation_id,
            decision: ApprovalDecision::Approved,
            approver: "demo-approver".to_string(),
        })
        .await?;

    println!("\n=== STATUS EVENTS ===");
    let mut n = 0;
    while let Ok(event) = events.try_recv() {
        n += 1;
        match event.sub_state {
            Some(sub) => println!("  {}: {}/{} - {}", n, event.top_state, sub, event.message),
            None => println!("  {}: {} - {}", n, event.top_state, event.message),
        }
    }

    let snapshot = orchestrator.status(operation_id).await?;
    println!("\n=== FINAL SNAPSHOT ===");
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
