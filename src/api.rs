//! REST API Server for the intents orchestrator
//!
//! Exposes submission, status, approval, cancellation, trigger
//! registration and chat routing over HTTP.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::agent::Orchestrator;
use crate::error::OrchestrationError;
use crate::models::{ApprovalDecision, ApprovalInput, StructuredRequest, TriggerCondition};

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Deserialize)]
pub struct ApprovalRequest {
    pub decision: ApprovalDecision,
    pub approver: String,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub requested_by: String,
}

#[derive(Debug, Deserialize)]
pub struct TriggerRequest {
    pub condition: TriggerCondition,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    pub message: String,
    /// Interpreter confidence; the keyword detector is used when absent.
    #[serde(default)]
    pub confidence: Option<f32>,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

type ApiResult = (StatusCode, Json<ApiResponse>);

fn respond<T: Serialize>(result: crate::Result<T>) -> ApiResult {
    match result {
        Ok(data) => (StatusCode::OK, Json(ApiResponse::success(data))),
        Err(e) => (error_status(&e), Json(ApiResponse::error(e.to_string()))),
    }
}

fn error_status(error: &OrchestrationError) -> StatusCode {
    match error {
        OrchestrationError::OperationNotFound(_) => StatusCode::NOT_FOUND,
        OrchestrationError::Validation(_) | OrchestrationError::UuidError(_) => {
            StatusCode::BAD_REQUEST
        }
        OrchestrationError::InvalidTransition { .. }
        | OrchestrationError::ApprovalRequired(_)
        | OrchestrationError::StepInFlight(_)
        | OrchestrationError::VersionConflict { .. }
        | OrchestrationError::DuplicateOperation(_)
        | OrchestrationError::ContentionExhausted(_) => StatusCode::CONFLICT,
        OrchestrationError::CapabilityError(_) | OrchestrationError::HttpError(_) => {
            StatusCode::BAD_GATEWAY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Operation Endpoints
/// =============================

async fn submit_operation(
    State(state): State<ApiState>,
    Json(req): Json<StructuredRequest>,
) -> ApiResult {
    info!(
        kind = %req.operation_kind,
        session_id = %req.session_id,
        requester = %req.requester,
        "Received operation request"
    );

    let result = async move {
        let id = state.orchestrator.submit(req).await?;
        state.orchestrator.status(id).await
    }
    .await;
    respond(result)
}

async fn get_operation(State(state): State<ApiState>, Path(id): Path<Uuid>) -> ApiResult {
    respond(state.orchestrator.status(id).await)
}

async fn audit_operation(State(state): State<ApiState>, Path(id): Path<Uuid>) -> ApiResult {
    respond(state.orchestrator.audit(id).await)
}

async fn resolve_approval(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ApprovalRequest>,
) -> ApiResult {
    respond(
        state
            .orchestrator
            .resolve_approval(ApprovalInput {
                operation_id: id,
                decision: req.decision,
                approver: req.approver,
            })
            .await,
    )
}

async fn cancel_operation(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(req): Json<CancelRequest>,
) -> ApiResult {
    respond(state.orchestrator.cancel(id, &req.requested_by).await)
}

async fn register_trigger(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(req): Json<TriggerRequest>,
) -> ApiResult {
    respond(
        state
            .orchestrator
            .register_trigger(id, req.condition, req.expires_at)
            .await,
    )
}

/// =============================
/// Session Endpoints
/// =============================

async fn list_session_operations(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> ApiResult {
    respond(state.orchestrator.list_for_session(&session_id).await)
}

async fn route_message(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
    Json(req): Json<MessageRequest>,
) -> ApiResult {
    respond(
        state
            .orchestrator
            .route_message(&session_id, &req.message, req.confidence)
            .await,
    )
}

/// =============================
/// Router
/// =============================

pub fn create_router(orchestrator: Arc<Orchestrator>) -> Router {
    let state = ApiState { orchestrator };

    Router::new()
        .route("/health", get(health))
        .route("/api/operations", post(submit_operation))
        .route("/api/operations/:id", get(get_operation))
        .route("/api/operations/:id/audit", get(audit_operation))
        .route("/api/operations/:id/approval", post(resolve_approval))
        .route("/api/operations/:id/cancel", post(cancel_operation))
        .route("/api/operations/:id/trigger", post(register_trigger))
        .route("/api/sessions/:id/operations", get(list_session_operations))
        .route("/api/sessions/:id/messages", post(route_message))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    orchestrator: Arc<Orchestrator>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(orchestrator);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::state::InMemoryOperationStore;
    use crate::tools::SimulatedSolver;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_app() -> Router {
        let orchestrator = Orchestrator::new(
            Arc::new(InMemoryOperationStore::new()),
            Arc::new(SimulatedSolver::new(1.0)),
            EngineConfig::immediate(),
        );
        create_router(Arc::new(orchestrator))
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let response = test_app()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_submit_then_approve() {
        let app = test_app();

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/operations",
                serde_json::json!({
                    "operation_kind": "SWAP",
                    "session_id": "chat-1",
                    "requester": "alice",
                    "parameters": {
                        "source_asset": "NEAR",
                        "destination_asset": "ETH",
                        "amount": 5.0
                    }
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["data"]["top_state"], "AWAITING_APPROVAL");
        let id = body["data"]["operation_id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(post_json(
                &format!("/api/operations/{}/approval", id),
                serde_json::json!({ "decision": "approved", "approver": "bob" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["data"]["top_state"], "COMPLETED");

        // A finished operation absorbs late decisions.
        let response = app
            .oneshot(post_json(
                &format!("/api/operations/{}/approval", id),
                serde_json::json!({ "decision": "rejected", "approver": "eve" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["data"]["top_state"], "COMPLETED");
    }

    #[tokio::test]
    async fn test_approving_incomplete_operation_conflicts() {
        let app = test_app();

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/operations",
                serde_json::json!({
                    "operation_kind": "SWAP",
                    "session_id": "chat-2",
                    "requester": "alice",
                    "parameters": { "source_asset": "NEAR" }
                }),
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["data"]["top_state"], "COLLECTING");
        let id = body["data"]["operation_id"].as_str().unwrap().to_string();

        let response = app
            .oneshot(post_json(
                &format!("/api/operations/{}/approval", id),
                serde_json::json!({ "decision": "approved", "approver": "bob" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_unknown_operation_is_not_found() {
        let response = test_app()
            .oneshot(
                Request::builder()
                    .uri(format!("/api/operations/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_invalid_parameters_are_bad_request() {
        let response = test_app()
            .oneshot(post_json(
                "/api/operations",
                serde_json::json!({
                    "operation_kind": "SWAP",
                    "session_id": "chat-1",
                    "requester": "alice",
                    "parameters": { "source_asset": "NEAR", "destination_asset": "near" }
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_message_routing() {
        let response = test_app()
            .oneshot(post_json(
                "/api/sessions/chat-7/messages",
                serde_json::json!({ "message": "bridge 100 usdc to ethereum" }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["data"]["mode"], "TOOL_OPERATION");
    }
}
