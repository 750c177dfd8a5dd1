//! External execution capability
//!
//! Everything the engine does to the outside world goes through
//! `ExecutionCapability`: solver quotes, deposits, bridge status,
//! withdrawals and social posts. Every side-effecting call carries an
//! idempotency key.

pub mod simulated;

pub use simulated::SimulatedSolver;

use crate::error::OrchestrationError;
use crate::models::{
    BridgeStatus, OperationParameters, Quote, Receipt, StepFailure,
};
use crate::Result;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CapabilityError {
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("rejected by counterparty: {0}")]
    Rejected(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl CapabilityError {
    /// Transient errors are retried with backoff; everything else is terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CapabilityError::Timeout(_)
                | CapabilityError::RateLimited(_)
                | CapabilityError::Transport(_)
        )
    }
}

impl From<CapabilityError> for StepFailure {
    fn from(error: CapabilityError) -> Self {
        StepFailure {
            retryable: error.is_retryable(),
            reason: error.to_string(),
        }
    }
}

impl From<CapabilityError> for OrchestrationError {
    fn from(error: CapabilityError) -> Self {
        OrchestrationError::CapabilityError(error.to_string())
    }
}

pub type CapabilityResult<T> = std::result::Result<T, CapabilityError>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuoteRequest {
    pub source_asset: String,
    pub destination_asset: String,
    pub amount: f64,
    pub slippage_pct: f64,
    pub destination_chain: String,
}

impl QuoteRequest {
    pub fn from_parameters(params: &OperationParameters) -> Option<Self> {
        Some(Self {
            source_asset: params.source_asset.clone()?,
            destination_asset: params.destination_asset.clone()?,
            amount: params.amount?,
            slippage_pct: params.slippage_pct(),
            destination_chain: params.destination_chain().to_string(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferRequest {
    pub operation_id: Uuid,
    pub asset: String,
    pub amount: f64,
    pub chain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_wallet: Option<String>,
}

/// Trait for the external swap / bridge / posting capability
#[async_trait::async_trait]
pub trait ExecutionCapability: Send + Sync {
    fn name(&self) -> &'static str;

    /// Indicative quote. Also used as the price feed for price triggers.
    async fn get_quote(&self, request: &QuoteRequest) -> CapabilityResult<Quote>;

    async fn accept_quote(&self, quote: &Quote, idempotency_key: &str)
        -> CapabilityResult<Receipt>;

    async fn submit_deposit(
        &self,
        request: &TransferRequest,
        idempotency_key: &str,
    ) -> CapabilityResult<Receipt>;

    async fn get_bridge_status(&self, intent: &Receipt) -> CapabilityResult<BridgeStatus>;

    async fn submit_withdrawal(
        &self,
        request: &TransferRequest,
        idempotency_key: &str,
    ) -> CapabilityResult<Receipt>;

    async fn publish_post(&self, content: &str, idempotency_key: &str)
        -> CapabilityResult<Receipt>;
}

// ===== HTTP solver client =====

/// HTTP client for a solver / bridge relay service.
#[derive(Clone)]
pub struct SolverApiClient {
    client: Client,
    base_url: String,
}

impl SolverApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post_json(
        &self,
        path: &str,
        body: &Value,
        idempotency_key: Option<&str>,
    ) -> CapabilityResult<Value> {
        let url = format!("{}{}", self.base_url, path);

        let mut request = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(key) = idempotency_key {
            request = request.header("Idempotency-Key", key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                CapabilityError::Timeout(format!("{}: {}", path, e))
            } else {
                CapabilityError::Transport(format!("{}: {}", path, e))
            }
        })?;

        let status = response.status();
        let body = response
            .json::<Value>()
            .await
            .map_err(|e| CapabilityError::InvalidResponse(format!("{}: {}", path, e)))?;

        if !status.is_success() {
            return Err(classify_failure(status, &body));
        }

        Ok(body)
    }

    fn receipt(body: &Value, idempotency_key: &str) -> CapabilityResult<Receipt> {
        let reference = body
            .get("reference")
            .or_else(|| body.get("tx_hash"))
            .or_else(|| body.get("intent_hash"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                CapabilityError::InvalidResponse(format!("missing reference in {}", body))
            })?;

        Ok(Receipt {
            reference: reference.to_string(),
            idempotency_key: idempotency_key.to_string(),
            submitted_at: Utc::now(),
            detail: body.clone(),
        })
    }
}

/// Map a non-success response onto the capability error taxonomy.
fn classify_failure(status: StatusCode, body: &Value) -> CapabilityError {
    let code = body.get("code").and_then(|v| v.as_str()).unwrap_or_default();
    let message = body
        .get("message")
        .or_else(|| body.get("error"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| body.to_string());

    match (status, code) {
        (StatusCode::TOO_MANY_REQUESTS, _) => CapabilityError::RateLimited(message),
        (StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT, _) => {
            CapabilityError::Timeout(message)
        }
        (_, "insufficient_balance") => CapabilityError::InsufficientBalance(message),
        (_, "invalid_signature") => CapabilityError::InvalidSignature(message),
        (s, _) if s.is_server_error() => CapabilityError::Transport(format!("{}: {}", s, message)),
        _ => CapabilityError::Rejected(message),
    }
}

#[async_trait::async_trait]
impl ExecutionCapability for SolverApiClient {
    fn name(&self) -> &'static str {
        "solver_api"
    }

    async fn get_quote(&self, request: &QuoteRequest) -> CapabilityResult<Quote> {
        let body = self
            .post_json("/v1/quote", &json!(request), None)
            .await?;
        serde_json::from_value(body)
            .map_err(|e| CapabilityError::InvalidResponse(format!("quote: {}", e)))
    }

    async fn accept_quote(
        &self,
        quote: &Quote,
        idempotency_key: &str,
    ) -> CapabilityResult<Receipt> {
        let body = self
            .post_json(
                "/v1/quote/accept",
                &json!({ "quote_hash": quote.quote_hash }),
                Some(idempotency_key),
            )
            .await?;
        Self::receipt(&body, idempotency_key)
    }

    async fn submit_deposit(
        &self,
        request: &TransferRequest,
        idempotency_key: &str,
    ) -> CapabilityResult<Receipt> {
        let body = self
            .post_json("/v1/deposit", &json!(request), Some(idempotency_key))
            .await?;
        Self::receipt(&body, idempotency_key)
    }

    async fn get_bridge_status(&self, intent: &Receipt) -> CapabilityResult<BridgeStatus> {
        let body = self
            .post_json(
                "/v1/bridge/status",
                &json!({ "reference": intent.reference }),
                None,
            )
            .await?;
        body.get("status")
            .cloned()
            .ok_or_else(|| CapabilityError::InvalidResponse(format!("missing status in {}", body)))
            .and_then(|status| {
                serde_json::from_value(status)
                    .map_err(|e| CapabilityError::InvalidResponse(format!("bridge status: {}", e)))
            })
    }

    async fn submit_withdrawal(
        &self,
        request: &TransferRequest,
        idempotency_key: &str,
    ) -> CapabilityResult<Receipt> {
        let body = self
            .post_json("/v1/withdraw", &json!(request), Some(idempotency_key))
            .await?;
        Self::receipt(&body, idempotency_key)
    }

    async fn publish_post(
        &self,
        content: &str,
        idempotency_key: &str,
    ) -> CapabilityResult<Receipt> {
        let body = self
            .post_json("/v1/posts", &json!({ "content": content }), Some(idempotency_key))
            .await?;
        Self::receipt(&body, idempotency_key)
    }
}
