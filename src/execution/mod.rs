//! Step executor
//!
//! Performs the external call behind one sub-state. The caller must have
//! dispatched the step first, which fixes the idempotency key this call
//! carries. No retry loop lives here: failures are classified and handed
//! back to the state machine, which owns backoff and escalation.

use crate::models::{StepFailure, StepOutcome, SubState, ToolOperation};
use crate::tools::{ExecutionCapability, QuoteRequest, TransferRequest};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Chain the solver accepts deposits on.
const DEPOSIT_CHAIN: &str = "near";

pub type StepResult = std::result::Result<StepOutcome, StepFailure>;

pub struct StepExecutor {
    capability: Arc<dyn ExecutionCapability>,
    in_progress: Arc<Mutex<HashSet<String>>>,
}

/// Removes the in-progress marker when the call finishes.
struct InProgress {
    key: String,
    markers: Arc<Mutex<HashSet<String>>>,
}

impl Drop for InProgress {
    fn drop(&mut self) {
        if let Ok(mut markers) = self.markers.lock() {
            markers.remove(&self.key);
        }
    }
}

impl StepExecutor {
    pub fn new(capability: Arc<dyn ExecutionCapability>) -> Self {
        Self {
            capability,
            in_progress: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn claim(&self, key: &str) -> Option<InProgress> {
        let mut markers = self.in_progress.lock().ok()?;
        if !markers.insert(key.to_string()) {
            return None;
        }
        Some(InProgress {
            key: key.to_string(),
            markers: self.in_progress.clone(),
        })
    }

    pub async fn execute(&self, op: &ToolOperation, step: SubState) -> StepResult {
        let attempt = op.attempt(step);
        let key = attempt
            .and_then(|a| a.idempotency_key.clone())
            .ok_or_else(|| StepFailure::unrecoverable(format!("{} executed before dispatch", step)))?;
        let attempt_no = attempt.map_or(0, |a| a.attempts);

        let Some(_marker) = self.claim(&key) else {
            warn!(operation_id = %op.id, step = %step, key = %key, "Call already in progress");
            return Err(StepFailure::retryable(format!("call {} already in progress", key)));
        };

        debug!(
            operation_id = %op.id,
            step = %step,
            attempt = attempt_no,
            key = %key,
            capability = self.capability.name(),
            "Executing step"
        );
        let start = Instant::now();

        let result = match step {
            SubState::Deposit => self.deposit(op, &key).await,
            SubState::Quote => self.quote(op, &key).await,
            SubState::BridgeMonitor => self.bridge(op).await,
            SubState::Withdraw => self.withdraw(op, &key).await,
            SubState::Publish => self.publish(op, &key).await,
            SubState::Done => Err(StepFailure::unrecoverable("nothing to execute in DONE")),
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => info!(
                operation_id = %op.id,
                step = %step,
                attempt = attempt_no,
                elapsed_ms,
                "Step call succeeded"
            ),
            Err(failure) => warn!(
                operation_id = %op.id,
                step = %step,
                attempt = attempt_no,
                retryable = failure.retryable,
                reason = %failure.reason,
                elapsed_ms,
                "Step call failed"
            ),
        }

        result
    }

    async fn deposit(&self, op: &ToolOperation, key: &str) -> StepResult {
        let params = &op.parameters;
        let request = TransferRequest {
            operation_id: op.id,
            asset: params
                .source_asset
                .clone()
                .ok_or_else(|| StepFailure::unrecoverable("source_asset missing"))?,
            amount: params
                .amount
                .ok_or_else(|| StepFailure::unrecoverable("amount missing"))?,
            chain: DEPOSIT_CHAIN.to_string(),
            destination_wallet: None,
        };
        let receipt = self.capability.submit_deposit(&request, key).await?;
        Ok(StepOutcome::Submitted { receipt })
    }

    /// Fetch, check against the limit, and only then accept.
    async fn quote(&self, op: &ToolOperation, key: &str) -> StepResult {
        let request = QuoteRequest::from_parameters(&op.parameters)
            .ok_or_else(|| StepFailure::unrecoverable("swap pair incomplete"))?;
        let quote = self.capability.get_quote(&request).await?;

        if let Some((comparator, threshold)) = op.trigger.as_ref().and_then(|t| t.price_limit()) {
            if !comparator.holds(quote.rate, threshold) {
                info!(
                    operation_id = %op.id,
                    rate = quote.rate,
                    limit = %format!("{} {}", comparator, threshold),
                    "Quote no longer satisfies limit"
                );
                return Ok(StepOutcome::QuoteBelowLimit { quote });
            }
        }

        let receipt = self.capability.accept_quote(&quote, key).await?;
        Ok(StepOutcome::QuoteAccepted { quote, receipt })
    }

    async fn bridge(&self, op: &ToolOperation) -> StepResult {
        let intent = op
            .attempt(SubState::Quote)
            .and_then(|a| a.receipt.as_ref())
            .ok_or_else(|| StepFailure::unrecoverable("no accepted quote to monitor"))?;
        let status = self.capability.get_bridge_status(intent).await?;
        debug!(operation_id = %op.id, status = ?status, "Bridge status");
        Ok(StepOutcome::Bridge { status })
    }

    async fn withdraw(&self, op: &ToolOperation, key: &str) -> StepResult {
        let params = &op.parameters;
        let amount = op
            .attempt(SubState::Quote)
            .and_then(|a| a.quote.as_ref())
            .map(|q| q.amount_out)
            .or(params.amount)
            .ok_or_else(|| StepFailure::unrecoverable("withdrawal amount unknown"))?;
        let request = TransferRequest {
            operation_id: op.id,
            asset: params
                .destination_asset
                .clone()
                .ok_or_else(|| StepFailure::unrecoverable("destination_asset missing"))?,
            amount,
            chain: params.destination_chain().to_string(),
            destination_wallet: params.destination_wallet.clone(),
        };
        let receipt = self.capability.submit_withdrawal(&request, key).await?;
        Ok(StepOutcome::Submitted { receipt })
    }

    async fn publish(&self, op: &ToolOperation, key: &str) -> StepResult {
        let content = op
            .parameters
            .content
            .as_deref()
            .ok_or_else(|| StepFailure::unrecoverable("post content missing"))?;
        let receipt = self.capability.publish_post(content, key).await?;
        Ok(StepOutcome::Submitted { receipt })
    }
}
