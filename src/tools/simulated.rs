//! In-process solver used by the demo binary, the API server when no
//! solver is configured, and the test suite.
//!
//! Side-effecting calls are idempotent per key, like a real relay: a
//! repeated key returns the original receipt without a second submission.

use super::{CapabilityError, CapabilityResult, ExecutionCapability, QuoteRequest, TransferRequest};
use crate::models::{BridgeStatus, Quote, Receipt, SubState};
use chrono::{Duration, Utc};
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub step: SubState,
    pub idempotency_key: String,
}

#[derive(Default)]
struct SolverState {
    price: f64,
    failures: HashMap<SubState, VecDeque<CapabilityError>>,
    bridge_script: VecDeque<BridgeStatus>,
    receipts: HashMap<String, Receipt>,
    submissions: HashMap<SubState, u32>,
    calls: Vec<CallRecord>,
    in_flight: HashSet<String>,
    overlapping_calls: u32,
    price_checks: u32,
}

pub struct SimulatedSolver {
    state: Mutex<SolverState>,
    latency: std::time::Duration,
}

impl SimulatedSolver {
    pub fn new(price: f64) -> Self {
        Self {
            state: Mutex::new(SolverState {
                price,
                ..Default::default()
            }),
            latency: std::time::Duration::ZERO,
        }
    }

    /// Hold each side-effecting call open for `latency`.
    pub fn with_latency(mut self, latency: std::time::Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn set_price(&self, price: f64) {
        self.with_state(|s| s.price = price);
    }

    /// Fail the next calls for `step` with `error`, `times` times.
    pub fn fail_next(&self, step: SubState, error: CapabilityError, times: u32) {
        self.with_state(|s| {
            let queue = s.failures.entry(step).or_default();
            for _ in 0..times {
                queue.push_back(error.clone());
            }
        });
    }

    /// Statuses returned by successive bridge polls; `FILLED` once exhausted.
    pub fn script_bridge(&self, statuses: impl IntoIterator<Item = BridgeStatus>) {
        self.with_state(|s| s.bridge_script.extend(statuses));
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.with_state(|s| s.calls.clone())
    }

    /// Distinct external submissions performed for `step`.
    pub fn submissions(&self, step: SubState) -> u32 {
        self.with_state(|s| s.submissions.get(&step).copied().unwrap_or(0))
    }

    /// Calls that arrived while another call with the same key was open.
    pub fn overlapping_calls(&self) -> u32 {
        self.with_state(|s| s.overlapping_calls)
    }

    pub fn price_checks(&self) -> u32 {
        self.with_state(|s| s.price_checks)
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut SolverState) -> T) -> T {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Shared path for every keyed call: log, detect overlap, consume a
    /// scripted failure, then replay or create the receipt.
    async fn keyed_call(
        &self,
        step: SubState,
        key: &str,
        detail: serde_json::Value,
    ) -> CapabilityResult<Receipt> {
        let scripted = self.with_state(|s| {
            s.calls.push(CallRecord {
                step,
                idempotency_key: key.to_string(),
            });
            if !s.in_flight.insert(key.to_string()) {
                s.overlapping_calls += 1;
            }
            s.failures.get_mut(&step).and_then(|q| q.pop_front())
        });

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        self.with_state(|s| {
            s.in_flight.remove(key);
            if let Some(error) = scripted {
                debug!(step = %step, key, error = %error, "Simulated failure");
                return Err(error);
            }
            if let Some(existing) = s.receipts.get(key) {
                return Ok(existing.clone());
            }
            *s.submissions.entry(step).or_insert(0) += 1;
            let receipt = Receipt {
                reference: format!("sim-{}-{}", step.as_str().to_lowercase(), s.receipts.len() + 1),
                idempotency_key: key.to_string(),
                submitted_at: Utc::now(),
                detail,
            };
            s.receipts.insert(key.to_string(), receipt.clone());
            Ok(receipt)
        })
    }
}

#[async_trait::async_trait]
impl ExecutionCapability for SimulatedSolver {
    fn name(&self) -> &'static str {
        "simulated_solver"
    }

    async fn get_quote(&self, request: &QuoteRequest) -> CapabilityResult<Quote> {
        let (rate, scripted, checks) = self.with_state(|s| {
            s.price_checks += 1;
            let scripted = s.failures.get_mut(&SubState::Quote).and_then(|q| q.pop_front());
            (s.price, scripted, s.price_checks)
        });
        if let Some(error) = scripted {
            return Err(error);
        }
        Ok(Quote {
            quote_hash: format!("simq-{}", checks),
            rate,
            amount_in: request.amount,
            amount_out: request.amount * rate * (1.0 - request.slippage_pct / 100.0),
            expires_at: Utc::now() + Duration::minutes(2),
        })
    }

    async fn accept_quote(
        &self,
        quote: &Quote,
        idempotency_key: &str,
    ) -> CapabilityResult<Receipt> {
        self.keyed_call(
            SubState::Quote,
            idempotency_key,
            json!({ "quote_hash": quote.quote_hash, "rate": quote.rate }),
        )
        .await
    }

    async fn submit_deposit(
        &self,
        request: &TransferRequest,
        idempotency_key: &str,
    ) -> CapabilityResult<Receipt> {
        self.keyed_call(SubState::Deposit, idempotency_key, json!(request))
            .await
    }

    async fn get_bridge_status(&self, _intent: &Receipt) -> CapabilityResult<BridgeStatus> {
        self.with_state(|s| {
            if let Some(error) = s
                .failures
                .get_mut(&SubState::BridgeMonitor)
                .and_then(|q| q.pop_front())
            {
                return Err(error);
            }
            Ok(s.bridge_script.pop_front().unwrap_or(BridgeStatus::Filled))
        })
    }

    async fn submit_withdrawal(
        &self,
        request: &TransferRequest,
        idempotency_key: &str,
    ) -> CapabilityResult<Receipt> {
        self.keyed_call(SubState::Withdraw, idempotency_key, json!(request))
            .await
    }

    async fn publish_post(
        &self,
        content: &str,
        idempotency_key: &str,
    ) -> CapabilityResult<Receipt> {
        self.keyed_call(SubState::Publish, idempotency_key, json!({ "content": content }))
            .await
    }
}
