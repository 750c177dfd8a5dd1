//! Orchestrator - the only component that crosses the core boundary
//!
//! REQUEST → COLLECT → APPROVE → [SCHEDULE →] DISPATCH → EXECUTE → RECORD → COMPLETE
//!
//! Inbound requests, approval decisions, scheduler ticks and step results
//! all become machine events here. Every committed transition is published
//! as a `StatusEvent` and mirrored into the session's agent mode.

use crate::approval::ApprovalManager;
use crate::audit::{audit_report, AuditReport};
use crate::classifier::CommandDetector;
use crate::config::EngineConfig;
use crate::error::OrchestrationError;
use crate::execution::StepExecutor;
use crate::machine::{Advance, Effect, Event, StateMachine, TransitionEngine};
use crate::models::{
    ApprovalInput, Cause, HistoryEntry, OperationKind, OperationSnapshot, OperationState,
    StatusEvent, StructuredRequest, SubState, ToolOperation, TriggerCondition,
};
use crate::scheduling::{ScheduleManager, TickReport};
use crate::session::{AgentMode, AgentStateManager};
use crate::state::OperationStore;
use crate::tools::ExecutionCapability;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const STATUS_CHANNEL_CAPACITY: usize = 256;

/// How an inbound chat message was routed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutedMessage {
    pub session_id: String,
    pub mode: AgentMode,
    pub confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_kind: Option<OperationKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_operation: Option<Uuid>,
}

/// Human-readable line for one history entry.
fn describe(op: &ToolOperation, entry: &HistoryEntry) -> String {
    match &entry.cause {
        Cause::Created { spawned_from: Some(parent) } => {
            format!("{} instance created from {}", op.kind, parent)
        }
        Cause::Created { spawned_from: None } => format!("{} request received", op.kind),
        Cause::ParametersUpdated { missing } => {
            format!("Waiting for: {}", missing.join(", "))
        }
        Cause::ParametersComplete => format!(
            "Approval needed: {}",
            op.approval.summary.as_deref().unwrap_or(op.kind.as_str())
        ),
        Cause::TriggerRegistered => "Trigger registered".to_string(),
        Cause::Approved { approver } => match op.approval.inherited_from {
            Some(template) => format!("Approval inherited from {} ({})", template, approver),
            None => format!("Approved by {}", approver),
        },
        Cause::Rejected { approver } => format!("Rejected by {}", approver),
        Cause::ApprovalExpired => "Approval request expired".to_string(),
        Cause::TriggerFired {
            observed_price: Some(price),
        } => format!("Price condition met at {}", price),
        Cause::TriggerFired { observed_price: None } => "Scheduled time reached".to_string(),
        Cause::TriggerExpired => "Trigger expired before its condition was met".to_string(),
        Cause::StepSucceeded { step, attempt } => {
            format!("{} completed (attempt {})", step, attempt)
        }
        Cause::StepFailed {
            step,
            attempt,
            retryable: true,
            reason,
        } => format!("{} attempt {} failed, retrying: {}", step, attempt, reason),
        Cause::StepFailed { step, reason, .. } => format!("{} failed: {}", step, reason),
        Cause::StepLeaseExpired { step, attempt } => {
            format!("{} attempt {} lost its dispatch, resuming", step, attempt)
        }
        Cause::QuoteRejected { rate, .. } => {
            format!("Quote rate {} misses the limit, re-quoting", rate)
        }
        Cause::RetriesExhausted { step, attempts } => {
            format!("{} failed after {} attempts", step, attempts)
        }
        Cause::BridgeTerminal { status } => format!("Bridge reported {:?}", status),
        Cause::MonitoringHorizonExceeded { polls } => format!(
            "Bridge still pending after {} polls; manual reconciliation required",
            polls
        ),
        Cause::OrderExpired => "Order expired before an acceptable quote".to_string(),
        Cause::CancelRequested { requested_by } => format!("Cancelled by {}", requested_by),
        Cause::Completed => format!("{} completed", op.kind),
    }
}

/// Main orchestrator that coordinates the operation lifecycle
#[derive(Clone)]
pub struct Orchestrator {
    engine: Arc<TransitionEngine>,
    approvals: Arc<ApprovalManager>,
    scheduler: Arc<ScheduleManager>,
    executor: Arc<StepExecutor>,
    sessions: Arc<AgentStateManager>,
    config: EngineConfig,
    events: broadcast::Sender<StatusEvent>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn OperationStore>,
        capability: Arc<dyn ExecutionCapability>,
        config: EngineConfig,
    ) -> Self {
        let engine = Arc::new(TransitionEngine::new(
            store,
            StateMachine::new(config.clone()),
        ));
        let approvals = Arc::new(ApprovalManager::new(engine.clone()));
        let scheduler = Arc::new(ScheduleManager::new(
            engine.clone(),
            approvals.clone(),
            capability.clone(),
            config.clone(),
        ));
        let (events, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);

        Self {
            engine,
            approvals,
            scheduler,
            executor: Arc::new(StepExecutor::new(capability)),
            sessions: Arc::new(AgentStateManager::new(config.command_confidence_threshold)),
            config,
            events,
        }
    }

    /// Outward status events for presentation and logging collaborators.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    // ===== Inbound: command interpreter =====

    /// Create an operation, or append to the session's COLLECTING operation
    /// of the same kind.
    pub async fn submit(&self, request: StructuredRequest) -> Result<Uuid> {
        if request.session_id.trim().is_empty() || request.requester.trim().is_empty() {
            return Err(OrchestrationError::Validation(
                "session_id and requester are required".to_string(),
            ));
        }

        let collecting = self
            .engine
            .store()
            .find_active_for_session(&request.session_id)
            .await?
            .filter(|op| {
                op.state == OperationState::Collecting && op.kind == request.operation_kind
            });

        let id = match collecting {
            Some(op) => {
                debug!(
                    operation_id = %op.id,
                    session_id = %request.session_id,
                    "Appending to collecting operation"
                );
                op.id
            }
            None => {
                let op = ToolOperation::new(
                    request.operation_kind,
                    request.session_id.clone(),
                    request.requester.clone(),
                    Utc::now(),
                );
                self.engine.create(&op).await?;
                info!(
                    operation_id = %op.id,
                    kind = %op.kind,
                    session_id = %op.session_id,
                    requester = %op.requester,
                    "Operation created"
                );
                self.publish(&op, &op.history).await;
                op.id
            }
        };

        let advance = self
            .engine
            .advance(
                id,
                Event::ParametersSupplied {
                    parameters: request.parameters,
                },
            )
            .await?;
        self.settle(&advance).await;
        Ok(id)
    }

    pub async fn status(&self, operation_id: Uuid) -> Result<OperationSnapshot> {
        Ok(self.engine.load(operation_id).await?.snapshot())
    }

    pub async fn audit(&self, operation_id: Uuid) -> Result<AuditReport> {
        audit_report(&self.engine.load(operation_id).await?)
    }

    pub async fn list_for_session(&self, session_id: &str) -> Result<Vec<OperationSnapshot>> {
        let operations = self.engine.store().list_for_session(session_id).await?;
        Ok(operations.iter().map(ToolOperation::snapshot).collect())
    }

    /// Cancel immediately. A call already in flight is left to finish and
    /// its result is discarded.
    pub async fn cancel(&self, operation_id: Uuid, requested_by: &str) -> Result<OperationSnapshot> {
        let advance = self
            .engine
            .advance(
                operation_id,
                Event::CancelRequested {
                    requested_by: requested_by.to_string(),
                },
            )
            .await?;

        if let Some(report) = advance.operation.terminal.as_ref() {
            if advance.changed && report.reconciliation_required {
                warn!(
                    operation_id = %operation_id,
                    last_completed_step = ?report.last_completed_step,
                    "Cancelled with a call in flight; reconcile the external side"
                );
            }
        }
        self.settle(&advance).await;
        Ok(advance.operation.snapshot())
    }

    pub async fn register_trigger(
        &self,
        operation_id: Uuid,
        condition: TriggerCondition,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<OperationSnapshot> {
        let advance = self
            .scheduler
            .register_trigger(operation_id, condition, expires_at)
            .await?;
        self.settle(&advance).await;
        Ok(advance.operation.snapshot())
    }

    /// Route a chat message: tool mode when the session is held by an
    /// operation or the message looks like a command.
    pub async fn route_message(
        &self,
        session_id: &str,
        message: &str,
        confidence: Option<f32>,
    ) -> Result<RoutedMessage> {
        let holding = self
            .engine
            .store()
            .find_active_for_session(session_id)
            .await?
            .map(|op| op.id);
        let confidence = confidence.unwrap_or_else(|| CommandDetector::confidence(message));
        let mode = self
            .sessions
            .observe_message(session_id, confidence, holding)
            .await;

        Ok(RoutedMessage {
            session_id: session_id.to_string(),
            mode,
            confidence,
            suggested_kind: match mode {
                AgentMode::ToolOperation => CommandDetector::suggest_kind(message),
                AgentMode::NormalChat => None,
            },
            active_operation: holding,
        })
    }

    pub async fn session_mode(&self, session_id: &str) -> AgentMode {
        self.sessions.mode(session_id).await
    }

    // ===== Inbound: approval surface =====

    pub async fn resolve_approval(&self, input: ApprovalInput) -> Result<OperationSnapshot> {
        let advance = self
            .approvals
            .resolve(input.operation_id, input.decision, &input.approver)
            .await?;
        if self.settle(&advance).await {
            self.kick(input.operation_id).await;
        }
        Ok(self.status(input.operation_id).await?)
    }

    // ===== Scheduler =====

    /// One scheduler pass: evaluate everything due at `now`, then drive
    /// whatever became runnable.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let report = self.scheduler.evaluate(now).await?;

        let mut runnable = Vec::new();
        for advance in &report.advances {
            if self.settle(advance).await {
                runnable.push(advance.operation.id);
            }
        }
        runnable.extend(report.resume.iter().copied());
        runnable.sort();
        runnable.dedup();

        for id in runnable {
            self.kick(id).await;
        }
        Ok(report)
    }

    /// Tick every `scheduler_tick_secs` until `shutdown` fires.
    pub async fn run_scheduler(&self, shutdown: CancellationToken) {
        let period = std::time::Duration::from_secs(self.config.scheduler_tick_secs.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(tick_secs = period.as_secs(), "Scheduler started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Scheduler stopping");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        warn!(error = %e, "Scheduler tick failed");
                    }
                }
            }
        }
    }

    // ===== Execution =====

    /// Run the current sub-state and every following one until the
    /// operation leaves EXECUTING, waits on a retry longer than the inline
    /// window, or another caller already holds the dispatch.
    pub async fn drive(&self, operation_id: Uuid) -> Result<ToolOperation> {
        loop {
            let op = self.engine.load(operation_id).await?;
            let step = match op.state {
                OperationState::Executing(step) if step != SubState::Done => step,
                _ => return Ok(op),
            };

            if let Some(attempt) = op.attempt(step) {
                if attempt.in_flight {
                    debug!(operation_id = %operation_id, step = %step, "Step already dispatched");
                    return Ok(op);
                }
                if let Some(at) = attempt.next_retry_at {
                    let wait = (at - Utc::now()).to_std().unwrap_or_default();
                    if wait.as_millis() as u64 > self.config.inline_retry_max_ms {
                        debug!(
                            operation_id = %operation_id,
                            step = %step,
                            retry_at = %at,
                            "Retry left to the scheduler"
                        );
                        return Ok(op);
                    }
                    if !wait.is_zero() {
                        tokio::time::sleep(wait).await;
                        continue;
                    }
                }
            }

            let dispatched = match self
                .engine
                .advance(operation_id, Event::StepDispatched { step })
                .await
            {
                Ok(advance) => advance,
                Err(OrchestrationError::StepInFlight(key)) => {
                    debug!(operation_id = %operation_id, step = %step, key = %key, "Lost dispatch race");
                    return self.engine.load(operation_id).await;
                }
                // Cancelled or advanced between load and dispatch.
                Err(OrchestrationError::InvalidTransition { .. }) => continue,
                Err(e) => return Err(e),
            };

            let attempt = dispatched.operation.attempt(step).map_or(0, |a| a.attempts);
            debug!(
                operation_id = %operation_id,
                step = %step,
                attempt,
                "Step dispatched"
            );

            let event = match self.executor.execute(&dispatched.operation, step).await {
                Ok(outcome) => Event::StepSucceeded { step, outcome },
                Err(failure) => Event::StepFailed { step, failure },
            };

            let recorded = self.engine.advance(operation_id, event).await?;
            if !recorded.changed {
                info!(
                    operation_id = %operation_id,
                    step = %step,
                    state = %recorded.operation.state,
                    "Late step result discarded"
                );
            }
            self.settle(&recorded).await;
        }
    }

    /// Drive inline or on a spawned task, per configuration.
    async fn kick(&self, operation_id: Uuid) {
        if self.config.background_execution {
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.drive(operation_id).await {
                    warn!(operation_id = %operation_id, error = %e, "Background drive failed");
                }
            });
        } else if let Err(e) = self.drive(operation_id).await {
            warn!(operation_id = %operation_id, error = %e, "Drive failed");
        }
    }

    // ===== Outbound =====

    /// Publish a committed advance and perform its side effects.
    /// Returns true when the operation has a step ready to run.
    async fn settle(&self, advance: &Advance) -> bool {
        let op = &advance.operation;
        self.publish(op, &advance.new_entries).await;

        let mut runnable = false;
        for effect in &advance.effects {
            match effect {
                Effect::RequestApproval { summary, .. } => {
                    if let Err(e) = self.approvals.request_approval(op.id, summary).await {
                        debug!(operation_id = %op.id, error = %e, "Approval request superseded");
                    }
                }
                Effect::ArmTrigger { next_eval_at } => {
                    debug!(operation_id = %op.id, next_eval_at = %next_eval_at, "Trigger armed");
                }
                Effect::ExecuteStep { .. } => runnable = true,
                Effect::ScheduleRetry { step, at } => {
                    debug!(operation_id = %op.id, step = %step, retry_at = %at, "Retry scheduled");
                    runnable = true;
                }
                Effect::SpawnRecurrence => {
                    match self.scheduler.spawn_recurrence(op, Utc::now()).await {
                        Ok(Some(spawned)) => {
                            let child = &spawned.advance;
                            self.publish(&child.operation, &child.new_entries).await;
                        }
                        Ok(None) => {}
                        // The scheduler tick retries from the stored template.
                        Err(e) => {
                            error!(template_id = %op.id, error = %e, "Failed to spawn recurring instance")
                        }
                    }
                }
            }
        }
        runnable
    }

    async fn publish(&self, op: &ToolOperation, entries: &[HistoryEntry]) {
        if entries.is_empty() {
            return;
        }
        // Whatever still holds the session once this operation lets go of it.
        let holding = match self
            .engine
            .store()
            .find_active_for_session(&op.session_id)
            .await
        {
            Ok(found) => found.map(|o| o.id).filter(|id| *id != op.id),
            Err(e) => {
                warn!(session_id = %op.session_id, error = %e, "Active operation lookup failed");
                None
            }
        };

        for entry in entries {
            let event = StatusEvent {
                operation_id: op.id,
                session_id: op.session_id.clone(),
                top_state: entry.to.top_state(),
                sub_state: entry.to.sub_state(),
                message: describe(op, entry),
                at: entry.at,
            };

            if entry.to == OperationState::Failed {
                error!(
                    operation_id = %op.id,
                    top_state = %event.top_state,
                    terminal = ?op.terminal,
                    "{}",
                    event.message
                );
            } else {
                info!(
                    operation_id = %op.id,
                    top_state = %event.top_state,
                    sub_state = ?event.sub_state,
                    "{}",
                    event.message
                );
            }

            // Spawned instances run in the background and never take the session.
            if op.spawned_from.is_none() || !event.top_state.holds_conversation() {
                self.sessions
                    .observe_status(&op.session_id, op.id, event.top_state, holding)
                    .await;
            }
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }
}
