//! Operation state machine
//!
//! `apply` is a pure function of `(operation, event, now)`. It returns the
//! next record together with the side effects the caller must perform;
//! nothing here touches the network or the store, so a transition can be
//! retried freely after a version conflict.
//!
//! COLLECTING → AWAITING_APPROVAL → [SCHEDULED →] EXECUTING → COMPLETED
//!                                                  ↳ DEPOSIT → QUOTE → BRIDGE_MONITOR → WITHDRAW → DONE

pub mod engine;

pub use engine::{Advance, TransitionEngine};

use crate::audit::idempotency_key;
use crate::config::EngineConfig;
use crate::error::OrchestrationError;
use crate::models::{
    ApprovalDecision, ApprovalStatus, BridgeStatus, Cause, FailureKind, HistoryEntry,
    OperationKind, OperationParameters, OperationState, StepFailure, StepOutcome, SubState,
    TerminalReport, ToolOperation, Trigger, TriggerCondition,
};
use crate::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Inputs that drive an operation forward.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    ParametersSupplied {
        parameters: OperationParameters,
    },
    TriggerRegistered {
        condition: TriggerCondition,
        #[serde(default)]
        expires_at: Option<DateTime<Utc>>,
    },
    ApprovalResolved {
        decision: ApprovalDecision,
        approver: String,
        #[serde(default)]
        inherited_from: Option<Uuid>,
    },
    ApprovalExpired,
    TriggerChecked {
        observed_price: Option<f64>,
        next_eval_at: DateTime<Utc>,
    },
    TriggerFired {
        observed_price: Option<f64>,
    },
    TriggerExpired,
    StepDispatched {
        step: SubState,
    },
    StepSucceeded {
        step: SubState,
        outcome: StepOutcome,
    },
    StepFailed {
        step: SubState,
        failure: StepFailure,
    },
    StepLeaseExpired {
        step: SubState,
    },
    CancelRequested {
        requested_by: String,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::ParametersSupplied { .. } => "parameters_supplied",
            Event::TriggerRegistered { .. } => "trigger_registered",
            Event::ApprovalResolved { .. } => "approval_resolved",
            Event::ApprovalExpired => "approval_expired",
            Event::TriggerChecked { .. } => "trigger_checked",
            Event::TriggerFired { .. } => "trigger_fired",
            Event::TriggerExpired => "trigger_expired",
            Event::StepDispatched { .. } => "step_dispatched",
            Event::StepSucceeded { .. } => "step_succeeded",
            Event::StepFailed { .. } => "step_failed",
            Event::StepLeaseExpired { .. } => "step_lease_expired",
            Event::CancelRequested { .. } => "cancel_requested",
        }
    }
}

/// Side effects requested by a transition, performed by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    RequestApproval {
        summary: String,
        deadline: Option<DateTime<Utc>>,
    },
    ArmTrigger {
        next_eval_at: DateTime<Utc>,
    },
    ExecuteStep {
        step: SubState,
    },
    ScheduleRetry {
        step: SubState,
        at: DateTime<Utc>,
    },
    SpawnRecurrence,
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub operation: ToolOperation,
    pub effects: Vec<Effect>,
    /// False for re-entrant events that leave the record untouched.
    pub changed: bool,
}

impl Transition {
    fn noop(op: &ToolOperation) -> Self {
        Self {
            operation: op.clone(),
            effects: Vec::new(),
            changed: false,
        }
    }

    fn changed(operation: ToolOperation, effects: Vec<Effect>) -> Self {
        Self {
            operation,
            effects,
            changed: true,
        }
    }
}

pub struct StateMachine {
    config: EngineConfig,
}

impl StateMachine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn apply(
        &self,
        current: &ToolOperation,
        event: &Event,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        // Terminal operations absorb every event.
        if current.state.is_terminal() {
            return Ok(Transition::noop(current));
        }

        let mut op = current.clone();

        match event {
            Event::ParametersSupplied { parameters } => {
                self.supply_parameters(op, parameters, now)
            }

            Event::TriggerRegistered {
                condition,
                expires_at,
            } => {
                if !matches!(
                    op.state,
                    OperationState::Collecting
                        | OperationState::AwaitingApproval
                        | OperationState::Scheduled
                ) {
                    return Err(invalid(&op, event));
                }
                let condition = self.normalize_condition(condition)?;
                let trigger = Trigger::new(condition, *expires_at, now);
                let next_eval_at = trigger.next_eval_at;
                op.trigger = Some(trigger);
                let state = op.state;
                op.record(state, Cause::TriggerRegistered, now);
                let effects = if state == OperationState::Scheduled {
                    vec![Effect::ArmTrigger { next_eval_at }]
                } else {
                    Vec::new()
                };
                Ok(Transition::changed(op, effects))
            }

            Event::ApprovalResolved {
                decision,
                approver,
                inherited_from,
            } => {
                if op.state != OperationState::AwaitingApproval {
                    return Err(invalid(&op, event));
                }
                op.approval.approver = Some(approver.clone());
                op.approval.resolved_at = Some(now);
                op.approval.inherited_from = *inherited_from;

                match decision {
                    ApprovalDecision::Approved => {
                        op.approval.status = ApprovalStatus::Approved;
                        let cause = Cause::Approved {
                            approver: approver.clone(),
                        };
                        match op.trigger.as_ref().map(|t| t.next_eval_at) {
                            Some(next_eval_at) => {
                                op.record(OperationState::Scheduled, cause, now);
                                Ok(Transition::changed(
                                    op,
                                    vec![Effect::ArmTrigger { next_eval_at }],
                                ))
                            }
                            None => Ok(enter_execution(op, cause, now)),
                        }
                    }
                    ApprovalDecision::Rejected => {
                        op.approval.status = ApprovalStatus::Rejected;
                        op.terminal = Some(TerminalReport {
                            kind: FailureKind::ApprovalRejected,
                            reason: format!("rejected by {}", approver),
                            last_completed_step: None,
                            reconciliation_required: false,
                        });
                        op.record(
                            OperationState::Cancelled,
                            Cause::Rejected {
                                approver: approver.clone(),
                            },
                            now,
                        );
                        Ok(Transition::changed(op, Vec::new()))
                    }
                }
            }

            Event::ApprovalExpired => {
                let overdue = op.approval.deadline.map_or(false, |d| d <= now);
                if op.state != OperationState::AwaitingApproval
                    || op.approval.status != ApprovalStatus::Pending
                    || !overdue
                {
                    return Err(invalid(&op, event));
                }
                op.approval.status = ApprovalStatus::Expired;
                op.approval.resolved_at = Some(now);
                op.terminal = Some(TerminalReport {
                    kind: FailureKind::ApprovalExpired,
                    reason: "approval not resolved before deadline".to_string(),
                    last_completed_step: None,
                    reconciliation_required: false,
                });
                op.record(OperationState::Cancelled, Cause::ApprovalExpired, now);
                Ok(Transition::changed(op, Vec::new()))
            }

            Event::TriggerChecked {
                observed_price,
                next_eval_at,
            } => {
                if op.state != OperationState::Scheduled || op.trigger.is_none() {
                    return Err(invalid(&op, event));
                }
                let Some(trigger) = op.trigger.as_mut() else {
                    return Ok(Transition::noop(current));
                };
                if trigger.fired {
                    return Ok(Transition::noop(current));
                }
                trigger.checks += 1;
                trigger.last_checked_at = Some(now);
                trigger.next_eval_at = *next_eval_at;
                if let (Some(price), Some((comparator, _))) =
                    (observed_price, trigger.price_limit())
                {
                    let better = trigger
                        .best_price_seen
                        .map_or(true, |best| comparator.improves(*price, best));
                    if better {
                        trigger.best_price_seen = Some(*price);
                    }
                }
                op.updated_at = now;
                Ok(Transition::changed(op, Vec::new()))
            }

            Event::TriggerFired { observed_price } => {
                if !op.approval.is_approved() {
                    return Err(OrchestrationError::ApprovalRequired(op.id));
                }
                if op.state != OperationState::Scheduled {
                    return Err(invalid(&op, event));
                }
                if let Some(trigger) = op.trigger.as_mut() {
                    if trigger.fired {
                        return Ok(Transition::noop(current));
                    }
                    trigger.fired = true;
                    trigger.fired_at = Some(now);
                    trigger.observed_price = *observed_price;
                    if observed_price.is_some() {
                        trigger.checks += 1;
                        trigger.last_checked_at = Some(now);
                    }
                }
                let cause = Cause::TriggerFired {
                    observed_price: *observed_price,
                };
                Ok(enter_execution(op, cause, now))
            }

            Event::TriggerExpired => {
                let expired = op
                    .trigger
                    .as_ref()
                    .map_or(false, |t| t.is_expired(now, self.config.max_trigger_checks));
                if op.state != OperationState::Scheduled || !expired {
                    return Err(invalid(&op, event));
                }
                op.terminal = Some(TerminalReport {
                    kind: FailureKind::TriggerExpired,
                    reason: "trigger condition not met before expiry".to_string(),
                    last_completed_step: None,
                    reconciliation_required: false,
                });
                op.record(OperationState::Cancelled, Cause::TriggerExpired, now);
                Ok(Transition::changed(op, Vec::new()))
            }

            Event::StepDispatched { step } => {
                if op.state != OperationState::Executing(*step) || *step == SubState::Done {
                    return Err(invalid(&op, event));
                }
                let id = op.id;
                let lease = self.config.step_lease();
                let attempt = op.attempt_mut(*step);
                if attempt.in_flight {
                    return Err(OrchestrationError::StepInFlight(
                        attempt.idempotency_key.clone().unwrap_or_default(),
                    ));
                }
                attempt.attempts += 1;
                attempt.in_flight = true;
                attempt.lease_expires_at = Some(now + lease);
                attempt.next_retry_at = None;
                attempt.started_at.get_or_insert(now);
                attempt.idempotency_key = Some(idempotency_key(id, *step, attempt.generation));
                op.updated_at = now;
                Ok(Transition::changed(op, Vec::new()))
            }

            Event::StepSucceeded { step, outcome } => {
                if op.state != OperationState::Executing(*step) {
                    // Late result for a step that was already settled.
                    return Ok(Transition::noop(current));
                }
                let attempt = op.attempt_mut(*step);
                attempt.in_flight = false;
                attempt.lease_expires_at = None;
                attempt.last_error = None;
                let attempt_no = attempt.attempts;

                match (step, outcome) {
                    (SubState::Quote, StepOutcome::QuoteBelowLimit { quote }) => {
                        let attempt = op.attempt_mut(SubState::Quote);
                        attempt.requotes += 1;
                        attempt.generation += 1;
                        attempt.quote = Some(quote.clone());
                        let generation = attempt.generation;
                        let requotes = attempt.requotes;

                        let order_expired = op
                            .trigger
                            .as_ref()
                            .and_then(|t| t.expires_at)
                            .map_or(false, |at| at <= now);
                        if order_expired {
                            return Ok(fail(
                                op,
                                Cause::OrderExpired,
                                FailureKind::TriggerExpired,
                                format!(
                                    "order expired while quote rate {} missed the limit",
                                    quote.rate
                                ),
                                false,
                                now,
                            ));
                        }

                        if requotes > self.config.max_requotes {
                            return Ok(fail(
                                op,
                                Cause::RetriesExhausted {
                                    step: SubState::Quote,
                                    attempts: requotes,
                                },
                                FailureKind::RetryableStepFailure,
                                format!(
                                    "quote rate {} still missed the limit after {} re-quotes",
                                    quote.rate, requotes
                                ),
                                false,
                                now,
                            ));
                        }

                        let at = now + self.config.requote_interval();
                        op.attempt_mut(SubState::Quote).next_retry_at = Some(at);
                        op.record(
                            OperationState::Executing(SubState::Quote),
                            Cause::QuoteRejected {
                                rate: quote.rate,
                                generation,
                            },
                            now,
                        );
                        Ok(Transition::changed(
                            op,
                            vec![Effect::ScheduleRetry {
                                step: SubState::Quote,
                                at,
                            }],
                        ))
                    }
                    (SubState::Quote, StepOutcome::QuoteAccepted { quote, receipt }) => {
                        let attempt = op.attempt_mut(SubState::Quote);
                        attempt.quote = Some(quote.clone());
                        attempt.receipt = Some(receipt.clone());
                        Ok(self.complete_step(op, *step, attempt_no, now))
                    }
                    (SubState::BridgeMonitor, StepOutcome::Bridge { status }) => {
                        self.bridge_status(op, *status, attempt_no, now)
                    }
                    (
                        SubState::Deposit | SubState::Withdraw | SubState::Publish,
                        StepOutcome::Submitted { receipt },
                    ) => {
                        op.attempt_mut(*step).receipt = Some(receipt.clone());
                        Ok(self.complete_step(op, *step, attempt_no, now))
                    }
                    _ => Err(invalid(&op, event)),
                }
            }

            Event::StepFailed { step, failure } => {
                if op.state != OperationState::Executing(*step) {
                    return Ok(Transition::noop(current));
                }
                let attempt = op.attempt_mut(*step);
                attempt.in_flight = false;
                attempt.lease_expires_at = None;
                attempt.last_error = Some(failure.reason.clone());
                let attempts = attempt.attempts;

                let failed = Cause::StepFailed {
                    step: *step,
                    attempt: attempts,
                    retryable: failure.retryable,
                    reason: failure.reason.clone(),
                };

                if !failure.retryable {
                    return Ok(fail(
                        op,
                        failed,
                        FailureKind::UnrecoverableStepFailure,
                        failure.reason.clone(),
                        false,
                        now,
                    ));
                }

                op.record(OperationState::Executing(*step), failed, now);

                if attempts >= self.config.retry.max_attempts {
                    return Ok(fail(
                        op,
                        Cause::RetriesExhausted {
                            step: *step,
                            attempts,
                        },
                        FailureKind::RetryableStepFailure,
                        format!(
                            "{} failed after {} attempts: {}",
                            step, attempts, failure.reason
                        ),
                        false,
                        now,
                    ));
                }

                let at = now + self.config.retry.backoff(attempts);
                op.attempt_mut(*step).next_retry_at = Some(at);
                Ok(Transition::changed(
                    op,
                    vec![Effect::ScheduleRetry { step: *step, at }],
                ))
            }

            Event::StepLeaseExpired { step } => {
                let stale = op.state == OperationState::Executing(*step)
                    && op.attempt(*step).map_or(false, |a| {
                        a.in_flight && a.lease_expires_at.map_or(true, |at| at <= now)
                    });
                if !stale {
                    return Err(invalid(&op, event));
                }
                let attempt = op.attempt_mut(*step);
                attempt.in_flight = false;
                attempt.lease_expires_at = None;
                attempt.next_retry_at = Some(now);
                let attempt_no = attempt.attempts;
                op.record(
                    OperationState::Executing(*step),
                    Cause::StepLeaseExpired {
                        step: *step,
                        attempt: attempt_no,
                    },
                    now,
                );
                Ok(Transition::changed(
                    op,
                    vec![Effect::ExecuteStep { step: *step }],
                ))
            }

            Event::CancelRequested { requested_by } => {
                op.cancel_requested = Some(requested_by.clone());
                let (last_completed_step, in_flight) = match op.state {
                    OperationState::Executing(step) => (
                        op.kind.previous_step(step),
                        op.attempt(step).map_or(false, |a| a.in_flight),
                    ),
                    _ => (None, false),
                };
                op.terminal = Some(TerminalReport {
                    kind: FailureKind::Cancelled,
                    reason: format!("cancelled by {}", requested_by),
                    last_completed_step,
                    // An in-flight call may still land on the external side.
                    reconciliation_required: in_flight,
                });
                op.record(
                    OperationState::Cancelled,
                    Cause::CancelRequested {
                        requested_by: requested_by.clone(),
                    },
                    now,
                );
                Ok(Transition::changed(op, Vec::new()))
            }
        }
    }

    fn supply_parameters(
        &self,
        mut op: ToolOperation,
        parameters: &OperationParameters,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        if op.state != OperationState::Collecting {
            return Err(OrchestrationError::invalid_transition(
                op.state,
                "parameters_supplied",
            ));
        }

        let mut merged = op.parameters.clone();
        merged.merge(parameters);
        merged.validate().map_err(OrchestrationError::Validation)?;
        op.parameters = merged;

        let missing = op.parameters.missing_for(op.kind);
        if !missing.is_empty() {
            op.record(
                OperationState::Collecting,
                Cause::ParametersUpdated {
                    missing: missing.into_iter().map(str::to_string).collect(),
                },
                now,
            );
            return Ok(Transition::changed(op, Vec::new()));
        }

        if op.trigger.is_none() {
            op.trigger = self.derive_trigger(op.kind, &op.parameters, now);
        }

        let summary = op.parameters.summary(op.kind);
        let deadline = now + self.config.approval_ttl();
        op.approval.summary = Some(summary.clone());
        op.approval.requested_at = Some(now);
        op.approval.deadline = Some(deadline);
        op.record(
            OperationState::AwaitingApproval,
            Cause::ParametersComplete,
            now,
        );

        Ok(Transition::changed(
            op,
            vec![Effect::RequestApproval {
                summary,
                deadline: Some(deadline),
            }],
        ))
    }

    /// Trigger implied by a complete parameter set, if any.
    ///
    /// A price trigger does not poll before `execute_at`, and its order
    /// expiry counts from the first poll.
    pub fn derive_trigger(
        &self,
        kind: OperationKind,
        params: &OperationParameters,
        now: DateTime<Utc>,
    ) -> Option<Trigger> {
        let polls_from = params.execute_at.map_or(now, |at| at.max(now));
        let price_trigger = |threshold: f64| {
            let hours = params
                .expiration_hours
                .unwrap_or(self.config.order_expiration_hours);
            let expires_at = polls_from.checked_add_signed(Duration::hours(i64::from(hours)));
            let condition = TriggerCondition::Price {
                comparator: params.comparator.unwrap_or_default(),
                threshold,
                poll_interval_secs: self.config.poll_interval_secs(params.poll_interval_secs),
            };
            Trigger::new(condition, expires_at, polls_from)
        };

        match kind {
            OperationKind::LimitSwap => params.target_price.map(price_trigger),
            OperationKind::RecurringSwap => Some(match params.target_price {
                Some(price) => price_trigger(price),
                None => Trigger::new(
                    TriggerCondition::At {
                        execute_at: params.execute_at.unwrap_or(now),
                    },
                    None,
                    now,
                ),
            }),
            OperationKind::Swap | OperationKind::SocialPost => params
                .execute_at
                .map(|execute_at| Trigger::new(TriggerCondition::At { execute_at }, None, now)),
        }
    }

    fn normalize_condition(&self, condition: &TriggerCondition) -> Result<TriggerCondition> {
        match condition {
            TriggerCondition::Price {
                comparator,
                threshold,
                poll_interval_secs,
            } => {
                if !threshold.is_finite() || *threshold <= 0.0 {
                    return Err(OrchestrationError::Validation(format!(
                        "trigger threshold must be positive, got {}",
                        threshold
                    )));
                }
                Ok(TriggerCondition::Price {
                    comparator: *comparator,
                    threshold: *threshold,
                    poll_interval_secs: self.config.poll_interval_secs(Some(*poll_interval_secs)),
                })
            }
            at @ TriggerCondition::At { .. } => Ok(at.clone()),
        }
    }

    fn bridge_status(
        &self,
        mut op: ToolOperation,
        status: BridgeStatus,
        attempt_no: u32,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        match status {
            BridgeStatus::Filled => Ok(self.complete_step(op, SubState::BridgeMonitor, attempt_no, now)),
            BridgeStatus::Failed | BridgeStatus::Expired => Ok(fail(
                op,
                Cause::BridgeTerminal { status },
                FailureKind::UnrecoverableStepFailure,
                format!("bridge reported {:?}", status),
                false,
                now,
            )),
            BridgeStatus::Pending => {
                let horizon = self.config.bridge_horizon();
                let attempt = op.attempt_mut(SubState::BridgeMonitor);
                attempt.polls += 1;
                let polls = attempt.polls;
                let started = attempt.started_at.unwrap_or(now);

                if now - started >= horizon {
                    return Ok(fail(
                        op,
                        Cause::MonitoringHorizonExceeded { polls },
                        FailureKind::ReconciliationRequired,
                        format!(
                            "bridge still pending after {}s; funds may be mid-transfer",
                            self.config.bridge_horizon_secs
                        ),
                        true,
                        now,
                    ));
                }

                let at = now + self.config.bridge_poll_interval();
                attempt.next_retry_at = Some(at);
                op.updated_at = now;
                Ok(Transition::changed(
                    op,
                    vec![Effect::ScheduleRetry {
                        step: SubState::BridgeMonitor,
                        at,
                    }],
                ))
            }
        }
    }

    fn complete_step(
        &self,
        mut op: ToolOperation,
        step: SubState,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> Transition {
        let next = op.kind.next_step(step);
        op.record(
            OperationState::Executing(next),
            Cause::StepSucceeded { step, attempt },
            now,
        );

        if next != SubState::Done {
            return Transition::changed(op, vec![Effect::ExecuteStep { step: next }]);
        }

        op.record(OperationState::Completed, Cause::Completed, now);
        let mut effects = Vec::new();
        if op.awaits_recurrence() {
            effects.push(Effect::SpawnRecurrence);
        }
        Transition::changed(op, effects)
    }
}

fn enter_execution(mut op: ToolOperation, cause: Cause, now: DateTime<Utc>) -> Transition {
    let first = op.kind.first_step();
    op.record(OperationState::Executing(first), cause, now);
    Transition::changed(op, vec![Effect::ExecuteStep { step: first }])
}

fn fail(
    mut op: ToolOperation,
    cause: Cause,
    kind: FailureKind,
    reason: String,
    reconciliation_required: bool,
    now: DateTime<Utc>,
) -> Transition {
    op.terminal = Some(TerminalReport {
        kind,
        reason,
        last_completed_step: op.last_completed_step(),
        reconciliation_required,
    });
    op.record(OperationState::Failed, cause, now);
    Transition::changed(op, Vec::new())
}

fn invalid(op: &ToolOperation, event: &Event) -> OrchestrationError {
    OrchestrationError::invalid_transition(op.state, event.name())
}

/// Whether `from → to` is an edge of the hierarchical machine for `kind`.
/// Execution enters at the kind's first step and moves one step at a time.
pub fn edge_allowed(kind: OperationKind, from: OperationState, to: OperationState) -> bool {
    use OperationState::*;
    match (from, to) {
        (Collecting, Collecting | AwaitingApproval | Cancelled) => true,
        (AwaitingApproval, AwaitingApproval | Scheduled | Cancelled) => true,
        (Scheduled, Scheduled | Cancelled) => true,
        (AwaitingApproval | Scheduled, Executing(first)) => first == kind.first_step(),
        (Executing(SubState::Done), Completed) => true,
        (Executing(a), Executing(b)) => b == a || b == kind.next_step(a),
        (Executing(_), Failed | Cancelled) => true,
        _ => false,
    }
}

/// Fold the history from the initial state, checking every edge.
pub fn replay(kind: OperationKind, history: &[HistoryEntry]) -> Result<OperationState> {
    let mut state = OperationState::Collecting;
    for entry in history {
        if entry.from != state {
            return Err(OrchestrationError::AuditError(format!(
                "history entry {} starts from {} but replay is at {}",
                entry.seq, entry.from, state
            )));
        }
        if entry.from != entry.to && !edge_allowed(kind, entry.from, entry.to) {
            return Err(OrchestrationError::AuditError(format!(
                "history entry {} has illegal edge {} -> {}",
                entry.seq, entry.from, entry.to
            )));
        }
        state = entry.to;
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Quote, Receipt, TopState};
    use proptest::prelude::*;

    fn machine() -> StateMachine {
        StateMachine::new(EngineConfig::immediate())
    }

    fn swap_params() -> OperationParameters {
        OperationParameters {
            source_asset: Some("NEAR".into()),
            destination_asset: Some("ETH".into()),
            amount: Some(5.0),
            ..Default::default()
        }
    }

    fn receipt(reference: &str) -> Receipt {
        Receipt {
            reference: reference.into(),
            idempotency_key: format!("key-{}", reference),
            submitted_at: Utc::now(),
            detail: serde_json::Value::Null,
        }
    }

    fn quote(rate: f64) -> Quote {
        Quote {
            quote_hash: format!("q-{}", rate),
            rate,
            amount_in: 5.0,
            amount_out: 5.0 * rate,
            expires_at: Utc::now() + Duration::minutes(5),
        }
    }

    fn step(m: &StateMachine, op: ToolOperation, event: Event) -> ToolOperation {
        m.apply(&op, &event, Utc::now()).unwrap().operation
    }

    fn approved_swap(m: &StateMachine) -> ToolOperation {
        let op = ToolOperation::new(OperationKind::Swap, "s1", "alice", Utc::now());
        let op = step(m, op, Event::ParametersSupplied { parameters: swap_params() });
        step(
            m,
            op,
            Event::ApprovalResolved {
                decision: ApprovalDecision::Approved,
                approver: "bob".into(),
                inherited_from: None,
            },
        )
    }

    #[test]
    fn test_incomplete_parameters_stay_collecting() {
        let m = machine();
        let op = ToolOperation::new(OperationKind::Swap, "s1", "alice", Utc::now());
        let t = m
            .apply(
                &op,
                &Event::ParametersSupplied {
                    parameters: OperationParameters {
                        source_asset: Some("NEAR".into()),
                        ..Default::default()
                    },
                },
                Utc::now(),
            )
            .unwrap();
        assert_eq!(t.operation.state, OperationState::Collecting);
        assert_eq!(t.operation.history.len(), 2);
        assert!(t.effects.is_empty());
    }

    #[test]
    fn test_malformed_parameters_are_validation_errors() {
        let m = machine();
        let op = ToolOperation::new(OperationKind::Swap, "s1", "alice", Utc::now());
        let err = m
            .apply(
                &op,
                &Event::ParametersSupplied {
                    parameters: OperationParameters {
                        amount: Some(0.0),
                        ..Default::default()
                    },
                },
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::Validation(_)));
    }

    #[test]
    fn test_complete_parameters_request_approval() {
        let m = machine();
        let op = ToolOperation::new(OperationKind::Swap, "s1", "alice", Utc::now());
        let t = m
            .apply(&op, &Event::ParametersSupplied { parameters: swap_params() }, Utc::now())
            .unwrap();
        assert_eq!(t.operation.state, OperationState::AwaitingApproval);
        assert!(t.operation.approval.deadline.is_some());
        assert!(matches!(t.effects[0], Effect::RequestApproval { .. }));
    }

    #[test]
    fn test_approval_without_trigger_starts_deposit() {
        let m = machine();
        let op = approved_swap(&m);
        assert_eq!(op.state, OperationState::Executing(SubState::Deposit));
        assert_eq!(op.approval.approver.as_deref(), Some("bob"));
        assert_eq!(op.approval.requester, "alice");
    }

    #[test]
    fn test_limit_swap_approval_schedules() {
        let m = machine();
        let op = ToolOperation::new(OperationKind::LimitSwap, "s1", "alice", Utc::now());
        let mut params = swap_params();
        params.target_price = Some(1.2);
        let op = step(&m, op, Event::ParametersSupplied { parameters: params });
        assert!(op.trigger.is_some());

        let t = m
            .apply(
                &op,
                &Event::ApprovalResolved {
                    decision: ApprovalDecision::Approved,
                    approver: "bob".into(),
                    inherited_from: None,
                },
                Utc::now(),
            )
            .unwrap();
        assert_eq!(t.operation.state, OperationState::Scheduled);
        assert!(matches!(t.effects[0], Effect::ArmTrigger { .. }));
    }

    #[test]
    fn test_rejection_cancels() {
        let m = machine();
        let op = ToolOperation::new(OperationKind::Swap, "s1", "alice", Utc::now());
        let op = step(&m, op, Event::ParametersSupplied { parameters: swap_params() });
        let op = step(
            &m,
            op,
            Event::ApprovalResolved {
                decision: ApprovalDecision::Rejected,
                approver: "bob".into(),
                inherited_from: None,
            },
        );
        assert_eq!(op.state, OperationState::Cancelled);
        assert_eq!(op.approval.status, ApprovalStatus::Rejected);
        assert_eq!(op.terminal.unwrap().kind, FailureKind::ApprovalRejected);
    }

    #[test]
    fn test_trigger_fire_without_approval_is_rejected() {
        let m = machine();
        let op = ToolOperation::new(OperationKind::LimitSwap, "s1", "alice", Utc::now());
        let mut params = swap_params();
        params.target_price = Some(1.2);
        let op = step(&m, op, Event::ParametersSupplied { parameters: params });

        let err = m
            .apply(&op, &Event::TriggerFired { observed_price: Some(1.3) }, Utc::now())
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::ApprovalRequired(id) if id == op.id));
    }

    #[test]
    fn test_dispatch_is_exclusive() {
        let m = machine();
        let op = approved_swap(&m);
        let op = step(&m, op, Event::StepDispatched { step: SubState::Deposit });
        let err = m
            .apply(&op, &Event::StepDispatched { step: SubState::Deposit }, Utc::now())
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::StepInFlight(_)));
    }

    #[test]
    fn test_retryable_failures_keep_the_same_key() {
        let m = machine();
        let mut op = approved_swap(&m);
        let mut keys = Vec::new();
        for _ in 0..3 {
            op = step(&m, op, Event::StepDispatched { step: SubState::Deposit });
            keys.push(op.attempt(SubState::Deposit).unwrap().idempotency_key.clone());
            op = step(
                &m,
                op,
                Event::StepFailed {
                    step: SubState::Deposit,
                    failure: StepFailure::retryable("timeout"),
                },
            );
            assert_eq!(op.state, OperationState::Executing(SubState::Deposit));
        }
        keys.dedup();
        assert_eq!(keys.len(), 1);
        assert_eq!(op.attempt(SubState::Deposit).unwrap().attempts, 3);
    }

    #[test]
    fn test_exhausted_retries_fail_with_report() {
        let m = machine();
        let mut op = approved_swap(&m);
        for _ in 0..m.config().retry.max_attempts {
            op = step(&m, op, Event::StepDispatched { step: SubState::Deposit });
            op = step(
                &m,
                op,
                Event::StepFailed {
                    step: SubState::Deposit,
                    failure: StepFailure::retryable("rate limited"),
                },
            );
        }
        assert_eq!(op.state, OperationState::Failed);
        let report = op.terminal.unwrap();
        assert_eq!(report.kind, FailureKind::RetryableStepFailure);
        assert_eq!(report.last_completed_step, None);
    }

    #[test]
    fn test_unrecoverable_failure_reports_last_completed_step() {
        let m = machine();
        let op = approved_swap(&m);
        let op = step(&m, op, Event::StepDispatched { step: SubState::Deposit });
        let op = step(
            &m,
            op,
            Event::StepSucceeded {
                step: SubState::Deposit,
                outcome: StepOutcome::Submitted { receipt: receipt("dep") },
            },
        );
        let op = step(&m, op, Event::StepDispatched { step: SubState::Quote });
        let op = step(
            &m,
            op,
            Event::StepFailed {
                step: SubState::Quote,
                failure: StepFailure::unrecoverable("insufficient balance"),
            },
        );
        assert_eq!(op.state, OperationState::Failed);
        assert_eq!(
            op.terminal.unwrap().last_completed_step,
            Some(SubState::Deposit)
        );
    }

    #[test]
    fn test_quote_below_limit_requotes_with_new_generation() {
        let m = machine();
        let op = ToolOperation::new(OperationKind::LimitSwap, "s1", "alice", Utc::now());
        let mut params = swap_params();
        params.target_price = Some(1.2);
        let op = step(&m, op, Event::ParametersSupplied { parameters: params });
        let op = step(
            &m,
            op,
            Event::ApprovalResolved {
                decision: ApprovalDecision::Approved,
                approver: "bob".into(),
                inherited_from: None,
            },
        );
        let op = step(&m, op, Event::TriggerFired { observed_price: Some(1.25) });
        let op = step(&m, op, Event::StepDispatched { step: SubState::Deposit });
        let op = step(
            &m,
            op,
            Event::StepSucceeded {
                step: SubState::Deposit,
                outcome: StepOutcome::Submitted { receipt: receipt("dep") },
            },
        );
        let op = step(&m, op, Event::StepDispatched { step: SubState::Quote });
        let first_key = op.attempt(SubState::Quote).unwrap().idempotency_key.clone();
        let t = m
            .apply(
                &op,
                &Event::StepSucceeded {
                    step: SubState::Quote,
                    outcome: StepOutcome::QuoteBelowLimit { quote: quote(1.1) },
                },
                Utc::now(),
            )
            .unwrap();
        assert_eq!(t.operation.state, OperationState::Executing(SubState::Quote));
        assert!(matches!(t.effects[0], Effect::ScheduleRetry { step: SubState::Quote, .. }));

        let op = step(&m, t.operation, Event::StepDispatched { step: SubState::Quote });
        let second_key = op.attempt(SubState::Quote).unwrap().idempotency_key.clone();
        assert_ne!(first_key, second_key);
    }

    #[test]
    fn test_bridge_horizon_requires_reconciliation() {
        let mut config = EngineConfig::immediate();
        config.bridge_horizon_secs = 0;
        let m = StateMachine::new(config);
        let op = approved_swap(&m);
        let op = step(&m, op, Event::StepDispatched { step: SubState::Deposit });
        let op = step(
            &m,
            op,
            Event::StepSucceeded {
                step: SubState::Deposit,
                outcome: StepOutcome::Submitted { receipt: receipt("dep") },
            },
        );
        let op = step(&m, op, Event::StepDispatched { step: SubState::Quote });
        let op = step(
            &m,
            op,
            Event::StepSucceeded {
                step: SubState::Quote,
                outcome: StepOutcome::QuoteAccepted {
                    quote: quote(1.0),
                    receipt: receipt("intent"),
                },
            },
        );
        let op = step(&m, op, Event::StepDispatched { step: SubState::BridgeMonitor });
        let op = step(
            &m,
            op,
            Event::StepSucceeded {
                step: SubState::BridgeMonitor,
                outcome: StepOutcome::Bridge { status: BridgeStatus::Pending },
            },
        );
        assert_eq!(op.state, OperationState::Failed);
        let report = op.terminal.unwrap();
        assert!(report.reconciliation_required);
        assert_eq!(report.kind, FailureKind::ReconciliationRequired);
        assert_eq!(report.last_completed_step, Some(SubState::Quote));
    }

    #[test]
    fn test_terminal_events_are_noops() {
        let m = machine();
        let op = approved_swap(&m);
        let op = step(&m, op, Event::CancelRequested { requested_by: "alice".into() });
        assert_eq!(op.state, OperationState::Cancelled);

        let t = m
            .apply(
                &op,
                &Event::StepSucceeded {
                    step: SubState::Deposit,
                    outcome: StepOutcome::Submitted { receipt: receipt("late") },
                },
                Utc::now(),
            )
            .unwrap();
        assert!(!t.changed);
        assert_eq!(t.operation.history.len(), op.history.len());
    }

    #[test]
    fn test_cancel_with_in_flight_call_flags_reconciliation() {
        let m = machine();
        let op = approved_swap(&m);
        let op = step(&m, op, Event::StepDispatched { step: SubState::Deposit });
        let op = step(&m, op, Event::CancelRequested { requested_by: "alice".into() });
        assert!(op.terminal.unwrap().reconciliation_required);
    }

    #[test]
    fn test_replay_rejects_illegal_edges() {
        let now = Utc::now();
        let mut op = ToolOperation::new(OperationKind::Swap, "s1", "alice", now);
        op.record(OperationState::Executing(SubState::Quote), Cause::ParametersComplete, now);
        assert!(replay(op.kind, &op.history).is_err());
    }

    #[test]
    fn test_replay_rejects_skipped_sub_states() {
        let now = Utc::now();
        let mut op = ToolOperation::new(OperationKind::Swap, "s1", "alice", now);
        op.record(OperationState::AwaitingApproval, Cause::ParametersComplete, now);
        op.record(
            OperationState::Executing(SubState::Deposit),
            Cause::Approved { approver: "bob".into() },
            now,
        );
        op.record(
            OperationState::Executing(SubState::Withdraw),
            Cause::StepSucceeded { step: SubState::Deposit, attempt: 1 },
            now,
        );
        assert!(replay(op.kind, &op.history).is_err());

        assert!(edge_allowed(
            OperationKind::SocialPost,
            OperationState::Scheduled,
            OperationState::Executing(SubState::Publish)
        ));
        assert!(!edge_allowed(
            OperationKind::Swap,
            OperationState::Scheduled,
            OperationState::Executing(SubState::Quote)
        ));
        assert!(edge_allowed(
            OperationKind::Swap,
            OperationState::Executing(SubState::Withdraw),
            OperationState::Executing(SubState::Done)
        ));
    }

    #[test]
    fn test_oversized_expiration_is_rejected_not_overflowed() {
        let m = machine();
        let op = ToolOperation::new(OperationKind::LimitSwap, "s1", "alice", Utc::now());
        let mut params = swap_params();
        params.target_price = Some(1.2);
        params.expiration_hours = Some(u32::MAX);

        let err = m
            .apply(&op, &Event::ParametersSupplied { parameters: params }, Utc::now())
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::Validation(_)));
    }

    #[test]
    fn test_price_trigger_waits_for_execute_at() {
        let m = machine();
        let now = Utc::now();
        let execute_at = now + Duration::minutes(60);
        let mut params = swap_params();
        params.target_price = Some(1.0);
        params.interval_minutes = Some(60);
        params.remaining_repetitions = Some(2);
        params.execute_at = Some(execute_at);

        let trigger = m
            .derive_trigger(OperationKind::RecurringSwap, &params, now)
            .unwrap();
        assert_eq!(trigger.next_eval_at, execute_at);
        assert_eq!(trigger.expires_at, Some(execute_at + Duration::hours(24)));

        // A start time already in the past polls right away.
        params.execute_at = Some(now - Duration::minutes(5));
        let trigger = m.derive_trigger(OperationKind::LimitSwap, &params, now).unwrap();
        assert_eq!(trigger.next_eval_at, now);
    }

    #[test]
    fn test_requotes_are_capped_without_an_order_expiry() {
        let mut config = EngineConfig::immediate();
        config.max_requotes = 2;
        let m = StateMachine::new(config);

        let op = approved_swap(&m);
        let op = step(&m, op, Event::StepDispatched { step: SubState::Deposit });
        let mut op = step(
            &m,
            op,
            Event::StepSucceeded {
                step: SubState::Deposit,
                outcome: StepOutcome::Submitted { receipt: receipt("dep") },
            },
        );
        assert!(op.trigger.is_none());

        for _ in 0..3 {
            op = step(&m, op, Event::StepDispatched { step: SubState::Quote });
            op = step(
                &m,
                op,
                Event::StepSucceeded {
                    step: SubState::Quote,
                    outcome: StepOutcome::QuoteBelowLimit { quote: quote(1.1) },
                },
            );
        }

        assert_eq!(op.state, OperationState::Failed);
        assert!(matches!(
            op.history.last().unwrap().cause,
            Cause::RetriesExhausted { step: SubState::Quote, attempts: 3 }
        ));
        assert_eq!(op.terminal.unwrap().last_completed_step, Some(SubState::Deposit));
    }

    // ========== Property checks ==========

    fn arb_event() -> impl Strategy<Value = Event> {
        let step = prop_oneof![
            Just(SubState::Deposit),
            Just(SubState::Quote),
            Just(SubState::BridgeMonitor),
            Just(SubState::Withdraw),
        ];
        prop_oneof![
            Just(Event::ParametersSupplied { parameters: swap_params() }),
            Just(Event::ParametersSupplied {
                parameters: OperationParameters {
                    target_price: Some(1.2),
                    ..Default::default()
                },
            }),
            any::<bool>().prop_map(|approve| Event::ApprovalResolved {
                decision: if approve {
                    ApprovalDecision::Approved
                } else {
                    ApprovalDecision::Rejected
                },
                approver: "bob".into(),
                inherited_from: None,
            }),
            (0.5f64..2.0).prop_map(|p| Event::TriggerFired { observed_price: Some(p) }),
            step.clone().prop_map(|step| Event::StepDispatched { step }),
            (step.clone(), any::<bool>()).prop_map(|(step, retryable)| Event::StepFailed {
                step,
                failure: StepFailure {
                    retryable,
                    reason: "boom".into(),
                },
            }),
            step.prop_map(|step| Event::StepSucceeded {
                outcome: match step {
                    SubState::Quote => StepOutcome::QuoteAccepted {
                        quote: quote(1.3),
                        receipt: receipt("q"),
                    },
                    SubState::BridgeMonitor => StepOutcome::Bridge {
                        status: BridgeStatus::Filled,
                    },
                    _ => StepOutcome::Submitted { receipt: receipt("r") },
                },
                step,
            }),
            Just(Event::CancelRequested { requested_by: "alice".into() }),
        ]
    }

    proptest! {
        #[test]
        fn prop_invariants_hold_for_random_event_sequences(
            kind in prop_oneof![Just(OperationKind::Swap), Just(OperationKind::LimitSwap)],
            events in proptest::collection::vec(arb_event(), 0..40),
        ) {
            let m = machine();
            let mut op = ToolOperation::new(kind, "s1", "alice", Utc::now());

            for event in &events {
                let before = op.clone();
                if let Ok(t) = m.apply(&op, event, Utc::now()) {
                    op = t.operation;
                }

                // subState defined iff EXECUTING
                prop_assert_eq!(
                    op.state.sub_state().is_some(),
                    op.state.top_state() == TopState::Executing
                );
                // history is append-only
                prop_assert!(op.history.len() >= before.history.len());
                prop_assert_eq!(&op.history[..before.history.len()], &before.history[..]);
                if op.state != before.state {
                    prop_assert!(op.history.len() > before.history.len());
                }
                // sub-states only advance
                if let (Some(a), Some(b)) = (before.state.sub_state(), op.state.sub_state()) {
                    prop_assert!(b >= a);
                }
                // approval gates scheduling and execution
                if matches!(op.state, OperationState::Scheduled | OperationState::Executing(_)) {
                    prop_assert!(op.approval.is_approved());
                }
                // replay reproduces the current state
                prop_assert_eq!(replay(op.kind, &op.history).unwrap(), op.state);
            }
        }
    }
}
