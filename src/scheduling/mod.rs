//! Scheduling and monitoring manager
//!
//! One multiplexed tick scans everything due: approval deadlines, time and
//! price triggers, orphaned dispatches, pending retries and completed
//! recurring templates still owed an instance. Nothing waits in-process;
//! the next evaluation time is always persisted on the record.

use crate::approval::ApprovalManager;
use crate::config::{policy_secs, EngineConfig};
use crate::error::OrchestrationError;
use crate::machine::{Advance, Event, TransitionEngine};
use crate::models::{OperationState, ToolOperation, TriggerCondition};
use crate::tools::{ExecutionCapability, QuoteRequest};
use crate::Result;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What one tick did.
#[derive(Debug, Default)]
pub struct TickReport {
    pub evaluated: usize,
    pub advances: Vec<Advance>,
    /// EXECUTING operations whose retry is due and should be driven again.
    pub resume: Vec<Uuid>,
    /// Recurring instances created by this tick.
    pub spawned: Vec<Uuid>,
}

/// Result of spawning the next instance of a recurring template.
#[derive(Debug)]
pub struct Spawned {
    pub child_id: Uuid,
    pub advance: Advance,
}

pub struct ScheduleManager {
    engine: Arc<TransitionEngine>,
    approvals: Arc<ApprovalManager>,
    capability: Arc<dyn ExecutionCapability>,
    config: EngineConfig,
    evaluating: Arc<Mutex<HashSet<Uuid>>>,
}

/// Keeps overlapping ticks off the same operation.
struct Evaluating {
    id: Uuid,
    set: Arc<Mutex<HashSet<Uuid>>>,
}

impl Drop for Evaluating {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.id);
        }
    }
}

impl ScheduleManager {
    pub fn new(
        engine: Arc<TransitionEngine>,
        approvals: Arc<ApprovalManager>,
        capability: Arc<dyn ExecutionCapability>,
        config: EngineConfig,
    ) -> Self {
        Self {
            engine,
            approvals,
            capability,
            config,
            evaluating: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn claim(&self, id: Uuid) -> Option<Evaluating> {
        let mut set = self.evaluating.lock().ok()?;
        if !set.insert(id) {
            return None;
        }
        Some(Evaluating {
            id,
            set: self.evaluating.clone(),
        })
    }

    pub async fn register_trigger(
        &self,
        operation_id: Uuid,
        condition: TriggerCondition,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Advance> {
        let advance = self
            .engine
            .advance(
                operation_id,
                Event::TriggerRegistered {
                    condition,
                    expires_at,
                },
            )
            .await?;
        info!(
            operation_id = %operation_id,
            next_eval_at = ?advance.operation.trigger.as_ref().map(|t| t.next_eval_at),
            "Trigger registered"
        );
        Ok(advance)
    }

    /// Evaluate every operation due at `now`.
    pub async fn evaluate(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let due = self
            .engine
            .store()
            .due_for_evaluation(now, self.config.scheduler_batch_size)
            .await?;

        let mut report = TickReport::default();

        for op in due {
            let Some(_guard) = self.claim(op.id) else {
                debug!(operation_id = %op.id, "Already being evaluated");
                continue;
            };
            report.evaluated += 1;

            match self.evaluate_one(&op, now, &mut report).await {
                Ok(()) => {}
                // Another writer moved the operation on; the next tick sees the new state.
                Err(OrchestrationError::InvalidTransition { from, event }) => {
                    debug!(operation_id = %op.id, %from, %event, "Evaluation raced a transition");
                }
                Err(e) => {
                    warn!(operation_id = %op.id, error = %e, "Scheduler evaluation failed");
                }
            }
        }

        // Templates whose spawn was lost between the completion commit and
        // the spawn write.
        let templates = self
            .engine
            .store()
            .pending_recurrences(self.config.scheduler_batch_size)
            .await?;
        for template in templates {
            let Some(_guard) = self.claim(template.id) else {
                continue;
            };
            report.evaluated += 1;
            match self.spawn_recurrence(&template, now).await {
                Ok(Some(spawned)) => {
                    report.spawned.push(spawned.child_id);
                    report.advances.push(spawned.advance);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(template_id = %template.id, error = %e, "Recurrence spawn failed");
                }
            }
        }

        if report.evaluated > 0 {
            debug!(
                evaluated = report.evaluated,
                advanced = report.advances.len(),
                resume = report.resume.len(),
                spawned = report.spawned.len(),
                "Scheduler tick"
            );
        }
        Ok(report)
    }

    async fn evaluate_one(
        &self,
        op: &ToolOperation,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<()> {
        match op.state {
            OperationState::AwaitingApproval => {
                if op.approval.deadline.map_or(false, |d| d <= now) {
                    report.advances.push(self.approvals.expire(op.id, now).await?);
                }
            }
            OperationState::Scheduled => {
                if let Some(advance) = self.evaluate_trigger(op, now).await? {
                    report.advances.push(advance);
                }
            }
            OperationState::Executing(step) => match op.attempt(step) {
                Some(attempt) if attempt.in_flight => {
                    if attempt.lease_expires_at.map_or(false, |at| at <= now) {
                        warn!(
                            operation_id = %op.id,
                            step = %step,
                            attempt = attempt.attempts,
                            "Dispatch lease expired, recovering"
                        );
                        report.advances.push(
                            self.engine
                                .advance_at(op.id, Event::StepLeaseExpired { step }, now)
                                .await?,
                        );
                    }
                }
                _ => report.resume.push(op.id),
            },
            _ => {}
        }
        Ok(())
    }

    async fn evaluate_trigger(
        &self,
        op: &ToolOperation,
        now: DateTime<Utc>,
    ) -> Result<Option<Advance>> {
        let Some(trigger) = op.trigger.as_ref() else {
            return Ok(None);
        };

        if trigger.is_expired(now, self.config.max_trigger_checks) {
            info!(
                operation_id = %op.id,
                checks = trigger.checks,
                best_price_seen = ?trigger.best_price_seen,
                "Trigger expired"
            );
            return self
                .engine
                .advance_at(op.id, Event::TriggerExpired, now)
                .await
                .map(Some);
        }

        if trigger.fired || trigger.next_eval_at > now {
            return Ok(None);
        }

        let event = match &trigger.condition {
            TriggerCondition::At { execute_at } => {
                if *execute_at > now {
                    return Ok(None);
                }
                Event::TriggerFired {
                    observed_price: None,
                }
            }
            TriggerCondition::Price {
                comparator,
                threshold,
                poll_interval_secs,
            } => {
                let next_eval_at = now + policy_secs(*poll_interval_secs);
                let Some(request) = QuoteRequest::from_parameters(&op.parameters) else {
                    warn!(operation_id = %op.id, "Price trigger without a complete pair");
                    return Ok(None);
                };

                match self.capability.get_quote(&request).await {
                    Ok(quote) if comparator.holds(quote.rate, *threshold) => {
                        info!(
                            operation_id = %op.id,
                            rate = quote.rate,
                            threshold = *threshold,
                            "Price condition met"
                        );
                        Event::TriggerFired {
                            observed_price: Some(quote.rate),
                        }
                    }
                    Ok(quote) => {
                        debug!(
                            operation_id = %op.id,
                            rate = quote.rate,
                            threshold = *threshold,
                            "Price condition not met"
                        );
                        Event::TriggerChecked {
                            observed_price: Some(quote.rate),
                            next_eval_at,
                        }
                    }
                    Err(e) => {
                        warn!(operation_id = %op.id, error = %e, "Price check failed");
                        Event::TriggerChecked {
                            observed_price: None,
                            next_eval_at,
                        }
                    }
                }
            }
        };

        self.engine.advance_at(op.id, event, now).await.map(Some)
    }

    /// Spawn the next instance of a completed recurring template.
    ///
    /// The instance is written once, already carrying its parameters, its
    /// fresh trigger and the inherited approval. Returns `None` when the
    /// template has no repetitions left or an instance already exists.
    pub async fn spawn_recurrence(
        &self,
        template: &ToolOperation,
        now: DateTime<Utc>,
    ) -> Result<Option<Spawned>> {
        if !template.awaits_recurrence() {
            return Ok(None);
        }
        let remaining = template.parameters.remaining_repetitions.unwrap_or(0);

        if let Some(existing) = self.engine.store().find_spawned_from(template.id).await? {
            debug!(template_id = %template.id, child_id = %existing.id, "Recurrence already spawned");
            return Ok(None);
        }

        let fired_at = template
            .trigger
            .as_ref()
            .and_then(|t| t.fired_at)
            .unwrap_or(template.updated_at);
        let interval = Duration::minutes(i64::from(
            template.parameters.interval_minutes.unwrap_or(0),
        ));
        let execute_at = fired_at.checked_add_signed(interval).ok_or_else(|| {
            OrchestrationError::Validation(format!(
                "next instance of {} falls outside the representable time range",
                template.id
            ))
        })?;

        let mut parameters = template.parameters.clone();
        parameters.remaining_repetitions = Some(remaining - 1);
        parameters.execute_at = Some(execute_at);

        let events = [
            Event::ParametersSupplied { parameters },
            ApprovalManager::inherited_approval(template)?,
        ];
        let child = ToolOperation::spawn_from(template, now);
        let advance = match self.engine.create_prepared(child, &events, now).await {
            Ok(advance) => advance,
            Err(OrchestrationError::DuplicateOperation(existing)) => {
                debug!(template_id = %template.id, child_id = %existing, "Lost recurrence spawn race");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        info!(
            template_id = %template.id,
            child_id = %advance.operation.id,
            remaining = remaining - 1,
            execute_at = %execute_at,
            "Recurring instance spawned"
        );

        Ok(Some(Spawned {
            child_id: advance.operation.id,
            advance,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::StateMachine;
    use crate::models::{ApprovalDecision, OperationKind, OperationParameters, SubState};
    use crate::state::InMemoryOperationStore;
    use crate::tools::SimulatedSolver;

    struct Fixture {
        engine: Arc<TransitionEngine>,
        approvals: Arc<ApprovalManager>,
        solver: Arc<SimulatedSolver>,
        scheduler: ScheduleManager,
    }

    fn fixture(config: EngineConfig) -> Fixture {
        let engine = Arc::new(TransitionEngine::new(
            Arc::new(InMemoryOperationStore::new()),
            StateMachine::new(config.clone()),
        ));
        let approvals = Arc::new(ApprovalManager::new(engine.clone()));
        let solver = Arc::new(SimulatedSolver::new(1.0));
        let scheduler =
            ScheduleManager::new(engine.clone(), approvals.clone(), solver.clone(), config);
        Fixture {
            engine,
            approvals,
            solver,
            scheduler,
        }
    }

    async fn approved(fx: &Fixture, kind: OperationKind, parameters: OperationParameters) -> Uuid {
        let op = ToolOperation::new(kind, "s1", "alice", Utc::now());
        fx.engine.create(&op).await.unwrap();
        fx.engine
            .advance(op.id, Event::ParametersSupplied { parameters })
            .await
            .unwrap();
        fx.approvals
            .resolve(op.id, ApprovalDecision::Approved, "bob")
            .await
            .unwrap();
        op.id
    }

    fn limit_params(target: f64) -> OperationParameters {
        OperationParameters {
            source_asset: Some("NEAR".into()),
            destination_asset: Some("ETH".into()),
            amount: Some(5.0),
            target_price: Some(target),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_price_below_threshold_stays_scheduled() {
        let fx = fixture(EngineConfig::immediate());
        let id = approved(&fx, OperationKind::LimitSwap, limit_params(1.20)).await;
        fx.solver.set_price(1.10);

        let report = fx.scheduler.evaluate(Utc::now()).await.unwrap();
        assert_eq!(report.advances.len(), 1);

        let op = fx.engine.load(id).await.unwrap();
        assert_eq!(op.state, OperationState::Scheduled);
        let trigger = op.trigger.unwrap();
        assert_eq!(trigger.checks, 1);
        assert_eq!(trigger.best_price_seen, Some(1.10));
        assert!(trigger.next_eval_at > Utc::now());
    }

    #[tokio::test]
    async fn test_price_above_threshold_fires_once() {
        let fx = fixture(EngineConfig::immediate());
        let id = approved(&fx, OperationKind::LimitSwap, limit_params(1.20)).await;
        fx.solver.set_price(1.25);

        let report = fx.scheduler.evaluate(Utc::now()).await.unwrap();
        let op = &report.advances[0].operation;
        assert_eq!(op.state, OperationState::Executing(SubState::Deposit));
        assert_eq!(op.trigger.as_ref().unwrap().observed_price, Some(1.25));

        // A second tick finds nothing to fire.
        let again = fx.scheduler.evaluate(Utc::now()).await.unwrap();
        assert!(again.advances.is_empty());
        assert_eq!(again.resume, vec![id]);
    }

    #[tokio::test]
    async fn test_time_trigger_waits_for_its_instant() {
        let fx = fixture(EngineConfig::immediate());
        let execute_at = Utc::now() + Duration::minutes(10);
        let mut params = limit_params(1.0);
        params.target_price = None;
        params.execute_at = Some(execute_at);
        let id = approved(&fx, OperationKind::Swap, params).await;

        assert!(fx.scheduler.evaluate(Utc::now()).await.unwrap().advances.is_empty());

        let report = fx
            .scheduler
            .evaluate(execute_at + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(report.advances.len(), 1);
        assert_eq!(
            fx.engine.load(id).await.unwrap().state,
            OperationState::Executing(SubState::Deposit)
        );
    }

    #[tokio::test]
    async fn test_trigger_expiry_cancels() {
        let fx = fixture(EngineConfig::immediate());
        let mut params = limit_params(1.20);
        params.expiration_hours = Some(1);
        let id = approved(&fx, OperationKind::LimitSwap, params).await;

        fx.scheduler
            .evaluate(Utc::now() + Duration::hours(2))
            .await
            .unwrap();

        let op = fx.engine.load(id).await.unwrap();
        assert_eq!(op.state, OperationState::Cancelled);
        assert_eq!(
            op.terminal.unwrap().kind,
            crate::models::FailureKind::TriggerExpired
        );
        assert_eq!(fx.solver.price_checks(), 0);
    }

    #[tokio::test]
    async fn test_expired_lease_is_recovered_with_same_key() {
        let mut config = EngineConfig::immediate();
        config.step_lease_secs = 0;
        let fx = fixture(config);
        let mut params = limit_params(1.0);
        params.target_price = None;
        let id = approved(&fx, OperationKind::Swap, params).await;

        let dispatched = fx
            .engine
            .advance(id, Event::StepDispatched { step: SubState::Deposit })
            .await
            .unwrap();
        let key = dispatched
            .operation
            .attempt(SubState::Deposit)
            .unwrap()
            .idempotency_key
            .clone();

        let report = fx
            .scheduler
            .evaluate(Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        let op = &report.advances[0].operation;
        let attempt = op.attempt(SubState::Deposit).unwrap();
        assert!(!attempt.in_flight);
        assert_eq!(attempt.idempotency_key, key);
    }

    /// Record a full run of the swap template and persist it as COMPLETED.
    async fn complete(fx: &Fixture, id: Uuid, fired_at: DateTime<Utc>) -> ToolOperation {
        let mut template = fx.engine.load(id).await.unwrap();
        let expected = template.version;
        if let Some(trigger) = template.trigger.as_mut() {
            trigger.fired = true;
            trigger.fired_at = Some(fired_at);
        }
        let mut state = OperationState::Executing(template.kind.first_step());
        template.record(state, crate::models::Cause::TriggerFired { observed_price: None }, fired_at);
        while let OperationState::Executing(step) = state {
            if step == SubState::Done {
                break;
            }
            state = OperationState::Executing(template.kind.next_step(step));
            template.record(state, crate::models::Cause::StepSucceeded { step, attempt: 1 }, fired_at);
        }
        template.record(OperationState::Completed, crate::models::Cause::Completed, fired_at);
        let template = fx.engine.store().save(&template, expected).await.unwrap();
        crate::audit::verify_replay(&template).unwrap();
        template
    }

    fn recurring_params(remaining: u32) -> OperationParameters {
        let mut params = limit_params(1.0);
        params.target_price = None;
        params.interval_minutes = Some(30);
        params.remaining_repetitions = Some(remaining);
        params
    }

    #[tokio::test]
    async fn test_recurrence_spawns_one_scheduled_child() {
        let fx = fixture(EngineConfig::immediate());
        let id = approved(&fx, OperationKind::RecurringSwap, recurring_params(2)).await;
        let fired_at = Utc::now();
        let template = complete(&fx, id, fired_at).await;

        let spawned = fx
            .scheduler
            .spawn_recurrence(&template, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(spawned.advance.operation.version, 0);
        assert_eq!(spawned.advance.new_entries.len(), 3);

        let child = fx.engine.load(spawned.child_id).await.unwrap();
        assert_eq!(child.state, OperationState::Scheduled);
        assert_eq!(child.spawned_from, Some(template.id));
        assert_eq!(child.parameters.remaining_repetitions, Some(1));
        assert_eq!(child.parameters.execute_at, Some(fired_at + Duration::minutes(30)));
        assert_eq!(child.approval.inherited_from, Some(template.id));
        assert_eq!(child.approval.approver.as_deref(), Some("bob"));

        assert!(fx
            .scheduler
            .spawn_recurrence(&template, Utc::now())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_tick_spawns_recurrence_lost_after_completion() {
        let fx = fixture(EngineConfig::immediate());
        let id = approved(&fx, OperationKind::RecurringSwap, recurring_params(1)).await;
        complete(&fx, id, Utc::now()).await;

        let report = fx.scheduler.evaluate(Utc::now()).await.unwrap();
        assert_eq!(report.spawned.len(), 1);
        let child = fx.engine.load(report.spawned[0]).await.unwrap();
        assert_eq!(child.state, OperationState::Scheduled);
        assert_eq!(child.parameters.remaining_repetitions, Some(0));

        let again = fx.scheduler.evaluate(Utc::now()).await.unwrap();
        assert!(again.spawned.is_empty());
        assert_eq!(fx.engine.store().list_for_session("s1").await.unwrap().len(), 2);
    }
}
