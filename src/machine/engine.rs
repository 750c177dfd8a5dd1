//! Load → apply → compare-and-swap loop around the pure state machine.

use super::{Effect, Event, StateMachine};
use crate::error::OrchestrationError;
use crate::models::{HistoryEntry, ToolOperation};
use crate::state::OperationStore;
use crate::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

const MAX_CONFLICT_RETRIES: usize = 16;

/// Result of one committed (or absorbed) event.
#[derive(Debug, Clone)]
pub struct Advance {
    pub operation: ToolOperation,
    pub effects: Vec<Effect>,
    pub new_entries: Vec<HistoryEntry>,
    pub changed: bool,
}

pub struct TransitionEngine {
    store: Arc<dyn OperationStore>,
    machine: StateMachine,
}

impl TransitionEngine {
    pub fn new(store: Arc<dyn OperationStore>, machine: StateMachine) -> Self {
        Self { store, machine }
    }

    pub fn store(&self) -> &Arc<dyn OperationStore> {
        &self.store
    }

    pub async fn create(&self, op: &ToolOperation) -> Result<()> {
        self.store.insert(op).await
    }

    /// Fold `events` over a fresh operation and insert the result in one
    /// write. Only the last transition's effects are returned; earlier ones
    /// are superseded by the state the record is created in.
    pub async fn create_prepared(
        &self,
        op: ToolOperation,
        events: &[Event],
        now: DateTime<Utc>,
    ) -> Result<Advance> {
        let mut prepared = op;
        let mut effects = Vec::new();
        for event in events {
            let transition = self.machine.apply(&prepared, event, now)?;
            prepared = transition.operation;
            effects = transition.effects;
        }

        self.store.insert(&prepared).await?;
        debug!(
            operation_id = %prepared.id,
            state = %prepared.state,
            entries = prepared.history.len(),
            "Operation created in its prepared state"
        );
        Ok(Advance {
            new_entries: prepared.history.clone(),
            operation: prepared,
            effects,
            changed: true,
        })
    }

    pub async fn load(&self, id: Uuid) -> Result<ToolOperation> {
        self.store
            .load(id)
            .await?
            .ok_or(OrchestrationError::OperationNotFound(id))
    }

    /// Apply `event` to the latest stored version of `id`.
    ///
    /// A lost compare-and-swap reloads and re-applies; the event is judged
    /// against whatever state won the race.
    pub async fn advance(&self, id: Uuid, event: Event) -> Result<Advance> {
        self.advance_at(id, event, Utc::now()).await
    }

    /// `advance` judged at an explicit instant (scheduler ticks).
    pub async fn advance_at(&self, id: Uuid, event: Event, now: DateTime<Utc>) -> Result<Advance> {
        for _ in 0..MAX_CONFLICT_RETRIES {
            let current = self.load(id).await?;
            let transition = self.machine.apply(&current, &event, now)?;

            if !transition.changed {
                debug!(
                    operation_id = %id,
                    state = %current.state,
                    event = event.name(),
                    "Event absorbed without change"
                );
                return Ok(Advance {
                    operation: current,
                    effects: Vec::new(),
                    new_entries: Vec::new(),
                    changed: false,
                });
            }

            match self.store.save(&transition.operation, current.version).await {
                Ok(saved) => {
                    let new_entries = saved.history[current.history.len()..].to_vec();
                    for entry in &new_entries {
                        debug!(
                            operation_id = %id,
                            seq = entry.seq,
                            from = %entry.from,
                            to = %entry.to,
                            "Transition recorded"
                        );
                    }
                    return Ok(Advance {
                        operation: saved,
                        effects: transition.effects,
                        new_entries,
                        changed: true,
                    });
                }
                Err(OrchestrationError::VersionConflict { expected, .. }) => {
                    debug!(operation_id = %id, expected, event = event.name(), "Version conflict, retrying");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        warn!(operation_id = %id, event = event.name(), "Gave up after repeated version conflicts");
        Err(OrchestrationError::ContentionExhausted(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::models::{
        ApprovalDecision, OperationKind, OperationParameters, OperationState, SubState,
    };
    use crate::state::InMemoryOperationStore;
    use tokio_test::{assert_err, assert_ok};

    fn engine() -> Arc<TransitionEngine> {
        Arc::new(TransitionEngine::new(
            Arc::new(InMemoryOperationStore::new()),
            StateMachine::new(EngineConfig::immediate()),
        ))
    }

    async fn approved_swap(engine: &TransitionEngine) -> Uuid {
        let op = ToolOperation::new(OperationKind::Swap, "s1", "alice", Utc::now());
        engine.create(&op).await.unwrap();
        engine
            .advance(
                op.id,
                Event::ParametersSupplied {
                    parameters: OperationParameters {
                        source_asset: Some("NEAR".into()),
                        destination_asset: Some("ETH".into()),
                        amount: Some(1.0),
                        ..Default::default()
                    },
                },
            )
            .await
            .unwrap();
        engine
            .advance(
                op.id,
                Event::ApprovalResolved {
                    decision: ApprovalDecision::Approved,
                    approver: "bob".into(),
                    inherited_from: None,
                },
            )
            .await
            .unwrap();
        op.id
    }

    #[tokio::test]
    async fn test_advance_reports_new_entries_and_effects() {
        let engine = engine();
        let op = ToolOperation::new(OperationKind::SocialPost, "s1", "alice", Utc::now());
        engine.create(&op).await.unwrap();

        let advance = engine
            .advance(
                op.id,
                Event::ParametersSupplied {
                    parameters: OperationParameters {
                        content: Some("gm".into()),
                        ..Default::default()
                    },
                },
            )
            .await
            .unwrap();

        assert_eq!(advance.operation.state, OperationState::AwaitingApproval);
        assert_eq!(advance.operation.version, 1);
        assert_eq!(advance.new_entries.len(), 1);
        assert!(matches!(advance.effects[0], Effect::RequestApproval { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_dispatch_admits_exactly_one() {
        let engine = engine();
        let id = approved_swap(&engine).await;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .advance(id, Event::StepDispatched { step: SubState::Deposit })
                    .await
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => admitted += 1,
                Err(OrchestrationError::StepInFlight(_)) => {}
                Err(other) => panic!("unexpected error: {}", other),
            }
        }

        assert_eq!(admitted, 1);
        let op = engine.load(id).await.unwrap();
        assert_eq!(op.attempt(SubState::Deposit).unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn test_concurrent_cancel_and_success_serialize() {
        let engine = engine();
        let id = approved_swap(&engine).await;

        let cancel = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .advance(id, Event::CancelRequested { requested_by: "alice".into() })
                    .await
            })
        };
        let cancel_again = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .advance(id, Event::CancelRequested { requested_by: "bob".into() })
                    .await
            })
        };
        assert_ok!(cancel.await.unwrap());
        assert_ok!(cancel_again.await.unwrap());

        let op = engine.load(id).await.unwrap();
        assert_eq!(op.state, OperationState::Cancelled);
        // Exactly one terminal transition was recorded.
        let terminal_entries = op
            .history
            .iter()
            .filter(|e| e.to == OperationState::Cancelled)
            .count();
        assert_eq!(terminal_entries, 1);
        assert_ok!(crate::audit::verify_replay(&op));
    }

    #[tokio::test]
    async fn test_create_prepared_inserts_final_state_once() {
        let engine = engine();
        let op = ToolOperation::new(OperationKind::Swap, "s1", "alice", Utc::now());
        let id = op.id;

        let events = [
            Event::ParametersSupplied {
                parameters: OperationParameters {
                    source_asset: Some("NEAR".into()),
                    destination_asset: Some("ETH".into()),
                    amount: Some(1.0),
                    ..Default::default()
                },
            },
            Event::ApprovalResolved {
                decision: ApprovalDecision::Approved,
                approver: "bob".into(),
                inherited_from: None,
            },
        ];
        let advance = assert_ok!(engine.create_prepared(op, &events, Utc::now()).await);

        assert_eq!(advance.operation.state, OperationState::Executing(SubState::Deposit));
        assert_eq!(advance.effects, vec![Effect::ExecuteStep { step: SubState::Deposit }]);
        assert_eq!(advance.new_entries.len(), 3);

        let stored = engine.load(id).await.unwrap();
        assert_eq!(stored.version, 0);
        assert_eq!(stored.state, advance.operation.state);
    }

    #[tokio::test]
    async fn test_create_prepared_writes_nothing_when_an_event_is_refused() {
        let engine = engine();
        let op = ToolOperation::new(OperationKind::Swap, "s1", "alice", Utc::now());
        let id = op.id;

        let events = [Event::ApprovalResolved {
            decision: ApprovalDecision::Approved,
            approver: "bob".into(),
            inherited_from: None,
        }];
        assert_err!(engine.create_prepared(op, &events, Utc::now()).await);
        assert!(engine.store().load(id).await.unwrap().is_none());
    }
}
