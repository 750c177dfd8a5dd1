//! Approval manager
//!
//! Approval lives on the persisted operation, never in a session or a
//! waiting task. A decision can arrive any time after the request, from
//! an identity other than the requester.

use crate::error::OrchestrationError;
use crate::machine::{Advance, Event, TransitionEngine};
use crate::models::{ApprovalDecision, ApprovalStatus, OperationState, ToolOperation};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// What an approval surface needs to present a pending decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalTicket {
    pub operation_id: Uuid,
    pub requester: String,
    pub summary: String,
    pub status: ApprovalStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
}

pub struct ApprovalManager {
    engine: Arc<TransitionEngine>,
}

impl ApprovalManager {
    pub fn new(engine: Arc<TransitionEngine>) -> Self {
        Self { engine }
    }

    /// Pending ticket for an operation awaiting approval.
    pub async fn request_approval(&self, operation_id: Uuid, summary: &str) -> Result<ApprovalTicket> {
        let op = self.engine.load(operation_id).await?;
        if op.state != OperationState::AwaitingApproval {
            return Err(OrchestrationError::invalid_transition(op.state, "request_approval"));
        }

        info!(
            operation_id = %operation_id,
            requester = %op.approval.requester,
            deadline = ?op.approval.deadline,
            "Approval requested"
        );

        Ok(ApprovalTicket {
            operation_id,
            requester: op.approval.requester.clone(),
            summary: summary.to_string(),
            status: op.approval.status,
            deadline: op.approval.deadline,
        })
    }

    pub async fn resolve(
        &self,
        operation_id: Uuid,
        decision: ApprovalDecision,
        approver: &str,
    ) -> Result<Advance> {
        if approver.trim().is_empty() {
            return Err(OrchestrationError::Validation(
                "approver identity is required".to_string(),
            ));
        }

        let advance = self
            .engine
            .advance(
                operation_id,
                Event::ApprovalResolved {
                    decision,
                    approver: approver.to_string(),
                    inherited_from: None,
                },
            )
            .await?;

        info!(
            operation_id = %operation_id,
            approver = %approver,
            decision = ?decision,
            top_state = %advance.operation.state.top_state(),
            "Approval resolved"
        );
        Ok(advance)
    }

    /// Approval carried over from a template to a spawned instance.
    pub fn inherited_approval(template: &ToolOperation) -> Result<Event> {
        if !template.approval.is_approved() {
            return Err(OrchestrationError::ApprovalRequired(template.id));
        }
        let approver = template
            .approval
            .approver
            .clone()
            .unwrap_or_else(|| template.requester.clone());

        Ok(Event::ApprovalResolved {
            decision: ApprovalDecision::Approved,
            approver,
            inherited_from: Some(template.id),
        })
    }

    /// PENDING → EXPIRED → CANCELLED once the deadline has passed.
    pub async fn expire(&self, operation_id: Uuid, now: DateTime<Utc>) -> Result<Advance> {
        let advance = self
            .engine
            .advance_at(operation_id, Event::ApprovalExpired, now)
            .await?;
        info!(operation_id = %operation_id, "Approval expired");
        Ok(advance)
    }
}
