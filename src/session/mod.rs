//! Agent state manager: one NORMAL_CHAT / TOOL_OPERATION flag per session.

use crate::models::TopState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentMode {
    #[default]
    NormalChat,
    ToolOperation,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionState {
    pub mode: AgentMode,
    pub active_operation: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
}

pub struct AgentStateManager {
    sessions: Arc<RwLock<HashMap<String, SessionState>>>,
    threshold: f32,
}

impl AgentStateManager {
    pub fn new(threshold: f32) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            threshold,
        }
    }

    pub async fn mode(&self, session_id: &str) -> AgentMode {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).map(|s| s.mode).unwrap_or_default()
    }

    pub async fn state(&self, session_id: &str) -> Option<SessionState> {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).cloned()
    }

    /// Decide whether an incoming message goes to the command interpreter.
    ///
    /// `holding` is the operation that already holds the session in tool
    /// mode (COLLECTING or AWAITING_APPROVAL), if any.
    pub async fn observe_message(
        &self,
        session_id: &str,
        confidence: f32,
        holding: Option<Uuid>,
    ) -> AgentMode {
        let mode = if holding.is_some() || confidence > self.threshold {
            AgentMode::ToolOperation
        } else {
            AgentMode::NormalChat
        };

        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionState {
                mode: AgentMode::NormalChat,
                active_operation: None,
                updated_at: Utc::now(),
            });
        if entry.mode != mode {
            debug!(session_id, confidence, from = ?entry.mode, to = ?mode, "Agent mode changed");
        }
        entry.mode = mode;
        if holding.is_some() {
            entry.active_operation = holding;
        }
        entry.updated_at = Utc::now();
        mode
    }

    /// Follow an operation's top state. Leaving COLLECTING/AWAITING_APPROVAL
    /// hands the session to `holding`, the other operation still in one of
    /// those states, or back to normal chat when there is none.
    pub async fn observe_status(
        &self,
        session_id: &str,
        operation_id: Uuid,
        top_state: TopState,
        holding: Option<Uuid>,
    ) -> AgentMode {
        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionState {
                mode: AgentMode::NormalChat,
                active_operation: None,
                updated_at: Utc::now(),
            });

        if top_state.holds_conversation() {
            entry.mode = AgentMode::ToolOperation;
            entry.active_operation = Some(operation_id);
        } else if entry.active_operation.map_or(true, |id| id == operation_id) {
            entry.active_operation = holding;
            entry.mode = match holding {
                Some(_) => AgentMode::ToolOperation,
                None => AgentMode::NormalChat,
            };
        }
        entry.updated_at = Utc::now();
        entry.mode
    }
}
