//! State persistence layer
//!
//! Operations are persisted after every transition with a compare-and-swap
//! on `version`. History is append-only: a save whose history does not
//! extend the stored history is refused.

pub mod postgres;

pub use postgres::PostgresOperationStore;

use crate::error::OrchestrationError;
use crate::models::ToolOperation;
use crate::Result;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Trait for operation persistence
#[async_trait::async_trait]
pub trait OperationStore: Send + Sync {
    async fn insert(&self, op: &ToolOperation) -> Result<()>;

    async fn load(&self, id: Uuid) -> Result<Option<ToolOperation>>;

    /// Persist `op` if the stored version still equals `expected_version`.
    /// Returns the stored record with its new version.
    async fn save(&self, op: &ToolOperation, expected_version: u64) -> Result<ToolOperation>;

    /// Most recent operation holding the session in tool mode.
    async fn find_active_for_session(&self, session_id: &str) -> Result<Option<ToolOperation>>;

    async fn list_for_session(&self, session_id: &str) -> Result<Vec<ToolOperation>>;

    /// Non-terminal operations whose next evaluation time has passed, oldest first.
    async fn due_for_evaluation(&self, now: DateTime<Utc>, limit: usize)
        -> Result<Vec<ToolOperation>>;

    async fn find_spawned_from(&self, parent: Uuid) -> Result<Option<ToolOperation>>;

    /// Completed recurring templates with repetitions left and no spawned
    /// instance yet, oldest first.
    async fn pending_recurrences(&self, limit: usize) -> Result<Vec<ToolOperation>>;
}

pub(crate) fn check_append_only(stored: &ToolOperation, next: &ToolOperation) -> Result<()> {
    let prefix_ok = next.history.len() >= stored.history.len()
        && next.history[..stored.history.len()] == stored.history[..];
    if !prefix_ok {
        return Err(OrchestrationError::AuditError(format!(
            "history of operation {} would be rewritten",
            stored.id
        )));
    }
    Ok(())
}

/// In-memory operation store for development and tests
pub struct InMemoryOperationStore {
    operations: Arc<RwLock<HashMap<Uuid, ToolOperation>>>,
}

impl InMemoryOperationStore {
    pub fn new() -> Self {
        Self {
            operations: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryOperationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl OperationStore for InMemoryOperationStore {
    async fn insert(&self, op: &ToolOperation) -> Result<()> {
        let mut operations = self.operations.write().await;

        if operations.contains_key(&op.id) {
            return Err(OrchestrationError::DuplicateOperation(op.id));
        }
        // One spawned instance per template.
        if let Some(parent) = op.spawned_from {
            if let Some(existing) = operations.values().find(|o| o.spawned_from == Some(parent)) {
                return Err(OrchestrationError::DuplicateOperation(existing.id));
            }
        }

        operations.insert(op.id, op.clone());
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<Option<ToolOperation>> {
        let operations = self.operations.read().await;
        Ok(operations.get(&id).cloned())
    }

    async fn save(&self, op: &ToolOperation, expected_version: u64) -> Result<ToolOperation> {
        let mut operations = self.operations.write().await;

        let stored = operations
            .get_mut(&op.id)
            .ok_or(OrchestrationError::OperationNotFound(op.id))?;

        if stored.version != expected_version {
            return Err(OrchestrationError::VersionConflict {
                id: op.id,
                expected: expected_version,
            });
        }
        check_append_only(stored, op)?;

        let mut next = op.clone();
        next.version = expected_version + 1;
        *stored = next.clone();
        Ok(next)
    }

    async fn find_active_for_session(&self, session_id: &str) -> Result<Option<ToolOperation>> {
        let operations = self.operations.read().await;
        Ok(operations
            .values()
            .filter(|o| o.session_id == session_id && o.state.top_state().holds_conversation())
            .max_by_key(|o| o.created_at)
            .cloned())
    }

    async fn list_for_session(&self, session_id: &str) -> Result<Vec<ToolOperation>> {
        let operations = self.operations.read().await;
        let mut found: Vec<ToolOperation> = operations
            .values()
            .filter(|o| o.session_id == session_id)
            .cloned()
            .collect();
        found.sort_by_key(|o| o.created_at);
        Ok(found)
    }

    async fn due_for_evaluation(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ToolOperation>> {
        let operations = self.operations.read().await;
        let mut due: Vec<(DateTime<Utc>, &ToolOperation)> = operations
            .values()
            .filter_map(|o| o.next_due_at().filter(|at| *at <= now).map(|at| (at, o)))
            .collect();
        due.sort_by_key(|(at, o)| (*at, o.id));
        Ok(due.into_iter().take(limit).map(|(_, o)| o.clone()).collect())
    }

    async fn find_spawned_from(&self, parent: Uuid) -> Result<Option<ToolOperation>> {
        let operations = self.operations.read().await;
        Ok(operations
            .values()
            .find(|o| o.spawned_from == Some(parent))
            .cloned())
    }
    async fn pending_recurrences(&self, limit: usize) -> Result<Vec<ToolOperation>> {
        let operations = self.operations.read().await;
        let spawned: HashSet<Uuid> = operations.values().filter_map(|o| o.spawned_from).collect();
        let mut pending: Vec<&ToolOperation> = operations
            .values()
            .filter(|o| o.awaits_recurrence() && !spawned.contains(&o.id))
            .collect();
        pending.sort_by_key(|o| (o.updated_at, o.id));
        Ok(pending.into_iter().take(limit).cloned().collect())
    }
}
