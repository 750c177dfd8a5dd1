//! Error types for the intents orchestrator

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

#[derive(Error, Debug)]
pub enum OrchestrationError {

    // =============================
    // Operation Lifecycle Errors
    // =============================

    #[error("Operation not found: {0}")]
    OperationNotFound(Uuid),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid transition from {from} on {event}")]
    InvalidTransition { from: String, event: String },

    #[error("Operation {0} has no approved decision")]
    ApprovalRequired(Uuid),

    #[error("Step already in flight: {0}")]
    StepInFlight(String),

    #[error("Version conflict on operation {id}: expected {expected}")]
    VersionConflict { id: Uuid, expected: u64 },

    #[error("Operation {0} already exists")]
    DuplicateOperation(Uuid),

    #[error("Concurrent updates exhausted retries for operation {0}")]
    ContentionExhausted(Uuid),

    // =============================
    // Collaborator Errors
    // =============================

    #[error("Capability error: {0}")]
    CapabilityError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Audit error: {0}")]
    AuditError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("UUID parse error: {0}")]
    UuidError(#[from] uuid::Error),

    #[error("SQL error: {0}")]
    SqlError(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl OrchestrationError {
    pub(crate) fn invalid_transition(from: impl ToString, event: impl ToString) -> Self {
        OrchestrationError::InvalidTransition {
            from: from.to_string(),
            event: event.to_string(),
        }
    }
}
