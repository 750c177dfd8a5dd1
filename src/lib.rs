//! Intents Orchestrator
//!
//! A stateful orchestrator for multi-step on-chain operations requested
//! through a conversational agent:
//! - Collects parameters incrementally across chat turns
//! - Gates every operation on an explicit, durable approval
//! - Schedules time and price triggers without blocking anything in-process
//! - Executes deposit / quote / bridge / withdraw steps with idempotent retries
//! - Records an append-only, replayable history for every operation
//!
//! LIFECYCLE:
//! COLLECTING → AWAITING_APPROVAL → [SCHEDULED →] EXECUTING → COMPLETED | FAILED | CANCELLED

pub mod agent;
pub mod api;
pub mod approval;
pub mod audit;
pub mod classifier;
pub mod config;
pub mod error;
pub mod execution;
pub mod machine;
pub mod models;
pub mod scheduling;
pub mod session;
pub mod state;
pub mod tools;

pub use error::{OrchestrationError, Result};

// Re-export common types
pub use agent::Orchestrator;
pub use classifier::CommandDetector;
pub use models::*;
