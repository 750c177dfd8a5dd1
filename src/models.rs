//! Core data models for tool operations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

//
// ================= Kinds & States =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    Swap,
    LimitSwap,
    RecurringSwap,
    SocialPost,
}

const SWAP_STEPS: &[SubState] = &[
    SubState::Deposit,
    SubState::Quote,
    SubState::BridgeMonitor,
    SubState::Withdraw,
];

const POST_STEPS: &[SubState] = &[SubState::Publish];

impl OperationKind {
    /// Ordered step template executed while EXECUTING. `Done` is implicit.
    pub fn steps(&self) -> &'static [SubState] {
        match self {
            OperationKind::Swap | OperationKind::LimitSwap | OperationKind::RecurringSwap => {
                SWAP_STEPS
            }
            OperationKind::SocialPost => POST_STEPS,
        }
    }

    pub fn first_step(&self) -> SubState {
        self.steps().first().copied().unwrap_or(SubState::Done)
    }

    /// Step following `step` in this kind's template.
    pub fn next_step(&self, step: SubState) -> SubState {
        let steps = self.steps();
        steps
            .iter()
            .position(|s| *s == step)
            .and_then(|i| steps.get(i + 1))
            .copied()
            .unwrap_or(SubState::Done)
    }

    /// Step completed immediately before `step`, if any.
    pub fn previous_step(&self, step: SubState) -> Option<SubState> {
        let steps = self.steps();
        match steps.iter().position(|s| *s == step) {
            Some(0) => None,
            Some(i) => steps.get(i - 1).copied(),
            None if step == SubState::Done => steps.last().copied(),
            None => None,
        }
    }

    pub fn is_recurring(&self) -> bool {
        matches!(self, OperationKind::RecurringSwap)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Swap => "SWAP",
            OperationKind::LimitSwap => "LIMIT_SWAP",
            OperationKind::RecurringSwap => "RECURRING_SWAP",
            OperationKind::SocialPost => "SOCIAL_POST",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubState {
    Deposit,
    Quote,
    BridgeMonitor,
    Withdraw,
    Publish,
    Done,
}

impl SubState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubState::Deposit => "DEPOSIT",
            SubState::Quote => "QUOTE",
            SubState::BridgeMonitor => "BRIDGE_MONITOR",
            SubState::Withdraw => "WITHDRAW",
            SubState::Publish => "PUBLISH",
            SubState::Done => "DONE",
        }
    }
}

impl fmt::Display for SubState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TopState {
    Collecting,
    AwaitingApproval,
    Scheduled,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl TopState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopState::Collecting => "COLLECTING",
            TopState::AwaitingApproval => "AWAITING_APPROVAL",
            TopState::Scheduled => "SCHEDULED",
            TopState::Executing => "EXECUTING",
            TopState::Completed => "COMPLETED",
            TopState::Failed => "FAILED",
            TopState::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TopState::Completed | TopState::Failed | TopState::Cancelled)
    }

    /// States in which a session is held in tool mode.
    pub fn holds_conversation(&self) -> bool {
        matches!(self, TopState::Collecting | TopState::AwaitingApproval)
    }
}

impl fmt::Display for TopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hierarchical operation state. The sub-state only exists inside `Executing`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(
    tag = "top_state",
    content = "sub_state",
    rename_all = "SCREAMING_SNAKE_CASE"
)]
pub enum OperationState {
    Collecting,
    AwaitingApproval,
    Scheduled,
    Executing(SubState),
    Completed,
    Failed,
    Cancelled,
}

impl OperationState {
    pub fn top_state(&self) -> TopState {
        match self {
            OperationState::Collecting => TopState::Collecting,
            OperationState::AwaitingApproval => TopState::AwaitingApproval,
            OperationState::Scheduled => TopState::Scheduled,
            OperationState::Executing(_) => TopState::Executing,
            OperationState::Completed => TopState::Completed,
            OperationState::Failed => TopState::Failed,
            OperationState::Cancelled => TopState::Cancelled,
        }
    }

    pub fn sub_state(&self) -> Option<SubState> {
        match self {
            OperationState::Executing(step) => Some(*step),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.top_state().is_terminal()
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationState::Executing(step) => write!(f, "EXECUTING/{}", step),
            other => f.write_str(other.top_state().as_str()),
        }
    }
}

//
// ================= Parameters =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Comparator {
    #[default]
    #[serde(alias = ">=")]
    Gte,
    #[serde(alias = "<=")]
    Lte,
}

impl Comparator {
    pub fn holds(&self, observed: f64, threshold: f64) -> bool {
        match self {
            Comparator::Gte => observed >= threshold,
            Comparator::Lte => observed <= threshold,
        }
    }

    /// Whether `candidate` is a better sample than `current` for this comparator.
    pub fn improves(&self, candidate: f64, current: f64) -> bool {
        match self {
            Comparator::Gte => candidate > current,
            Comparator::Lte => candidate < current,
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Comparator::Gte => f.write_str(">="),
            Comparator::Lte => f.write_str("<="),
        }
    }
}

/// Fields collected from the command interpreter. Mutable only while COLLECTING.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OperationParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_asset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_asset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparator: Option<Comparator>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_chain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_wallet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slippage_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_hours: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_minutes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_repetitions: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

pub const DEFAULT_DESTINATION_CHAIN: &str = "near";
pub const DEFAULT_SLIPPAGE_PCT: f64 = 0.5;
/// Longest order lifetime a request may ask for (one year).
pub const MAX_EXPIRATION_HOURS: u32 = 365 * 24;
/// Longest gap between recurring instances (one year).
pub const MAX_INTERVAL_MINUTES: u32 = 365 * 24 * 60;

macro_rules! merge_fields {
    ($target:expr, $update:expr, $($field:ident),+ $(,)?) => {
        $(
            if $update.$field.is_some() {
                $target.$field = $update.$field.clone();
            }
        )+
    };
}

impl OperationParameters {
    /// Overlay every field present in `update`.
    pub fn merge(&mut self, update: &OperationParameters) {
        merge_fields!(
            self,
            update,
            source_asset,
            destination_asset,
            amount,
            target_price,
            comparator,
            destination_chain,
            destination_wallet,
            slippage_pct,
            execute_at,
            poll_interval_secs,
            expiration_hours,
            interval_minutes,
            remaining_repetitions,
            content,
        );
    }

    /// Names of required fields still missing for `kind`.
    pub fn missing_for(&self, kind: OperationKind) -> Vec<&'static str> {
        let mut missing = Vec::new();
        match kind {
            OperationKind::SocialPost => {
                if self.content.as_deref().map_or(true, |c| c.trim().is_empty()) {
                    missing.push("content");
                }
            }
            _ => {
                if self.source_asset.is_none() {
                    missing.push("source_asset");
                }
                if self.destination_asset.is_none() {
                    missing.push("destination_asset");
                }
                if self.amount.is_none() {
                    missing.push("amount");
                }
                if kind == OperationKind::LimitSwap && self.target_price.is_none() {
                    missing.push("target_price");
                }
                if kind == OperationKind::RecurringSwap && self.interval_minutes.is_none() {
                    missing.push("interval_minutes");
                }
            }
        }
        missing
    }

    /// Reject malformed values. Missing values are not an error here.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if let Some(amount) = self.amount {
            if !amount.is_finite() || amount <= 0.0 {
                return Err(format!("amount must be positive, got {}", amount));
            }
        }
        if let Some(price) = self.target_price {
            if !price.is_finite() || price <= 0.0 {
                return Err(format!("target_price must be positive, got {}", price));
            }
        }
        if let Some(slippage) = self.slippage_pct {
            if !(0.0..=100.0).contains(&slippage) {
                return Err(format!("slippage_pct out of range: {}", slippage));
            }
        }
        if self.interval_minutes == Some(0) {
            return Err("interval_minutes must be positive".to_string());
        }
        if let Some(minutes) = self.interval_minutes {
            if minutes > MAX_INTERVAL_MINUTES {
                return Err(format!(
                    "interval_minutes must be at most {}, got {}",
                    MAX_INTERVAL_MINUTES, minutes
                ));
            }
        }
        if let Some(hours) = self.expiration_hours {
            if hours == 0 || hours > MAX_EXPIRATION_HOURS {
                return Err(format!(
                    "expiration_hours must be within 1..={}, got {}",
                    MAX_EXPIRATION_HOURS, hours
                ));
            }
        }
        if self.poll_interval_secs == Some(0) {
            return Err("poll_interval_secs must be positive".to_string());
        }
        for (name, asset) in [
            ("source_asset", &self.source_asset),
            ("destination_asset", &self.destination_asset),
        ] {
            if let Some(asset) = asset {
                if asset.trim().is_empty() {
                    return Err(format!("{} must not be empty", name));
                }
            }
        }
        if let (Some(src), Some(dst)) = (&self.source_asset, &self.destination_asset) {
            if src.eq_ignore_ascii_case(dst) {
                return Err(format!("cannot swap {} into itself", src));
            }
        }
        Ok(())
    }

    pub fn destination_chain(&self) -> &str {
        self.destination_chain
            .as_deref()
            .unwrap_or(DEFAULT_DESTINATION_CHAIN)
    }

    pub fn slippage_pct(&self) -> f64 {
        self.slippage_pct.unwrap_or(DEFAULT_SLIPPAGE_PCT)
    }

    /// Human-readable line presented to the approver.
    pub fn summary(&self, kind: OperationKind) -> String {
        match kind {
            OperationKind::SocialPost => format!(
                "Publish post: {}",
                self.content.as_deref().unwrap_or_default()
            ),
            _ => {
                let mut line = format!(
                    "{} {} {} -> {} on {}",
                    kind,
                    self.amount.unwrap_or_default(),
                    self.source_asset.as_deref().unwrap_or("?"),
                    self.destination_asset.as_deref().unwrap_or("?"),
                    self.destination_chain(),
                );
                if let Some(price) = self.target_price {
                    line.push_str(&format!(
                        " when rate {} {}",
                        self.comparator.unwrap_or_default(),
                        price
                    ));
                }
                if let Some(wallet) = &self.destination_wallet {
                    line.push_str(&format!(" to {}", wallet));
                }
                if let Some(interval) = self.interval_minutes {
                    line.push_str(&format!(" every {} min", interval));
                }
                line
            }
        }
    }
}

//
// ================= Approval =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Approval {
    pub status: ApprovalStatus,
    pub requester: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub requested_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub approver: Option<String>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    /// Template operation whose approval this one inherits.
    #[serde(default)]
    pub inherited_from: Option<Uuid>,
}

impl Approval {
    pub fn pending(requester: impl Into<String>) -> Self {
        Self {
            status: ApprovalStatus::Pending,
            requester: requester.into(),
            summary: None,
            requested_at: None,
            deadline: None,
            approver: None,
            resolved_at: None,
            inherited_from: None,
        }
    }

    pub fn is_approved(&self) -> bool {
        self.status == ApprovalStatus::Approved
    }
}

//
// ================= Trigger =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerCondition {
    At {
        execute_at: DateTime<Utc>,
    },
    Price {
        comparator: Comparator,
        threshold: f64,
        poll_interval_secs: u64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trigger {
    pub condition: TriggerCondition,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub next_eval_at: DateTime<Utc>,
    #[serde(default)]
    pub last_checked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub checks: u32,
    #[serde(default)]
    pub best_price_seen: Option<f64>,
    #[serde(default)]
    pub fired: bool,
    #[serde(default)]
    pub fired_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub observed_price: Option<f64>,
}

impl Trigger {
    pub fn new(
        condition: TriggerCondition,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        let next_eval_at = match &condition {
            TriggerCondition::At { execute_at } => *execute_at,
            TriggerCondition::Price { .. } => now,
        };
        Self {
            condition,
            expires_at,
            next_eval_at,
            last_checked_at: None,
            checks: 0,
            best_price_seen: None,
            fired: false,
            fired_at: None,
            observed_price: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>, max_checks: u32) -> bool {
        self.expires_at.map_or(false, |at| at <= now) || self.checks >= max_checks
    }

    /// Limit the fetched rate must satisfy, if the trigger is price based.
    pub fn price_limit(&self) -> Option<(Comparator, f64)> {
        match &self.condition {
            TriggerCondition::Price {
                comparator,
                threshold,
                ..
            } => Some((*comparator, *threshold)),
            TriggerCondition::At { .. } => None,
        }
    }
}

//
// ================= External Results =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Receipt {
    pub reference: String,
    pub idempotency_key: String,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub detail: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Quote {
    pub quote_hash: String,
    /// Destination units per source unit.
    pub rate: f64,
    pub amount_in: f64,
    pub amount_out: f64,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BridgeStatus {
    Pending,
    Filled,
    Failed,
    Expired,
}

impl BridgeStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BridgeStatus::Pending)
    }
}

/// Payload of a successful step call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepOutcome {
    Submitted { receipt: Receipt },
    QuoteAccepted { quote: Quote, receipt: Receipt },
    QuoteBelowLimit { quote: Quote },
    Bridge { status: BridgeStatus },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepFailure {
    pub retryable: bool,
    pub reason: String,
}

impl StepFailure {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self {
            retryable: true,
            reason: reason.into(),
        }
    }

    pub fn unrecoverable(reason: impl Into<String>) -> Self {
        Self {
            retryable: false,
            reason: reason.into(),
        }
    }
}

//
// ================= Attempts =================
//

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StepAttempt {
    pub attempts: u32,
    /// Bumped only when a fresh external request is required (e.g. re-quote).
    pub generation: u32,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub in_flight: bool,
    #[serde(default)]
    pub lease_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub receipt: Option<Receipt>,
    #[serde(default)]
    pub quote: Option<Quote>,
    #[serde(default)]
    pub polls: u32,
    #[serde(default)]
    pub requotes: u32,
}

pub type Attempts = BTreeMap<SubState, StepAttempt>;

//
// ================= History =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    ApprovalRejected,
    ApprovalExpired,
    RetryableStepFailure,
    UnrecoverableStepFailure,
    TriggerExpired,
    ReconciliationRequired,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Cause {
    Created {
        #[serde(default)]
        spawned_from: Option<Uuid>,
    },
    ParametersUpdated {
        missing: Vec<String>,
    },
    ParametersComplete,
    TriggerRegistered,
    Approved {
        approver: String,
    },
    Rejected {
        approver: String,
    },
    ApprovalExpired,
    TriggerFired {
        #[serde(default)]
        observed_price: Option<f64>,
    },
    TriggerExpired,
    StepSucceeded {
        step: SubState,
        attempt: u32,
    },
    StepFailed {
        step: SubState,
        attempt: u32,
        retryable: bool,
        reason: String,
    },
    StepLeaseExpired {
        step: SubState,
        attempt: u32,
    },
    QuoteRejected {
        rate: f64,
        generation: u32,
    },
    RetriesExhausted {
        step: SubState,
        attempts: u32,
    },
    BridgeTerminal {
        status: BridgeStatus,
    },
    MonitoringHorizonExceeded {
        polls: u32,
    },
    OrderExpired,
    CancelRequested {
        requested_by: String,
    },
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub from: OperationState,
    pub to: OperationState,
    pub cause: Cause,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TerminalReport {
    pub kind: FailureKind,
    pub reason: String,
    pub last_completed_step: Option<SubState>,
    pub reconciliation_required: bool,
}

//
// ================= Tool Operation =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolOperation {
    pub id: Uuid,
    pub kind: OperationKind,
    pub session_id: String,
    pub requester: String,
    pub parameters: OperationParameters,
    pub state: OperationState,
    pub approval: Approval,
    #[serde(default)]
    pub trigger: Option<Trigger>,
    #[serde(default)]
    pub attempts: Attempts,
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub terminal: Option<TerminalReport>,
    #[serde(default)]
    pub cancel_requested: Option<String>,
    #[serde(default)]
    pub spawned_from: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl ToolOperation {
    pub fn new(
        kind: OperationKind,
        session_id: impl Into<String>,
        requester: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self::with_origin(kind, session_id.into(), requester.into(), None, now)
    }

    /// Fresh instance of a recurring template. The template itself is never reused.
    pub fn spawn_from(template: &ToolOperation, now: DateTime<Utc>) -> Self {
        Self::with_origin(
            template.kind,
            template.session_id.clone(),
            template.requester.clone(),
            Some(template.id),
            now,
        )
    }

    fn with_origin(
        kind: OperationKind,
        session_id: String,
        requester: String,
        spawned_from: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut op = Self {
            id: Uuid::new_v4(),
            kind,
            session_id,
            requester: requester.clone(),
            parameters: OperationParameters::default(),
            state: OperationState::Collecting,
            approval: Approval::pending(requester),
            trigger: None,
            attempts: Attempts::new(),
            history: Vec::new(),
            terminal: None,
            cancel_requested: None,
            spawned_from,
            created_at: now,
            updated_at: now,
            version: 0,
        };
        op.record(OperationState::Collecting, Cause::Created { spawned_from }, now);
        op
    }

    /// Append a history entry and move to `to`.
    pub fn record(&mut self, to: OperationState, cause: Cause, at: DateTime<Utc>) {
        let entry = HistoryEntry {
            seq: self.history.len() as u64,
            at,
            from: self.state,
            to,
            cause,
        };
        self.history.push(entry);
        self.state = to;
        self.updated_at = at;
    }

    pub fn attempt(&self, step: SubState) -> Option<&StepAttempt> {
        self.attempts.get(&step)
    }

    pub fn attempt_mut(&mut self, step: SubState) -> &mut StepAttempt {
        self.attempts.entry(step).or_default()
    }

    /// Last sub-state whose external call completed, for operator hand-off.
    pub fn last_completed_step(&self) -> Option<SubState> {
        match self.state {
            OperationState::Executing(step) => self.kind.previous_step(step),
            OperationState::Completed => self.kind.steps().last().copied(),
            _ => self.terminal.as_ref().and_then(|t| t.last_completed_step),
        }
    }

    /// A completed recurring template with repetitions left to spawn.
    pub fn awaits_recurrence(&self) -> bool {
        self.state == OperationState::Completed
            && self.kind.is_recurring()
            && self.parameters.remaining_repetitions.unwrap_or(0) > 0
    }

    /// When the scheduler next needs to look at this operation.
    pub fn next_due_at(&self) -> Option<DateTime<Utc>> {
        match self.state {
            OperationState::AwaitingApproval => self.approval.deadline,
            OperationState::Scheduled => self.trigger.as_ref().map(|t| match t.expires_at {
                Some(expiry) if expiry < t.next_eval_at => expiry,
                _ => t.next_eval_at,
            }),
            OperationState::Executing(step) => match self.attempt(step) {
                Some(a) if a.in_flight => a.lease_expires_at,
                Some(a) => Some(a.next_retry_at.unwrap_or(self.updated_at)),
                None => Some(self.updated_at),
            },
            _ => None,
        }
    }

    pub fn snapshot(&self) -> OperationSnapshot {
        OperationSnapshot::from(self)
    }
}

//
// ================= Outward Views =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationSnapshot {
    pub operation_id: Uuid,
    pub kind: OperationKind,
    pub session_id: String,
    pub top_state: TopState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_state: Option<SubState>,
    pub approval: ApprovalStatus,
    pub parameters: OperationParameters,
    pub missing_parameters: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<Trigger>,
    pub attempts: BTreeMap<SubState, u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal: Option<TerminalReport>,
    pub history_len: usize,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl From<&ToolOperation> for OperationSnapshot {
    fn from(op: &ToolOperation) -> Self {
        Self {
            operation_id: op.id,
            kind: op.kind,
            session_id: op.session_id.clone(),
            top_state: op.state.top_state(),
            sub_state: op.state.sub_state(),
            approval: op.approval.status,
            parameters: op.parameters.clone(),
            missing_parameters: op
                .parameters
                .missing_for(op.kind)
                .into_iter()
                .map(str::to_string)
                .collect(),
            trigger: op.trigger.clone(),
            attempts: op
                .attempts
                .iter()
                .map(|(step, a)| (*step, a.attempts))
                .collect(),
            terminal: op.terminal.clone(),
            history_len: op.history.len(),
            version: op.version,
            updated_at: op.updated_at,
        }
    }
}

/// Outbound status event consumed by presentation and logging collaborators.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusEvent {
    pub operation_id: Uuid,
    pub session_id: String,
    pub top_state: TopState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_state: Option<SubState>,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Inbound request from the command interpreter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredRequest {
    pub operation_kind: OperationKind,
    #[serde(default)]
    pub parameters: OperationParameters,
    pub session_id: String,
    pub requester: String,
}

/// Inbound decision from the approval surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalInput {
    pub operation_id: Uuid,
    pub decision: ApprovalDecision,
    pub approver: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executing_state_serializes_nested() {
        let state = OperationState::Executing(SubState::BridgeMonitor);
        let json = serde_json::to_value(state).unwrap();
        assert_eq!(json["top_state"], "EXECUTING");
        assert_eq!(json["sub_state"], "BRIDGE_MONITOR");

        let back: OperationState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);

        let json = serde_json::to_value(OperationState::Scheduled).unwrap();
        assert_eq!(json["top_state"], "SCHEDULED");
        assert!(json.get("sub_state").is_none());
    }

    #[test]
    fn test_step_templates() {
        let kind = OperationKind::Swap;
        assert_eq!(kind.first_step(), SubState::Deposit);
        assert_eq!(kind.next_step(SubState::Deposit), SubState::Quote);
        assert_eq!(kind.next_step(SubState::Withdraw), SubState::Done);
        assert_eq!(kind.previous_step(SubState::Deposit), None);
        assert_eq!(kind.previous_step(SubState::Done), Some(SubState::Withdraw));

        let post = OperationKind::SocialPost;
        assert_eq!(post.first_step(), SubState::Publish);
        assert_eq!(post.next_step(SubState::Publish), SubState::Done);
    }

    #[test]
    fn test_missing_and_merge() {
        let mut params = OperationParameters {
            source_asset: Some("NEAR".into()),
            amount: Some(5.0),
            ..Default::default()
        };
        assert_eq!(
            params.missing_for(OperationKind::LimitSwap),
            vec!["destination_asset", "target_price"]
        );

        params.merge(&OperationParameters {
            destination_asset: Some("ETH".into()),
            target_price: Some(1.2),
            ..Default::default()
        });
        assert!(params.missing_for(OperationKind::LimitSwap).is_empty());
        assert_eq!(params.amount, Some(5.0));
    }

    #[test]
    fn test_validate_rejects_malformed_values() {
        let bad_amount = OperationParameters {
            amount: Some(-1.0),
            ..Default::default()
        };
        assert!(bad_amount.validate().is_err());

        let same_asset = OperationParameters {
            source_asset: Some("near".into()),
            destination_asset: Some("NEAR".into()),
            ..Default::default()
        };
        assert!(same_asset.validate().is_err());
    }

    #[test]
    fn test_validate_bounds_time_spans() {
        let forever = OperationParameters {
            expiration_hours: Some(u32::MAX),
            ..Default::default()
        };
        assert!(forever.validate().is_err());

        let sparse = OperationParameters {
            interval_minutes: Some(u32::MAX),
            ..Default::default()
        };
        assert!(sparse.validate().is_err());

        let year = OperationParameters {
            expiration_hours: Some(MAX_EXPIRATION_HOURS),
            interval_minutes: Some(MAX_INTERVAL_MINUTES),
            ..Default::default()
        };
        assert!(year.validate().is_ok());
    }

    #[test]
    fn test_comparator_aliases() {
        let c: Comparator = serde_json::from_str("\"<=\"").unwrap();
        assert_eq!(c, Comparator::Lte);
        assert!(c.holds(1.0, 1.0));
        assert!(Comparator::Gte.holds(1.25, 1.20));
        assert!(!Comparator::Gte.holds(1.10, 1.20));
    }
}
