//! Engine and server configuration
//!
//! Every retry ceiling, polling cadence and horizon is a policy parameter
//! read from the environment, with production defaults.

use crate::error::OrchestrationError;
use crate::models::MAX_EXPIRATION_HOURS;
use crate::Result;
use chrono::Duration;
use std::env;
use std::str::FromStr;

/// Longest span any policy value may express; larger settings are clamped.
const MAX_POLICY_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Policy seconds as a `Duration` that can always be added to a timestamp.
pub fn policy_secs(secs: u64) -> Duration {
    Duration::seconds(secs.min(MAX_POLICY_SECS) as i64)
}

/// Bounded exponential backoff for retryable step failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl RetryPolicy {
    /// Delay before the attempt following `attempts` failed tries.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let max = self.backoff_max_ms.max(1);
        let base = self.backoff_base_ms.clamp(1, max);
        let shift = attempts.saturating_sub(1).min(20);
        let delay = base
            .saturating_mul(1u64 << shift)
            .min(max)
            .min(MAX_POLICY_SECS * 1_000);
        Duration::milliseconds(delay as i64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    pub approval_ttl_secs: u64,
    pub default_poll_interval_secs: u64,
    pub min_poll_interval_secs: u64,
    pub max_poll_interval_secs: u64,
    pub requote_interval_secs: u64,
    pub bridge_poll_interval_secs: u64,
    pub bridge_horizon_secs: u64,
    pub max_trigger_checks: u32,
    /// Below-limit quotes tolerated before the step gives up.
    pub max_requotes: u32,
    pub order_expiration_hours: u32,
    pub step_lease_secs: u64,
    pub scheduler_tick_secs: u64,
    pub scheduler_batch_size: usize,
    /// Retries scheduled further out than this are left to the scheduler tick.
    pub inline_retry_max_ms: u64,
    pub command_confidence_threshold: f32,
    /// Run step execution on spawned tasks instead of the caller's task.
    pub background_execution: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            approval_ttl_secs: 24 * 60 * 60,
            default_poll_interval_secs: 60,
            min_poll_interval_secs: 60,
            max_poll_interval_secs: 15 * 60,
            requote_interval_secs: 60,
            bridge_poll_interval_secs: 30,
            bridge_horizon_secs: 60 * 60,
            max_trigger_checks: 1_000,
            max_requotes: 120,
            order_expiration_hours: 24,
            step_lease_secs: 300,
            scheduler_tick_secs: 15,
            scheduler_batch_size: 100,
            inline_retry_max_ms: 30_000,
            command_confidence_threshold: 0.6,
            background_execution: true,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        let d = Self::default();
        Ok(Self {
            retry: RetryPolicy {
                max_attempts: env_or("ENGINE_MAX_STEP_ATTEMPTS", d.retry.max_attempts)?,
                backoff_base_ms: env_or("ENGINE_BACKOFF_BASE_MS", d.retry.backoff_base_ms)?,
                backoff_max_ms: env_or("ENGINE_BACKOFF_MAX_MS", d.retry.backoff_max_ms)?,
            },
            approval_ttl_secs: env_or("ENGINE_APPROVAL_TTL_SECS", d.approval_ttl_secs)?,
            default_poll_interval_secs: env_or(
                "ENGINE_POLL_INTERVAL_SECS",
                d.default_poll_interval_secs,
            )?,
            min_poll_interval_secs: env_or(
                "ENGINE_MIN_POLL_INTERVAL_SECS",
                d.min_poll_interval_secs,
            )?,
            max_poll_interval_secs: env_or(
                "ENGINE_MAX_POLL_INTERVAL_SECS",
                d.max_poll_interval_secs,
            )?,
            requote_interval_secs: env_or("ENGINE_REQUOTE_INTERVAL_SECS", d.requote_interval_secs)?,
            bridge_poll_interval_secs: env_or(
                "ENGINE_BRIDGE_POLL_INTERVAL_SECS",
                d.bridge_poll_interval_secs,
            )?,
            bridge_horizon_secs: env_or("ENGINE_BRIDGE_HORIZON_SECS", d.bridge_horizon_secs)?,
            max_trigger_checks: env_or("ENGINE_MAX_TRIGGER_CHECKS", d.max_trigger_checks)?,
            max_requotes: env_or("ENGINE_MAX_REQUOTES", d.max_requotes)?,
            order_expiration_hours: env_or(
                "ENGINE_ORDER_EXPIRATION_HOURS",
                d.order_expiration_hours,
            )?,
            step_lease_secs: env_or("ENGINE_STEP_LEASE_SECS", d.step_lease_secs)?,
            scheduler_tick_secs: env_or("ENGINE_SCHEDULER_TICK_SECS", d.scheduler_tick_secs)?,
            scheduler_batch_size: env_or("ENGINE_SCHEDULER_BATCH_SIZE", d.scheduler_batch_size)?,
            inline_retry_max_ms: env_or("ENGINE_INLINE_RETRY_MAX_MS", d.inline_retry_max_ms)?,
            command_confidence_threshold: env_or(
                "ENGINE_COMMAND_CONFIDENCE_THRESHOLD",
                d.command_confidence_threshold,
            )?,
            background_execution: env_or(
                "ENGINE_BACKGROUND_EXECUTION",
                d.background_execution,
            )?,
        }
        .validated()?)
    }

    fn validated(self) -> Result<Self> {
        if self.retry.max_attempts == 0 {
            return Err(OrchestrationError::ConfigError(
                "ENGINE_MAX_STEP_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        if self.min_poll_interval_secs > self.max_poll_interval_secs {
            return Err(OrchestrationError::ConfigError(format!(
                "poll interval bounds inverted: {} > {}",
                self.min_poll_interval_secs, self.max_poll_interval_secs
            )));
        }
        if self.order_expiration_hours == 0 || self.order_expiration_hours > MAX_EXPIRATION_HOURS {
            return Err(OrchestrationError::ConfigError(format!(
                "ENGINE_ORDER_EXPIRATION_HOURS must be within 1..={}",
                MAX_EXPIRATION_HOURS
            )));
        }
        if !(0.0..=1.0).contains(&self.command_confidence_threshold) {
            return Err(OrchestrationError::ConfigError(
                "ENGINE_COMMAND_CONFIDENCE_THRESHOLD must be within [0, 1]".to_string(),
            ));
        }
        Ok(self)
    }

    /// Requested price-polling interval clamped to the configured range.
    pub fn poll_interval_secs(&self, requested: Option<u64>) -> u64 {
        requested
            .unwrap_or(self.default_poll_interval_secs)
            .clamp(self.min_poll_interval_secs, self.max_poll_interval_secs)
    }

    pub fn approval_ttl(&self) -> Duration {
        policy_secs(self.approval_ttl_secs)
    }

    pub fn step_lease(&self) -> Duration {
        policy_secs(self.step_lease_secs)
    }

    pub fn requote_interval(&self) -> Duration {
        policy_secs(self.requote_interval_secs)
    }

    pub fn bridge_poll_interval(&self) -> Duration {
        policy_secs(self.bridge_poll_interval_secs)
    }

    pub fn bridge_horizon(&self) -> Duration {
        policy_secs(self.bridge_horizon_secs)
    }

    /// Fast cadence for tests and local demos: millisecond backoff, inline execution.
    pub fn immediate() -> Self {
        Self {
            retry: RetryPolicy {
                max_attempts: 5,
                backoff_base_ms: 1,
                backoff_max_ms: 5,
            },
            bridge_poll_interval_secs: 0,
            requote_interval_secs: 0,
            inline_retry_max_ms: 1_000,
            background_execution: false,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub database_url: Option<String>,
    pub solver_api_base_url: Option<String>,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        let port = env::var("PORT")
            .or_else(|_| env::var("API_PORT"))
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|e| OrchestrationError::ConfigError(format!("invalid PORT: {}", e)))?;

        let database_url = env::var("DATABASE_URL")
            .or_else(|_| env::var("POSTGRES_URL"))
            .ok()
            .filter(|v| !v.trim().is_empty());

        let solver_api_base_url = env::var("SOLVER_API_BASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty());

        Ok(Self {
            port,
            database_url,
            solver_api_base_url,
        })
    }
}

fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse().map_err(|e| {
            OrchestrationError::ConfigError(format!("invalid {}={:?}: {}", name, raw, e))
        }),
        _ => Ok(default),
    }
}
