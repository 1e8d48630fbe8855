use crate::config::DlqConfig;
use crate::error::ErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DLQ_SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// RetryStrategy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// `base * 2^retry_count`, capped at the configured maximum.
    ExponentialBackoff,
    /// `base` between every attempt.
    FixedInterval,
    /// Never retried automatically.
    ManualOnly,
}

impl std::fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryStrategy::ExponentialBackoff => f.write_str("exponential_backoff"),
            RetryStrategy::FixedInterval => f.write_str("fixed_interval"),
            RetryStrategy::ManualOnly => f.write_str("manual_only"),
        }
    }
}

/// How a failure of `kind` is handled: strategy, retry budget, and whether it
/// goes straight to manual review.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub strategy: RetryStrategy,
    pub max_retries: u32,
    pub manual_review: bool,
}

pub fn classify(kind: ErrorKind, requested_max: u32, cfg: &DlqConfig) -> Classification {
    match kind {
        ErrorKind::Connection | ErrorKind::CircuitOpen | ErrorKind::Internal => Classification {
            strategy: RetryStrategy::ExponentialBackoff,
            max_retries: requested_max,
            manual_review: requested_max == 0,
        },
        ErrorKind::Timeout => {
            let max = requested_max.min(cfg.timeout_retry_cap);
            Classification {
                strategy: RetryStrategy::FixedInterval,
                max_retries: max,
                manual_review: max == 0,
            }
        }
        ErrorKind::Validation | ErrorKind::Permission => Classification {
            strategy: RetryStrategy::ManualOnly,
            max_retries: 1,
            manual_review: true,
        },
        ErrorKind::Compensation => Classification {
            strategy: RetryStrategy::ManualOnly,
            max_retries: 0,
            manual_review: true,
        },
    }
}

/// Delay before the next attempt after `retry_count` failed attempts.
pub fn backoff(strategy: RetryStrategy, retry_count: u32, cfg: &DlqConfig) -> Option<Duration> {
    let base = cfg.base_backoff_secs;
    let secs = match strategy {
        RetryStrategy::ManualOnly => return None,
        RetryStrategy::FixedInterval => base,
        RetryStrategy::ExponentialBackoff => {
            let factor = 1u64.checked_shl(retry_count.min(32)).unwrap_or(u64::MAX);
            base.saturating_mul(factor)
        }
    };
    Some(Duration::from_secs(secs.min(cfg.max_backoff_secs)))
}

// ---------------------------------------------------------------------------
// FailedOperation
// ---------------------------------------------------------------------------

fn default_schema_version() -> u32 {
    DLQ_SCHEMA_VERSION
}

/// One dead-lettered operation, persisted as its own JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedOperation {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub operation_id: String,
    pub operation_type: String,
    pub payload: serde_json::Value,
    pub error_type: ErrorKind,
    pub error_message: String,
    pub retry_count: u32,
    pub max_retries: u32,
    pub retry_strategy: RetryStrategy,
    pub manual_review: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
}

impl FailedOperation {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.manual_review && self.next_attempt_at.map_or(true, |t| t <= now)
    }

    pub fn budget_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Record a failed attempt and schedule the next one (or escalate).
    pub fn record_failure(
        &mut self,
        kind: ErrorKind,
        message: String,
        now: DateTime<Utc>,
        cfg: &DlqConfig,
    ) {
        self.retry_count += 1;
        self.last_attempt_at = Some(now);
        self.error_type = kind;
        self.error_message = message;
        // Errors that are not worth retrying escalate immediately even if
        // budget remains.
        if self.budget_exhausted() || !kind.is_retryable() {
            self.manual_review = true;
            self.next_attempt_at = None;
            return;
        }
        self.next_attempt_at = backoff(self.retry_strategy, self.retry_count, cfg)
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| now + d);
    }
}
