//! Runtime configuration for the assignment workflow

use crate::JobStatus;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

/// Top-level workflow configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Status poller timing
    pub poller: PollerConfig,
    /// Markup applied when a `Pay` input does not carry one
    pub default_markup_percent: Decimal,
    /// Whether a confirmed client that already holds an active bundle may
    /// receive another (different) bundle
    pub allow_multiple_active: bool,
    /// Partition of partner status strings into terminal classes
    pub status_classification: StatusClassification,
    /// Backoff used by independent delivery retries
    pub delivery_retry: RetryPolicy,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            poller: PollerConfig::default(),
            default_markup_percent: Decimal::ZERO,
            allow_multiple_active: false,
            status_classification: StatusClassification::default(),
            delivery_retry: RetryPolicy::default(),
        }
    }
}

impl WorkflowConfig {
    /// Parse configuration from a JSON document; missing fields take defaults
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON configuration file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Reject configurations the poller or classifier cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poller.interval_ms == 0 {
            return Err(ConfigError::Invalid("poller.interval_ms must be positive".into()));
        }
        if self.poller.max_attempts == 0 {
            return Err(ConfigError::Invalid("poller.max_attempts must be positive".into()));
        }
        if let Some(status) = self.status_classification.overlap() {
            return Err(ConfigError::Invalid(
                format!("status `{status}` is classified as both success and failure").into(),
            ));
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    /// Not valid JSON for this schema
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    /// Parsed, but the values cannot be used
    #[error("invalid config: {0}")]
    Invalid(Box<str>),
}

/// Poll timing for one subscription
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Delay between the end of one fetch and the start of the next
    pub interval_ms: u64,
    /// Total fetches (including the immediate one) before timing out
    pub max_attempts: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            max_attempts: 60,
        }
    }
}

impl PollerConfig {
    /// Poll interval as a [`Duration`]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Where a partner status sits in the job lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusClass {
    /// Still moving; keep polling
    InFlight,
    /// Provisioned and usable
    TerminalSuccess,
    /// Partner reports the job will never succeed
    TerminalFailure,
}

impl StatusClass {
    /// Success or failure
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InFlight)
    }
}

/// Classification table for partner status strings.
///
/// Matching is case-insensitive. Anything in neither set is in-flight.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusClassification {
    /// Statuses meaning the eSIM is ready
    pub success: BTreeSet<String>,
    /// Statuses meaning the job will never succeed
    pub failure: BTreeSet<String>,
}

impl Default for StatusClassification {
    fn default() -> Self {
        Self {
            success: ["ready", "active", "activated"]
                .into_iter()
                .map(String::from)
                .collect(),
            failure: ["failed", "cancelled", "canceled", "expired"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl StatusClassification {
    /// Class of `status`, ignoring case
    pub fn classify(&self, status: &JobStatus) -> StatusClass {
        let raw = status.as_str();
        if self.success.iter().any(|s| s.eq_ignore_ascii_case(raw)) {
            StatusClass::TerminalSuccess
        } else if self.failure.iter().any(|s| s.eq_ignore_ascii_case(raw)) {
            StatusClass::TerminalFailure
        } else {
            StatusClass::InFlight
        }
    }

    fn overlap(&self) -> Option<&str> {
        self.success
            .iter()
            .find(|s| self.failure.iter().any(|f| f.eq_ignore_ascii_case(s)))
            .map(String::as_str)
    }
}

/// Retry policy for independently retryable operations
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    pub max_attempts: u32,
    /// Initial delay before first retry (milliseconds)
    pub initial_delay_millis: u64,
    /// Maximum delay cap (milliseconds)
    pub max_delay_millis: u64,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_millis: 1000,
            max_delay_millis: 30000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Calculate delay for a given attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::from_millis(0);
        }

        let delay = self.initial_delay_millis as f64
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = delay.min(self.max_delay_millis as f64);
        Duration::from_millis(capped as u64)
    }
}
