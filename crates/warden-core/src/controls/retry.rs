//! Retry classification and backoff computation.
//!
//! The attempt loop itself lives in the orchestrator; this module decides
//! **whether** a work failure is worth retrying and **how long** to wait.

use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use super::config::RetrySettings;
use super::error::WorkError;

/// Failure messages that look transient when no explicit hint or status
/// code settles the question.
const TRANSIENT_MESSAGE_PATTERN: &str =
    r"(?i)timeout|timed out|connection reset|connection refused|unreachable|network|socket|rate limit|temporar";

/// Call metadata handed to a [`RetryClassifier`].
#[derive(Debug)]
pub struct RetryContext<'a> {
    pub tool_name: &'a str,
    pub run_key: &'a str,
    pub destination: Option<&'a str>,
    pub action: Option<&'a str>,
    /// 1-based attempt that just failed.
    pub attempt: u32,
    pub max_attempts: u32,
    pub error: &'a WorkError,
    /// What the built-in classification decided.
    pub default_retryable: bool,
}

/// A classifier's override for one failed attempt.
#[derive(Debug, Clone, Default)]
pub struct RetryDecision {
    pub retryable: bool,
    /// Pin the next delay instead of the computed backoff.
    pub delay_ms: Option<u64>,
    pub reason: Option<String>,
}

/// Caller-supplied override of the built-in retry classification. Returning
/// `None` keeps the default decision.
#[async_trait]
pub trait RetryClassifier: Send + Sync {
    async fn classify(&self, ctx: RetryContext<'_>) -> Option<RetryDecision>;
}

/// Decides retryability and computes backoff delays for one instance.
pub(crate) struct RetryPlanner {
    settings: RetrySettings,
    transient_message: Regex,
}

impl RetryPlanner {
    pub(crate) fn new(settings: RetrySettings) -> Self {
        Self {
            settings,
            // The pattern is a compile-time constant; it cannot fail.
            transient_message: Regex::new(TRANSIENT_MESSAGE_PATTERN)
                .expect("transient message pattern is valid"),
        }
    }

    pub(crate) fn max_attempts(&self) -> u32 {
        self.settings.max_attempts
    }

    /// Built-in classification: explicit hint, then status code
    /// (408/429/5xx), then transient-looking message.
    pub(crate) fn default_retryable(&self, error: &WorkError) -> bool {
        if let Some(hint) = error.retry_hint() {
            return hint;
        }
        if let Some(status) = error.status_code() {
            return status == 408 || status == 429 || status >= 500;
        }
        self.transient_message.is_match(error.message())
    }

    /// Backoff delay before the retry that follows `attempt` (1-based):
    /// `initial * factor^(attempt-1)`, capped, with deterministic jitter
    /// derived from the attempt number (golden-ratio hash, so no RNG state).
    pub(crate) fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let base = self.settings.initial_delay_ms as f64
            * self.settings.backoff_factor.powi(exponent as i32);
        let capped = match self.settings.max_delay_ms {
            Some(max) => base.min(max as f64),
            None => base,
        };

        let jitter = self.settings.jitter_ratio;
        if jitter <= 0.0 {
            return Duration::from_millis(capped.round() as u64);
        }

        let phase = (attempt as f64 * 0.618_033_988) % 1.0;
        let factor = 1.0 + jitter * (2.0 * phase - 1.0);
        Duration::from_millis((capped * factor).round().max(0.0) as u64)
    }
}
