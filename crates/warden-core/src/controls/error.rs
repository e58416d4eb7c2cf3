//! Error types for the runtime-controls layer.

use thiserror::Error;

/// A failure produced by the wrapped unit of work itself.
///
/// The control layer never inspects the shape of a successful result, but it
/// does classify failures for retry purposes: an explicit hint from the
/// caller wins, otherwise the status code and message are consulted.
#[derive(Debug)]
pub struct WorkError {
    message: String,
    status_code: Option<u16>,
    retryable: Option<bool>,
    source: Option<anyhow::Error>,
}

impl WorkError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: None,
            retryable: None,
            source: None,
        }
    }

    /// Attach an HTTP-style status code (consulted by the default retry
    /// classification: 408, 429, and 5xx are treated as transient).
    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    /// Explicitly mark the failure retryable or fatal, overriding the
    /// status/message heuristics.
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }

    /// Shorthand for a failure that should be retried.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(message).with_retryable(true)
    }

    /// Shorthand for a failure that must not be retried.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(message).with_retryable(false)
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn status_code(&self) -> Option<u16> {
        self.status_code
    }

    /// The caller-supplied retryability hint, if any.
    pub fn retry_hint(&self) -> Option<bool> {
        self.retryable
    }
}

impl std::fmt::Display for WorkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for WorkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

impl From<anyhow::Error> for WorkError {
    fn from(error: anyhow::Error) -> Self {
        Self {
            message: error.to_string(),
            status_code: None,
            retryable: None,
            source: Some(error),
        }
    }
}

impl From<String> for WorkError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for WorkError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Failure taxonomy for wrapped calls.
///
/// Rejections (`PolicyViolation` through `LockContended`) are terminal and
/// never invoke the work; `TimeoutExceeded` and `Cancelled` interrupt an
/// in-flight invocation; `RetryExhausted` and `Underlying` carry failures
/// from the work itself.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("invalid controls configuration: {0}")]
    InvalidConfig(String),

    #[error("policy denied call to '{tool_name}': {reason}")]
    PolicyViolation { tool_name: String, reason: String },

    #[error("injection pattern '{pattern_id}' matched call to '{tool_name}'")]
    InjectionDetected {
        tool_name: String,
        pattern_id: String,
    },

    #[error("tool-call budget exhausted for run '{run_key}' ({max_calls} max calls)")]
    BudgetExceeded { run_key: String, max_calls: u32 },

    #[error("circuit breaker open for destination '{destination}'")]
    CircuitOpen { destination: String },

    #[error("repeated call pattern stopped for tool '{tool_name}' (seen {count} times)")]
    LoopDetected { tool_name: String, count: u32 },

    #[error("concurrency lock contended for '{key}'")]
    LockContended { key: String },

    #[error("call timed out after {timeout_ms}ms")]
    TimeoutExceeded { timeout_ms: u64 },

    #[error("call cancelled by caller")]
    Cancelled,

    #[error("call failed after {attempts} attempt(s): {source}")]
    RetryExhausted { attempts: u32, source: WorkError },

    #[error("call failed: {0}")]
    Underlying(WorkError),
}

impl ControlError {
    /// Stable machine-readable discriminant, used in event metadata.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlError::InvalidConfig(_) => "invalid_config",
            ControlError::PolicyViolation { .. } => "policy_violation",
            ControlError::InjectionDetected { .. } => "injection_detected",
            ControlError::BudgetExceeded { .. } => "budget_exceeded",
            ControlError::CircuitOpen { .. } => "circuit_open",
            ControlError::LoopDetected { .. } => "loop_detected",
            ControlError::LockContended { .. } => "lock_contended",
            ControlError::TimeoutExceeded { .. } => "timeout_exceeded",
            ControlError::Cancelled => "cancelled",
            ControlError::RetryExhausted { .. } => "retry_exhausted",
            ControlError::Underlying(_) => "underlying",
        }
    }

    /// Returns `true` for rejections decided before the work was invoked.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ControlError::PolicyViolation { .. }
                | ControlError::InjectionDetected { .. }
                | ControlError::BudgetExceeded { .. }
                | ControlError::CircuitOpen { .. }
                | ControlError::LoopDetected { .. }
                | ControlError::LockContended { .. }
        )
    }
}

/// Result type for control-layer operations.
pub type ControlResult<T> = std::result::Result<T, ControlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_error_builders() {
        let err = WorkError::new("gateway unavailable").with_status(503);
        assert_eq!(err.message(), "gateway unavailable");
        assert_eq!(err.status_code(), Some(503));
        assert_eq!(err.retry_hint(), None);

        assert_eq!(WorkError::transient("x").retry_hint(), Some(true));
        assert_eq!(WorkError::fatal("x").retry_hint(), Some(false));
    }

    #[test]
    fn work_error_from_anyhow_keeps_message() {
        let err: WorkError = anyhow::anyhow!("boom").into();
        assert_eq!(err.message(), "boom");
    }

    #[test]
    fn control_error_kind_and_rejection() {
        let err = ControlError::BudgetExceeded {
            run_key: "run-1".into(),
            max_calls: 5,
        };
        assert_eq!(err.kind(), "budget_exceeded");
        assert!(err.is_rejection());

        let err = ControlError::TimeoutExceeded { timeout_ms: 100 };
        assert!(!err.is_rejection());
    }
}
