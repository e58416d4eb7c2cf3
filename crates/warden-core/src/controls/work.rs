//! The unit-of-work contract and per-call context.

use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::error::WorkError;

/// Static metadata describing a wrapped call site.
///
/// The run key scopes budgets, loop detection, locks, and idempotency to one
/// logical agent run; the destination scopes circuit-breaker health.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallDescriptor {
    pub tool_name: String,
    #[serde(default)]
    pub run_key: Option<String>,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
}

impl CallDescriptor {
    pub fn new(tool_name: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            run_key: None,
            destination: None,
            action: None,
        }
    }

    pub fn with_run_key(mut self, run_key: impl Into<String>) -> Self {
        self.run_key = Some(run_key.into());
        self
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }
}

/// Normalize a caller-supplied run key: trimmed, empty -> "default".
pub(crate) fn normalize_run_key(run_key: Option<&str>) -> String {
    match run_key {
        Some(key) => {
            let trimmed = key.trim();
            if trimmed.is_empty() {
                "default".to_string()
            } else {
                trimmed.to_string()
            }
        }
        None => "default".to_string(),
    }
}

/// Handed to the unit of work on every attempt. Carries the cancellation
/// signal the work is expected to observe; a work that ignores it is still
/// abandoned when the deadline fires, it just cannot clean up after itself.
#[derive(Debug, Clone)]
pub struct CallContext {
    call_id: String,
    tool_name: String,
    run_key: String,
    attempt: u32,
    cancellation: CancellationToken,
}

impl CallContext {
    pub(crate) fn new(
        call_id: String,
        tool_name: String,
        run_key: String,
        attempt: u32,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            call_id,
            tool_name,
            run_key,
            attempt,
            cancellation,
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn tool_name(&self) -> &str {
        &self.tool_name
    }

    pub fn run_key(&self) -> &str {
        &self.run_key
    }

    /// 1-based attempt number within the retry sequence.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The cancellation signal for this call. Cancelled on timeout or
    /// caller-initiated cancellation.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// An asynchronous unit of work wrapped by the control layer.
///
/// The layer never inspects a successful result beyond cloning it into the
/// idempotency cache; failures are classified for retry via [`WorkError`].
#[async_trait]
pub trait ToolWork: Send + Sync {
    async fn call(&self, args: Value, ctx: CallContext) -> Result<Value, WorkError>;
}

/// Adapter turning an async closure into a [`ToolWork`].
pub struct WorkFn<F>(F);

#[async_trait]
impl<F, Fut> ToolWork for WorkFn<F>
where
    F: Fn(Value, CallContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, WorkError>> + Send,
{
    async fn call(&self, args: Value, ctx: CallContext) -> Result<Value, WorkError> {
        (self.0)(args, ctx).await
    }
}

/// Wrap an async closure as a unit of work.
///
/// ```ignore
/// let work = work_fn(|args, _ctx| async move { Ok(args) });
/// ```
pub fn work_fn<F, Fut>(f: F) -> WorkFn<F>
where
    F: Fn(Value, CallContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, WorkError>> + Send,
{
    WorkFn(f)
}

/// Final classification of one wrapped call, for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Success,
    /// Rejected by a guardrail before the work ran.
    Rejected,
    Failed,
    TimedOut,
    Cancelled,
}

/// One attempted invocation, finalized at completion. Retained transiently
/// and surfaced through tracing; never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct CallRecord {
    pub call_id: String,
    pub tool_name: String,
    pub run_key: String,
    pub destination: Option<String>,
    pub action: Option<String>,
    pub args_digest: String,
    pub started_at: DateTime<Utc>,
    pub attempts: u32,
    pub outcome: CallOutcome,
    pub duration_ms: u64,
}

pub(crate) fn new_call_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn run_key_normalization() {
        assert_eq!(normalize_run_key(None), "default");
        assert_eq!(normalize_run_key(Some("  ")), "default");
        assert_eq!(normalize_run_key(Some(" run-7 ")), "run-7");
    }

    #[test]
    fn descriptor_builder() {
        let desc = CallDescriptor::new("shell")
            .with_run_key("run-1")
            .with_destination("https://sandbox.internal")
            .with_action("run_tests");
        assert_eq!(desc.tool_name, "shell");
        assert_eq!(desc.run_key.as_deref(), Some("run-1"));
        assert_eq!(desc.action.as_deref(), Some("run_tests"));
    }

    #[tokio::test]
    async fn work_fn_adapts_closures() {
        let work = work_fn(|args, _ctx| async move { Ok(args) });
        let ctx = CallContext::new(
            new_call_id(),
            "echo".into(),
            "default".into(),
            1,
            CancellationToken::new(),
        );
        let out = work.call(json!({"x": 1}), ctx).await.unwrap();
        assert_eq!(out, json!({"x": 1}));
    }

    #[test]
    fn call_ids_are_unique() {
        assert_ne!(new_call_id(), new_call_id());
    }
}
