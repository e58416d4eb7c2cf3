//! Control events and sink fan-out.
//!
//! Every guardrail decision that matters to an observer is emitted as a
//! [`ControlEvent`] through an ordered list of [`EventSink`]s. A failing
//! sink is logged and skipped; it can never change the outcome of the
//! wrapped call.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

/// Event vocabulary of the control layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Retry,
    BudgetWarning,
    BudgetExceeded,
    CircuitOpen,
    CircuitHalfOpen,
    CircuitClosed,
    LoopWarning,
    LoopQuarantine,
    LoopStop,
    PolicyViolation,
    InjectionDetected,
    LockContended,
    IdempotentHit,
    Timeout,
    Cancelled,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Retry => "retry",
            EventKind::BudgetWarning => "budget-warning",
            EventKind::BudgetExceeded => "budget-exceeded",
            EventKind::CircuitOpen => "circuit-open",
            EventKind::CircuitHalfOpen => "circuit-half-open",
            EventKind::CircuitClosed => "circuit-closed",
            EventKind::LoopWarning => "loop-warning",
            EventKind::LoopQuarantine => "loop-quarantine",
            EventKind::LoopStop => "loop-stop",
            EventKind::PolicyViolation => "policy-violation",
            EventKind::InjectionDetected => "injection-detected",
            EventKind::LockContended => "lock-contended",
            EventKind::IdempotentHit => "idempotent-hit",
            EventKind::Timeout => "timeout",
            EventKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A structured control event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlEvent {
    pub kind: EventKind,
    pub message: String,
    pub tool_name: String,
    pub run_key: String,
    pub destination: Option<String>,
    /// Kind-specific details (attempt numbers, thresholds, pattern ids...).
    pub metadata: Value,
    pub timestamp: DateTime<Utc>,
}

impl ControlEvent {
    pub fn new(
        kind: EventKind,
        message: impl Into<String>,
        tool_name: impl Into<String>,
        run_key: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            tool_name: tool_name.into(),
            run_key: run_key.into(),
            destination: None,
            metadata: Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn with_destination(mut self, destination: Option<String>) -> Self {
        self.destination = destination;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Receives control events. Sinks are invoked in registration order and
/// awaited inline so observers see events before the call returns.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn on_event(&self, event: &ControlEvent) -> anyhow::Result<()>;
}

/// Built-in sink that logs every event through `tracing` with structured
/// fields.
pub struct TracingSink;

#[async_trait]
impl EventSink for TracingSink {
    async fn on_event(&self, event: &ControlEvent) -> anyhow::Result<()> {
        info!(
            event = event.kind.as_str(),
            tool_name = %event.tool_name,
            run_key = %event.run_key,
            destination = event.destination.as_deref().unwrap_or(""),
            message = %event.message,
        );
        Ok(())
    }
}

/// Ordered fan-out over the configured sinks.
#[derive(Default)]
pub(crate) struct EventFanout {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl EventFanout {
    pub(crate) fn push(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }

    /// Deliver the event to every sink. Failures are logged and do not stop
    /// delivery to later sinks.
    pub(crate) async fn emit(&self, event: ControlEvent) {
        for (index, sink) in self.sinks.iter().enumerate() {
            if let Err(error) = sink.on_event(&event).await {
                warn!(
                    event = event.kind.as_str(),
                    sink_index = index,
                    error = %error,
                    "event sink failed; continuing",
                );
            }
        }
    }

}
