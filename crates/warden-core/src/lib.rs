//! Warden Core Library
//!
//! Runtime guardrails for autonomous agent tool calls: wraps an arbitrary
//! async unit of work with a fixed pipeline of policy, budget,
//! loop-detection, circuit-breaker, idempotency, locking, timeout, and
//! retry controls.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use serde_json::json;
//! use warden_core::{work_fn, CallDescriptor, ControlsConfig, RuntimeControls};
//!
//! let controls = Arc::new(RuntimeControls::new(ControlsConfig::default())?);
//! let descriptor = CallDescriptor::new("http-fetch")
//!     .with_run_key("run-42")
//!     .with_destination("https://api.example.com");
//!
//! let work = work_fn(|args, _ctx| async move { Ok(args) });
//! let result = controls.run(&descriptor, json!({"q": "status"}), &work).await?;
//! ```

pub mod controls;
pub mod telemetry;

pub use controls::{
    work_fn, ApprovalHandler, ApprovalRequest, CallContext, CallDescriptor, CallOutcome,
    CallRecord, CircuitSettings, CircuitState, ControlError, ControlEvent, ControlResult,
    ControlsConfig, EventKind, EventSink, IdempotencySettings, InjectionPattern,
    InjectionSettings, LockScope, LockSettings, LockWaitMode, LoopSettings, PolicyAction,
    PolicyMode, PolicyRule, PolicySettings, RetryClassifier, RetryContext, RetryDecision,
    RetrySettings, RuntimeControls, ToolWork, TracingSink, WorkError, WorkFn, WrappedTool,
};

pub use telemetry::init_tracing;

/// Warden version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
