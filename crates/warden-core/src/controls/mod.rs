//! Runtime controls: a composable guardrail pipeline for agent tool calls.
//!
//! Wraps an arbitrary asynchronous unit of work with safety and reliability
//! policies that compose in a fixed order, each able to short-circuit
//! execution, each keyed by run or destination identity, all safe under
//! concurrent invocation.
//!
//! # Modules
//!
//! - [`config`]      — `ControlsConfig` and per-component settings
//! - [`error`]       — `ControlError` taxonomy + `WorkError`
//! - [`event`]       — `ControlEvent`, `EventSink`, fan-out
//! - [`work`]        — `ToolWork` contract, `CallDescriptor`, `CallContext`
//! - [`budget`]      — per-run call budgets
//! - [`retry`]       — retry classification and backoff
//! - [`circuit`]     — per-destination circuit breakers
//! - [`loop_detect`] — call-pattern repetition analysis
//! - [`policy`]      — policy gate rules and approval flow
//! - [`injection`]   — argument content inspection
//! - [`idempotency`] — cached-result replay
//! - [`lock`]        — keyed concurrency locks
//! - [`runtime`]     — the `RuntimeControls` orchestrator

pub mod budget;
pub mod circuit;
pub mod config;
pub mod error;
pub mod event;
pub(crate) mod fingerprint;
pub mod idempotency;
pub mod injection;
pub mod lock;
pub mod loop_detect;
pub mod policy;
pub mod retry;
pub mod runtime;
pub mod work;

pub use circuit::CircuitState;
pub use config::{
    CircuitSettings, ControlsConfig, IdempotencySettings, InjectionPattern, InjectionSettings,
    LockScope, LockSettings, LockWaitMode, LoopSettings, PolicySettings, RetrySettings,
};
pub use error::{ControlError, ControlResult, WorkError};
pub use event::{ControlEvent, EventKind, EventSink, TracingSink};
pub use policy::{ApprovalHandler, ApprovalRequest, PolicyAction, PolicyMode, PolicyRule};
pub use retry::{RetryClassifier, RetryContext, RetryDecision};
pub use runtime::{RuntimeControls, WrappedTool};
pub use work::{
    work_fn, CallContext, CallDescriptor, CallOutcome, CallRecord, ToolWork, WorkFn,
};
