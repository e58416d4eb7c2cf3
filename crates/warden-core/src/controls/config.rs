//! Configuration for a `RuntimeControls` instance.
//!
//! Configuration is immutable once an instance is constructed; changing any
//! setting means building a new instance. All settings structs are plain
//! serde-able data so callers can load them from files or embed them in
//! larger configs. Runtime hooks (event sinks, approval handlers, retry
//! classifiers) are not part of this data and are attached via builder
//! methods on `RuntimeControls`.

use serde::{Deserialize, Serialize};

use super::error::{ControlError, ControlResult};
use super::policy::{PolicyMode, PolicyRule};

/// Retry/backoff parameters for the wrapped invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts, including the first (1 = no retries).
    pub max_attempts: u32,
    /// Delay before the first retry (milliseconds).
    pub initial_delay_ms: u64,
    /// Multiplier applied to the delay after each retry.
    pub backoff_factor: f64,
    /// Upper bound on any single delay; `None` = uncapped.
    pub max_delay_ms: Option<u64>,
    /// Jitter amplitude as a fraction of the delay (0 = deterministic).
    pub jitter_ratio: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay_ms: 250,
            backoff_factor: 2.0,
            max_delay_ms: Some(10_000),
            jitter_ratio: 0.2,
        }
    }
}

/// Per-destination circuit breaker parameters.
///
/// Failure counting is consecutive; the counter resets on any success.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitSettings {
    pub enabled: bool,
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// Time the breaker stays open before admitting a probe (milliseconds).
    pub cooldown_ms: u64,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            cooldown_ms: 60_000,
        }
    }
}

/// Loop-detection thresholds, strictly ordered warning < quarantine < stop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoopSettings {
    pub enabled: bool,
    /// Repetitions at which a warning event is emitted.
    pub warning_threshold: u32,
    /// Repetitions at which calls are delayed before proceeding.
    pub quarantine_threshold: u32,
    /// Repetitions at which calls are rejected outright.
    pub stop_threshold: u32,
    /// Fixed delay applied to quarantined calls (milliseconds).
    pub quarantine_delay_ms: u64,
    /// Maximum distinct signatures tracked per run; the oldest-seen entry is
    /// evicted beyond this.
    pub max_signatures: usize,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            warning_threshold: 5,
            quarantine_threshold: 8,
            stop_threshold: 12,
            quarantine_delay_ms: 1_000,
            max_signatures: 200,
        }
    }
}

/// A named injection pattern. The id is what appears in events and errors;
/// the raw matched text is withheld unless explicitly enabled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InjectionPattern {
    pub id: String,
    /// Regular expression source, compiled at construction.
    pub pattern: String,
}

impl InjectionPattern {
    pub fn new(id: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            pattern: pattern.into(),
        }
    }
}

/// Injection-guard settings. An empty pattern list selects the built-in
/// default set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InjectionSettings {
    pub enabled: bool,
    pub patterns: Vec<InjectionPattern>,
    /// Include the matched text in events. Off by default so sensitive
    /// argument content does not leak into logs.
    pub report_matched_text: bool,
}

impl Default for InjectionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            patterns: Vec::new(),
            report_matched_text: false,
        }
    }
}

/// Policy-gate settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PolicySettings {
    pub enabled: bool,
    pub mode: PolicyMode,
    pub rules: Vec<PolicyRule>,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: PolicyMode::Enforce,
            rules: Vec::new(),
        }
    }
}

/// Idempotency-cache settings. Keys are computed from
/// (tool name, run key, canonical arguments).
///
/// Disabled by default: with automatic keying, an always-on cache would
/// serve repeated identical calls before the loop detector ever saw them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IdempotencySettings {
    pub enabled: bool,
    /// Entry time-to-live; `None` = entries never expire.
    pub ttl_ms: Option<u64>,
}

impl Default for IdempotencySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_ms: None,
        }
    }
}

/// What a concurrency lock is keyed by.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LockScope {
    /// One in-flight call per (run key, tool name).
    RunTool,
    /// One in-flight call per destination.
    Destination,
}

/// Behavior when a lock is already held.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LockWaitMode {
    /// Suspend until the lock is released (bounded by `wait_timeout_ms`).
    Wait,
    /// Fail immediately with `LockContended`.
    Reject,
}

/// Concurrency-lock settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LockSettings {
    pub enabled: bool,
    pub scope: LockScope,
    pub wait_mode: LockWaitMode,
    /// Upper bound on lock waits in `Wait` mode; `None` = unbounded.
    pub wait_timeout_ms: Option<u64>,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            scope: LockScope::RunTool,
            wait_mode: LockWaitMode::Wait,
            wait_timeout_ms: Some(30_000),
        }
    }
}

/// Top-level configuration for one `RuntimeControls` instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControlsConfig {
    /// Per-run ceiling on admitted tool calls; `None` = unlimited.
    pub max_tool_calls: Option<u32>,
    /// Fraction of the budget at which a one-shot warning event fires.
    pub budget_warning_ratio: f64,
    /// Deadline for the whole invocation phase, attempts and backoff sleeps
    /// included (milliseconds); 0 disables the deadline.
    pub timeout_ms: u64,
    pub retry: RetrySettings,
    pub circuit_breaker: CircuitSettings,
    pub loop_breaker: LoopSettings,
    pub injection_guard: InjectionSettings,
    pub policy: PolicySettings,
    pub idempotency: IdempotencySettings,
    pub concurrency: LockSettings,
}

impl Default for ControlsConfig {
    fn default() -> Self {
        Self {
            max_tool_calls: None,
            budget_warning_ratio: 0.8,
            timeout_ms: 60_000,
            retry: RetrySettings::default(),
            circuit_breaker: CircuitSettings::default(),
            loop_breaker: LoopSettings::default(),
            injection_guard: InjectionSettings::default(),
            policy: PolicySettings::default(),
            idempotency: IdempotencySettings::default(),
            concurrency: LockSettings::default(),
        }
    }
}

impl ControlsConfig {
    /// Validate cross-field invariants. Regex compilation for the injection
    /// guard happens separately when the guard is built.
    pub fn validate(&self) -> ControlResult<()> {
        if let Some(max) = self.max_tool_calls {
            if max == 0 {
                return Err(invalid("max_tool_calls must be at least 1 when set"));
            }
        }

        if !self.budget_warning_ratio.is_finite()
            || self.budget_warning_ratio <= 0.0
            || self.budget_warning_ratio > 1.0
        {
            return Err(invalid("budget_warning_ratio must be in (0, 1]"));
        }

        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts must be at least 1"));
        }
        if !self.retry.backoff_factor.is_finite() || self.retry.backoff_factor < 1.0 {
            return Err(invalid("retry.backoff_factor must be at least 1.0"));
        }
        if !self.retry.jitter_ratio.is_finite()
            || self.retry.jitter_ratio < 0.0
            || self.retry.jitter_ratio >= 1.0
        {
            return Err(invalid("retry.jitter_ratio must be in [0, 1)"));
        }

        if self.circuit_breaker.enabled {
            if self.circuit_breaker.failure_threshold == 0 {
                return Err(invalid("circuit_breaker.failure_threshold must be at least 1"));
            }
            if self.circuit_breaker.cooldown_ms == 0 {
                return Err(invalid("circuit_breaker.cooldown_ms must be positive"));
            }
        }

        if self.loop_breaker.enabled {
            let lb = &self.loop_breaker;
            if lb.warning_threshold == 0 {
                return Err(invalid("loop_breaker.warning_threshold must be at least 1"));
            }
            if !(lb.warning_threshold < lb.quarantine_threshold
                && lb.quarantine_threshold < lb.stop_threshold)
            {
                return Err(invalid(
                    "loop_breaker thresholds must be strictly ordered: warning < quarantine < stop",
                ));
            }
            if lb.max_signatures == 0 {
                return Err(invalid("loop_breaker.max_signatures must be at least 1"));
            }
        }

        if self.concurrency.enabled {
            if let Some(wait_ms) = self.concurrency.wait_timeout_ms {
                if wait_ms == 0 {
                    return Err(invalid("concurrency.wait_timeout_ms must be positive when set"));
                }
            }
        }

        if let Some(ttl) = self.idempotency.ttl_ms {
            if ttl == 0 {
                return Err(invalid("idempotency.ttl_ms must be positive when set"));
            }
        }

        Ok(())
    }
}

fn invalid(message: &str) -> ControlError {
    ControlError::InvalidConfig(message.to_string())
}
