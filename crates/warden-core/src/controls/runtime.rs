//! The orchestrator: composes every guardrail around one wrapped call.
//!
//! Pipeline order is fixed: policy gate -> injection guard -> idempotency
//! lookup -> lock acquisition -> budget check -> circuit check -> loop
//! check -> deadline/retry-wrapped invocation -> idempotency write (success
//! only). Any rejecting stage short-circuits the rest and the work is never
//! invoked. Every terminal rejection emits its event before returning.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, Instrument};

use super::budget::BudgetTracker;
use super::circuit::{CircuitAdmission, CircuitRegistry, CircuitState, CircuitTransition};
use super::config::{ControlsConfig, LockWaitMode};
use super::error::{ControlError, ControlResult, WorkError};
use super::event::{ControlEvent, EventFanout, EventKind, EventSink};
use super::fingerprint::{args_digest, idempotency_key, loop_signature};
use super::idempotency::IdempotencyCache;
use super::injection::InjectionGuard;
use super::lock::{LockLease, LockManager, TryAcquire, WaitAcquire};
use super::loop_detect::{LoopDetector, LoopVerdict};
use super::policy::{
    match_rule, normalize_destination, ApprovalHandler, ApprovalRequest, PolicyAction, PolicyMode,
};
use super::retry::{RetryClassifier, RetryContext, RetryPlanner};
use super::work::{
    new_call_id, normalize_run_key, CallContext, CallDescriptor, CallOutcome, CallRecord, ToolWork,
};

/// Resolved identity of one call, shared by every pipeline stage.
struct CallMeta {
    call_id: String,
    tool_name: String,
    run_key: String,
    /// Normalized destination host, when the descriptor named one.
    destination: Option<String>,
    /// Circuit/lock key: the normalized host, or "default".
    dest_key: String,
    action: Option<String>,
}

/// A guardrail/resilience layer wrapping arbitrary async units of work.
///
/// All mutable state (budgets, breakers, loop signatures, locks, cached
/// results) is private to one instance; independently configured instances
/// can coexist in one process.
pub struct RuntimeControls {
    config: ControlsConfig,
    budgets: BudgetTracker,
    circuits: CircuitRegistry,
    loops: LoopDetector,
    locks: LockManager,
    idempotency: IdempotencyCache,
    injection: InjectionGuard,
    retry: RetryPlanner,
    sinks: EventFanout,
    approval: Option<Arc<dyn ApprovalHandler>>,
    classifier: Option<Arc<dyn RetryClassifier>>,
}

impl std::fmt::Debug for RuntimeControls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeControls")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RuntimeControls {
    /// Validate the configuration and build an instance.
    pub fn new(config: ControlsConfig) -> ControlResult<Self> {
        config.validate()?;
        let injection = InjectionGuard::new(&config.injection_guard)?;

        Ok(Self {
            budgets: BudgetTracker::new(config.max_tool_calls, config.budget_warning_ratio),
            circuits: CircuitRegistry::new(config.circuit_breaker.clone()),
            loops: LoopDetector::new(config.loop_breaker.clone()),
            locks: LockManager::new(config.concurrency),
            idempotency: IdempotencyCache::new(config.idempotency),
            retry: RetryPlanner::new(config.retry.clone()),
            injection,
            sinks: EventFanout::default(),
            approval: None,
            classifier: None,
            config,
        })
    }

    /// Append an event sink. Sinks are invoked in registration order.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Attach the handler consulted for `require_approval` policy verdicts.
    pub fn with_approval_handler(mut self, handler: Arc<dyn ApprovalHandler>) -> Self {
        self.approval = Some(handler);
        self
    }

    /// Attach a retry-classification override.
    pub fn with_retry_classifier(mut self, classifier: Arc<dyn RetryClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn config(&self) -> &ControlsConfig {
        &self.config
    }

    /// Current breaker state for a destination (normalized like descriptor
    /// destinations are).
    pub async fn circuit_state(&self, destination: &str) -> CircuitState {
        self.circuits.state(&normalize_destination(destination)).await
    }

    /// Calls admitted so far against the budget of `run_key`.
    pub async fn budget_used(&self, run_key: &str) -> u32 {
        self.budgets.used(&normalize_run_key(Some(run_key))).await
    }

    /// Clear run-scoped state: budget counter, loop signatures, and cached
    /// idempotent results. Circuit-breaker health is destination-scoped and
    /// untouched.
    pub async fn reset(&self, run_key: &str) {
        let run_key = normalize_run_key(Some(run_key));
        self.budgets.reset(&run_key).await;
        self.loops.reset(&run_key).await;
        self.idempotency.reset(&run_key).await;
        self.locks.prune_unheld().await;
    }

    /// Run one call through the full pipeline.
    pub async fn run(
        &self,
        descriptor: &CallDescriptor,
        args: Value,
        work: &dyn ToolWork,
    ) -> ControlResult<Value> {
        self.run_with_cancellation(descriptor, args, CancellationToken::new(), work)
            .await
    }

    /// Like [`run`](Self::run), with a caller-owned cancellation token.
    /// Cancelling it fails the call with `Cancelled` and releases its lock.
    pub async fn run_with_cancellation(
        &self,
        descriptor: &CallDescriptor,
        args: Value,
        cancellation: CancellationToken,
        work: &dyn ToolWork,
    ) -> ControlResult<Value> {
        if descriptor.tool_name.trim().is_empty() {
            return Err(ControlError::InvalidConfig(
                "descriptor.tool_name must not be empty".to_string(),
            ));
        }

        let destination = descriptor.destination.as_deref().map(normalize_destination);
        let meta = CallMeta {
            call_id: new_call_id(),
            tool_name: descriptor.tool_name.clone(),
            run_key: normalize_run_key(descriptor.run_key.as_deref()),
            dest_key: destination.clone().unwrap_or_else(|| "default".to_string()),
            destination,
            action: descriptor.action.clone(),
        };

        let started = tokio::time::Instant::now();
        let started_at = chrono::Utc::now();
        let digest = args_digest(&args);

        let span = tracing::debug_span!(
            "warden.call",
            call_id = %meta.call_id,
            tool_name = %meta.tool_name,
            run_key = %meta.run_key,
        );
        let (result, attempts) = self
            .pipeline(&meta, args, cancellation, work)
            .instrument(span)
            .await;

        let outcome = match &result {
            Ok(_) => CallOutcome::Success,
            Err(ControlError::TimeoutExceeded { .. }) => CallOutcome::TimedOut,
            Err(ControlError::Cancelled) => CallOutcome::Cancelled,
            Err(e) if e.is_rejection() => CallOutcome::Rejected,
            Err(_) => CallOutcome::Failed,
        };
        let record = CallRecord {
            call_id: meta.call_id,
            tool_name: meta.tool_name,
            run_key: meta.run_key,
            destination: meta.destination,
            action: meta.action,
            args_digest: digest,
            started_at,
            attempts,
            outcome,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        debug!(
            call_id = %record.call_id,
            tool_name = %record.tool_name,
            run_key = %record.run_key,
            outcome = ?record.outcome,
            attempts = record.attempts,
            duration_ms = record.duration_ms,
            "call finished",
        );

        result
    }

    /// Build a reusable wrapped handle around a unit of work.
    pub fn wrap(self: &Arc<Self>, descriptor: CallDescriptor, work: Arc<dyn ToolWork>) -> WrappedTool {
        WrappedTool {
            controls: Arc::clone(self),
            descriptor,
            work,
        }
    }

    async fn emit(&self, kind: EventKind, message: String, meta: &CallMeta, metadata: Value) {
        let event = ControlEvent::new(kind, message, meta.tool_name.clone(), meta.run_key.clone())
            .with_destination(meta.destination.clone())
            .with_metadata(metadata);
        self.sinks.emit(event).await;
    }

    /// The pipeline proper. Returns the result plus the number of attempts
    /// actually made (0 when no work was invoked).
    async fn pipeline(
        &self,
        meta: &CallMeta,
        args: Value,
        cancellation: CancellationToken,
        work: &dyn ToolWork,
    ) -> (ControlResult<Value>, u32) {
        if let Err(err) = self.enforce_policy(meta, &args).await {
            return (Err(err), 0);
        }

        if let Some(found) = self.injection.scan(
            &meta.tool_name,
            meta.action.as_deref(),
            meta.destination.as_deref(),
            &args,
        ) {
            self.emit(
                EventKind::InjectionDetected,
                format!(
                    "injection pattern '{}' matched call to '{}'",
                    found.pattern_id, meta.tool_name
                ),
                meta,
                json!({
                    "pattern_id": found.pattern_id,
                    "matched_text": found.matched_text,
                }),
            )
            .await;
            return (
                Err(ControlError::InjectionDetected {
                    tool_name: meta.tool_name.clone(),
                    pattern_id: found.pattern_id,
                }),
                0,
            );
        }

        let idem_key = self
            .idempotency
            .enabled()
            .then(|| idempotency_key(&meta.tool_name, &meta.run_key, &args));
        if let Some(key) = &idem_key {
            if let Some(value) = self.idempotency.lookup(key).await {
                self.emit(
                    EventKind::IdempotentHit,
                    format!("replayed cached result for '{}'", meta.tool_name),
                    meta,
                    json!({ "key": key }),
                )
                .await;
                return (Ok(value), 0);
            }
        }

        // Held until this function returns; drop releases on every path.
        let _lease = match self.acquire_lock(meta).await {
            Ok(lease) => lease,
            Err(err) => return (Err(err), 0),
        };

        match self.budgets.check_and_increment(&meta.run_key).await {
            Ok(charge) => {
                if let Some(used) = charge.warn_at {
                    let max = self.budgets.ceiling().unwrap_or(0);
                    self.emit(
                        EventKind::BudgetWarning,
                        format!("run '{}' used {used} of {max} tool calls", meta.run_key),
                        meta,
                        json!({ "used": used, "max_tool_calls": max }),
                    )
                    .await;
                }
            }
            Err(err) => {
                self.emit(
                    EventKind::BudgetExceeded,
                    err.to_string(),
                    meta,
                    json!({ "max_tool_calls": self.budgets.ceiling() }),
                )
                .await;
                return (Err(err), 0);
            }
        }

        let mut probe = match self.admit_circuit(meta).await {
            Ok(probe) => probe,
            Err(err) => return (Err(err), 0),
        };

        let signature = loop_signature(&meta.tool_name, &args);
        match self.loops.observe(&meta.run_key, &signature).await {
            LoopVerdict::Proceed => {}
            LoopVerdict::Warn { count } => {
                self.emit(
                    EventKind::LoopWarning,
                    format!(
                        "call pattern for '{}' repeated {count} times",
                        meta.tool_name
                    ),
                    meta,
                    json!({ "count": count, "signature": signature }),
                )
                .await;
            }
            LoopVerdict::Quarantine { count } => {
                let delay_ms = self.loops.quarantine_delay_ms();
                self.emit(
                    EventKind::LoopQuarantine,
                    format!(
                        "call pattern for '{}' repeated {count} times; delaying {delay_ms}ms",
                        meta.tool_name
                    ),
                    meta,
                    json!({ "count": count, "delay_ms": delay_ms, "signature": signature }),
                )
                .await;
                tokio::select! {
                    biased;
                    _ = cancellation.cancelled() => {
                        if probe {
                            self.circuits.abandon_probe(&meta.dest_key).await;
                        }
                        self.emit(
                            EventKind::Cancelled,
                            format!("call to '{}' cancelled by caller", meta.tool_name),
                            meta,
                            json!({ "phase": "quarantine" }),
                        )
                        .await;
                        return (Err(ControlError::Cancelled), 0);
                    }
                    _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                }
            }
            LoopVerdict::Stop { count } => {
                if probe {
                    self.circuits.abandon_probe(&meta.dest_key).await;
                }
                self.emit(
                    EventKind::LoopStop,
                    format!(
                        "call pattern for '{}' repeated {count} times; stopping",
                        meta.tool_name
                    ),
                    meta,
                    json!({ "count": count, "signature": signature }),
                )
                .await;
                return (
                    Err(ControlError::LoopDetected {
                        tool_name: meta.tool_name.clone(),
                        count,
                    }),
                    0,
                );
            }
        }

        // Invocation phase: one deadline covers all attempts and backoffs.
        let timeout_ms = self.config.timeout_ms;
        let deadline =
            (timeout_ms > 0).then(|| tokio::time::Instant::now() + Duration::from_millis(timeout_ms));
        let child = cancellation.child_token();
        let max_attempts = self.retry.max_attempts();
        let mut attempt: u32 = 0;

        enum Attempt {
            Done(Result<Value, WorkError>),
            DeadlineExpired,
            Cancelled,
        }

        loop {
            attempt += 1;
            if attempt > 1 {
                probe = match self.admit_circuit(meta).await {
                    Ok(probe) => probe,
                    Err(err) => return (Err(err), attempt - 1),
                };
            }

            let ctx = CallContext::new(
                meta.call_id.clone(),
                meta.tool_name.clone(),
                meta.run_key.clone(),
                attempt,
                child.clone(),
            );

            let outcome = tokio::select! {
                biased;
                _ = cancellation.cancelled() => Attempt::Cancelled,
                _ = deadline_sleep(deadline) => Attempt::DeadlineExpired,
                result = work.call(args.clone(), ctx) => Attempt::Done(result),
            };

            match outcome {
                Attempt::Cancelled => {
                    child.cancel();
                    self.record_circuit_failure(meta, probe).await;
                    self.emit(
                        EventKind::Cancelled,
                        format!("call to '{}' cancelled by caller", meta.tool_name),
                        meta,
                        json!({ "attempt": attempt }),
                    )
                    .await;
                    return (Err(ControlError::Cancelled), attempt);
                }
                Attempt::DeadlineExpired => {
                    child.cancel();
                    self.record_circuit_failure(meta, probe).await;
                    self.emit(
                        EventKind::Timeout,
                        format!("call to '{}' timed out after {timeout_ms}ms", meta.tool_name),
                        meta,
                        json!({ "timeout_ms": timeout_ms, "attempt": attempt }),
                    )
                    .await;
                    return (Err(ControlError::TimeoutExceeded { timeout_ms }), attempt);
                }
                Attempt::Done(Ok(value)) => {
                    if let Some(CircuitTransition::Closed) =
                        self.circuits.record_success(&meta.dest_key, probe).await
                    {
                        self.emit(
                            EventKind::CircuitClosed,
                            format!("circuit for '{}' closed after successful probe", meta.dest_key),
                            meta,
                            json!({ "destination": meta.dest_key }),
                        )
                        .await;
                    }
                    if let Some(key) = idem_key {
                        self.idempotency.store(key, &meta.run_key, &value).await;
                    }
                    return (Ok(value), attempt);
                }
                Attempt::Done(Err(error)) => {
                    self.record_circuit_failure(meta, probe).await;

                    let default_retryable = self.retry.default_retryable(&error);
                    let decision = match &self.classifier {
                        Some(classifier) => {
                            classifier
                                .classify(RetryContext {
                                    tool_name: &meta.tool_name,
                                    run_key: &meta.run_key,
                                    destination: meta.destination.as_deref(),
                                    action: meta.action.as_deref(),
                                    attempt,
                                    max_attempts,
                                    error: &error,
                                    default_retryable,
                                })
                                .await
                        }
                        None => None,
                    };
                    let (retryable, pinned_delay_ms, reason) = match decision {
                        Some(d) => (d.retryable, d.delay_ms, d.reason),
                        None => (default_retryable, None, None),
                    };

                    if !retryable {
                        return (Err(ControlError::Underlying(error)), attempt);
                    }
                    if attempt >= max_attempts {
                        return (
                            Err(ControlError::RetryExhausted {
                                attempts: attempt,
                                source: error,
                            }),
                            attempt,
                        );
                    }

                    let delay = pinned_delay_ms
                        .map(Duration::from_millis)
                        .unwrap_or_else(|| self.retry.backoff_delay(attempt));
                    self.emit(
                        EventKind::Retry,
                        format!(
                            "retrying '{}' (attempt {}/{max_attempts}) after {}ms",
                            meta.tool_name,
                            attempt + 1,
                            delay.as_millis(),
                        ),
                        meta,
                        json!({
                            "attempt": attempt + 1,
                            "max_attempts": max_attempts,
                            "delay_ms": delay.as_millis() as u64,
                            "error": error.message(),
                            "classifier_reason": reason,
                        }),
                    )
                    .await;

                    tokio::select! {
                        biased;
                        _ = cancellation.cancelled() => {
                            child.cancel();
                            self.emit(
                                EventKind::Cancelled,
                                format!("call to '{}' cancelled by caller", meta.tool_name),
                                meta,
                                json!({ "phase": "backoff", "attempt": attempt }),
                            )
                            .await;
                            return (Err(ControlError::Cancelled), attempt);
                        }
                        _ = deadline_sleep(deadline) => {
                            child.cancel();
                            self.emit(
                                EventKind::Timeout,
                                format!("call to '{}' timed out after {timeout_ms}ms", meta.tool_name),
                                meta,
                                json!({ "timeout_ms": timeout_ms, "phase": "backoff" }),
                            )
                            .await;
                            return (Err(ControlError::TimeoutExceeded { timeout_ms }), attempt);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Evaluate the policy gate for one call.
    async fn enforce_policy(&self, meta: &CallMeta, args: &Value) -> ControlResult<()> {
        let policy = &self.config.policy;
        if !policy.enabled || policy.rules.is_empty() {
            return Ok(());
        }

        let Some(rule) = match_rule(
            &policy.rules,
            &meta.tool_name,
            meta.destination.as_deref(),
            meta.action.as_deref(),
        ) else {
            return Ok(());
        };

        if rule.action == PolicyAction::Allow {
            return Ok(());
        }

        let reason = rule.effective_reason().to_string();

        if policy.mode == PolicyMode::DryRun {
            self.emit(
                EventKind::PolicyViolation,
                format!("policy rule '{}' matched (dry run): {reason}", rule.id),
                meta,
                json!({
                    "rule_id": rule.id,
                    "dry_run": true,
                    "simulated_action": rule.action,
                }),
            )
            .await;
            return Ok(());
        }

        if rule.action == PolicyAction::Deny {
            self.emit(
                EventKind::PolicyViolation,
                format!("policy rule '{}' denied call: {reason}", rule.id),
                meta,
                json!({ "rule_id": rule.id, "dry_run": false }),
            )
            .await;
            return Err(ControlError::PolicyViolation {
                tool_name: meta.tool_name.clone(),
                reason,
            });
        }

        // RequireApproval: without a handler this is a denial.
        let approved = match &self.approval {
            Some(handler) => {
                let request = ApprovalRequest {
                    rule_id: rule.id.clone(),
                    tool_name: meta.tool_name.clone(),
                    run_key: meta.run_key.clone(),
                    destination: meta.destination.clone(),
                    action: meta.action.clone(),
                    reason: reason.clone(),
                    args: args.clone(),
                };
                handler.approve(&request).await
            }
            None => false,
        };

        if approved {
            debug!(
                rule_id = %rule.id,
                tool_name = %meta.tool_name,
                "call approved by policy handler",
            );
            return Ok(());
        }

        let reason = if self.approval.is_none() {
            format!("approval required but no handler configured: {reason}")
        } else {
            format!("approval denied: {reason}")
        };
        self.emit(
            EventKind::PolicyViolation,
            format!("policy rule '{}' blocked call: {reason}", rule.id),
            meta,
            json!({ "rule_id": rule.id, "dry_run": false, "approval": true }),
        )
        .await;
        Err(ControlError::PolicyViolation {
            tool_name: meta.tool_name.clone(),
            reason,
        })
    }

    /// Acquire the concurrency lock per the configured mode, emitting
    /// `lock-contended` whenever the key was held on arrival.
    async fn acquire_lock(&self, meta: &CallMeta) -> ControlResult<LockLease> {
        let key = self
            .locks
            .key_for(&meta.run_key, &meta.tool_name, &meta.dest_key);
        // A disabled manager always yields an empty lease here.
        match self.locks.try_acquire(&key).await {
            TryAcquire::Acquired(lease) => Ok(lease),
            TryAcquire::Contended => {
                let mode = self.locks.settings().wait_mode;
                self.emit(
                    EventKind::LockContended,
                    format!("lock '{key}' is already held"),
                    meta,
                    json!({ "key": key, "mode": mode }),
                )
                .await;

                match mode {
                    LockWaitMode::Reject => Err(ControlError::LockContended { key }),
                    LockWaitMode::Wait => match self.locks.wait_acquire(&key).await {
                        WaitAcquire::Acquired(lease) => Ok(lease),
                        WaitAcquire::TimedOut => {
                            self.emit(
                                EventKind::LockContended,
                                format!("gave up waiting for lock '{key}'"),
                                meta,
                                json!({
                                    "key": key,
                                    "mode": mode,
                                    "wait_timed_out": true,
                                    "wait_timeout_ms": self.locks.settings().wait_timeout_ms,
                                }),
                            )
                            .await;
                            Err(ControlError::LockContended { key })
                        }
                    },
                }
            }
        }
    }

    /// Check the breaker for one attempt, emitting transition/rejection
    /// events. Returns whether this attempt is the half-open probe.
    async fn admit_circuit(&self, meta: &CallMeta) -> ControlResult<bool> {
        match self.circuits.before_attempt(&meta.dest_key).await {
            CircuitAdmission::Admit { probe, half_opened } => {
                if half_opened {
                    self.emit(
                        EventKind::CircuitHalfOpen,
                        format!("circuit for '{}' half-open; admitting probe", meta.dest_key),
                        meta,
                        json!({ "destination": meta.dest_key }),
                    )
                    .await;
                }
                Ok(probe)
            }
            CircuitAdmission::Reject => {
                self.emit(
                    EventKind::CircuitOpen,
                    format!("circuit for '{}' is open; call rejected", meta.dest_key),
                    meta,
                    json!({ "destination": meta.dest_key, "rejected": true }),
                )
                .await;
                Err(ControlError::CircuitOpen {
                    destination: meta.dest_key.clone(),
                })
            }
        }
    }

    async fn record_circuit_failure(&self, meta: &CallMeta, probe: bool) {
        if let Some(CircuitTransition::Opened {
            consecutive_failures,
        }) = self.circuits.record_failure(&meta.dest_key, probe).await
        {
            self.emit(
                EventKind::CircuitOpen,
                format!(
                    "circuit for '{}' opened after {consecutive_failures} consecutive failures",
                    meta.dest_key
                ),
                meta,
                json!({
                    "destination": meta.dest_key,
                    "consecutive_failures": consecutive_failures,
                    "cooldown_ms": self.config.circuit_breaker.cooldown_ms,
                }),
            )
            .await;
        }
    }
}

async fn deadline_sleep(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

/// A reusable handle produced by [`RuntimeControls::wrap`]. Cloning shares
/// the underlying controls instance and unit of work.
#[derive(Clone)]
pub struct WrappedTool {
    controls: Arc<RuntimeControls>,
    descriptor: CallDescriptor,
    work: Arc<dyn ToolWork>,
}

impl WrappedTool {
    pub fn descriptor(&self) -> &CallDescriptor {
        &self.descriptor
    }

    /// Run the wrapped work through the full pipeline.
    pub async fn call(&self, args: Value) -> ControlResult<Value> {
        self.controls
            .run(&self.descriptor, args, self.work.as_ref())
            .await
    }

    /// Like [`call`](Self::call), with a caller-owned cancellation token.
    pub async fn call_with_cancellation(
        &self,
        args: Value,
        cancellation: CancellationToken,
    ) -> ControlResult<Value> {
        self.controls
            .run_with_cancellation(&self.descriptor, args, cancellation, self.work.as_ref())
            .await
    }
}
