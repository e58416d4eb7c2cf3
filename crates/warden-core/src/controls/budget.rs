//! Per-run tool-call budgets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;

use super::error::{ControlError, ControlResult};

#[derive(Default)]
struct RunBudget {
    used: AtomicU32,
    warned: AtomicBool,
}

/// Result of a successful budget charge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BudgetCharge {
    pub used: u32,
    /// Set exactly once per run, when usage first crosses the warning ratio.
    pub warn_at: Option<u32>,
}

/// Tracks admitted calls per run key against a fixed ceiling.
///
/// Admission is a CAS loop on a per-run atomic, so two calls racing toward
/// an almost-exhausted budget can never both be admitted. Unrelated run keys
/// share nothing but the outer map.
pub(crate) struct BudgetTracker {
    max_calls: Option<u32>,
    warning_ratio: f64,
    runs: RwLock<HashMap<String, Arc<RunBudget>>>,
}

impl BudgetTracker {
    pub(crate) fn new(max_calls: Option<u32>, warning_ratio: f64) -> Self {
        Self {
            max_calls,
            warning_ratio,
            runs: RwLock::new(HashMap::new()),
        }
    }

    async fn entry(&self, run_key: &str) -> Arc<RunBudget> {
        if let Some(entry) = self.runs.read().await.get(run_key) {
            return entry.clone();
        }
        let mut runs = self.runs.write().await;
        runs.entry(run_key.to_string()).or_default().clone()
    }

    /// Admit and count one call, or reject with `BudgetExceeded` once the
    /// ceiling is reached. The work is never invoked for a rejected call.
    pub(crate) async fn check_and_increment(&self, run_key: &str) -> ControlResult<BudgetCharge> {
        let entry = self.entry(run_key).await;

        let Some(max) = self.max_calls else {
            let used = entry.used.fetch_add(1, Ordering::AcqRel) + 1;
            return Ok(BudgetCharge {
                used,
                warn_at: None,
            });
        };

        loop {
            let current = entry.used.load(Ordering::Acquire);
            if current >= max {
                return Err(ControlError::BudgetExceeded {
                    run_key: run_key.to_string(),
                    max_calls: max,
                });
            }
            if entry
                .used
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let used = current + 1;
                let crossed = (used as f64) >= self.warning_ratio * (max as f64);
                let warn_at = if crossed && !entry.warned.swap(true, Ordering::AcqRel) {
                    Some(used)
                } else {
                    None
                };
                return Ok(BudgetCharge { used, warn_at });
            }
        }
    }

    pub(crate) fn ceiling(&self) -> Option<u32> {
        self.max_calls
    }

    /// Calls admitted so far for a run key.
    pub(crate) async fn used(&self, run_key: &str) -> u32 {
        match self.runs.read().await.get(run_key) {
            Some(entry) => entry.used.load(Ordering::Acquire),
            None => 0,
        }
    }

    /// Drop all budget state for a run key.
    pub(crate) async fn reset(&self, run_key: &str) {
        self.runs.write().await.remove(run_key);
    }
}
