//! Loop detection over repeated call signatures.
//!
//! A signature identifies "the same call" (tool + canonical arguments);
//! repetitions are counted per run key with three escalating thresholds.
//! Counts survive everything except an explicit run reset — a new signature
//! never resets other signatures' counts.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use super::config::LoopSettings;

/// What the detector decided for one observed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopVerdict {
    Proceed,
    /// At or past the warning threshold; call proceeds.
    Warn { count: u32 },
    /// At or past the quarantine threshold; call is delayed, then proceeds.
    Quarantine { count: u32 },
    /// At or past the stop threshold; call is rejected.
    Stop { count: u32 },
}

#[derive(Debug)]
struct SignatureState {
    count: u32,
    last_seen: Instant,
}

#[derive(Debug, Default)]
struct RunSignatures {
    by_signature: HashMap<String, SignatureState>,
}

/// Per-run signature repetition tracker.
pub(crate) struct LoopDetector {
    settings: LoopSettings,
    runs: RwLock<HashMap<String, Arc<Mutex<RunSignatures>>>>,
}

impl LoopDetector {
    pub(crate) fn new(settings: LoopSettings) -> Self {
        Self {
            settings,
            runs: RwLock::new(HashMap::new()),
        }
    }

    async fn entry(&self, run_key: &str) -> Arc<Mutex<RunSignatures>> {
        if let Some(entry) = self.runs.read().await.get(run_key) {
            return entry.clone();
        }
        let mut runs = self.runs.write().await;
        runs.entry(run_key.to_string()).or_default().clone()
    }

    /// Count one observation of `signature` in pipeline order and return the
    /// verdict for this call.
    pub(crate) async fn observe(&self, run_key: &str, signature: &str) -> LoopVerdict {
        if !self.settings.enabled {
            return LoopVerdict::Proceed;
        }

        let entry = self.entry(run_key).await;
        let mut run = entry.lock().await;
        let now = Instant::now();

        if !run.by_signature.contains_key(signature)
            && run.by_signature.len() >= self.settings.max_signatures
        {
            evict_oldest(&mut run.by_signature);
        }

        let state = run
            .by_signature
            .entry(signature.to_string())
            .or_insert(SignatureState {
                count: 0,
                last_seen: now,
            });
        state.count = state.count.saturating_add(1);
        state.last_seen = now;
        let count = state.count;

        if count >= self.settings.stop_threshold {
            LoopVerdict::Stop { count }
        } else if count >= self.settings.quarantine_threshold {
            LoopVerdict::Quarantine { count }
        } else if count >= self.settings.warning_threshold {
            LoopVerdict::Warn { count }
        } else {
            LoopVerdict::Proceed
        }
    }

    pub(crate) fn quarantine_delay_ms(&self) -> u64 {
        self.settings.quarantine_delay_ms
    }

    /// Drop all signatures for a run key.
    pub(crate) async fn reset(&self, run_key: &str) {
        self.runs.write().await.remove(run_key);
    }
}

fn evict_oldest(by_signature: &mut HashMap<String, SignatureState>) {
    let oldest = by_signature
        .iter()
        .min_by_key(|(_, state)| state.last_seen)
        .map(|(signature, _)| signature.clone());
    if let Some(signature) = oldest {
        by_signature.remove(&signature);
    }
}
