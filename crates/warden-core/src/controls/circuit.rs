//! Per-destination circuit breakers.
//!
//! Closed admits calls and counts consecutive failures; at the threshold the
//! breaker opens and rejects everything until the cooldown elapses, after
//! which a single probe is admitted (half-open). The probe's outcome decides
//! between closing and re-opening. Health is keyed by destination, not by
//! run, so `reset(run_key)` never touches it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use super::config::CircuitSettings;

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Admission decision for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CircuitAdmission {
    /// Proceed. `probe` marks the single half-open trial call;
    /// `half_opened` is set when this admission performed the
    /// Open -> HalfOpen transition.
    Admit { probe: bool, half_opened: bool },
    Reject,
}

/// State change produced by recording an outcome, for event emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CircuitTransition {
    Opened { consecutive_failures: u32 },
    Closed,
}

#[derive(Debug)]
struct CircuitCore {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl CircuitCore {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.probe_in_flight = false;
    }
}

/// Keyed registry of breakers; one lock per destination.
pub(crate) struct CircuitRegistry {
    settings: CircuitSettings,
    breakers: RwLock<HashMap<String, Arc<Mutex<CircuitCore>>>>,
}

impl CircuitRegistry {
    pub(crate) fn new(settings: CircuitSettings) -> Self {
        Self {
            settings,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    async fn entry(&self, destination: &str) -> Arc<Mutex<CircuitCore>> {
        if let Some(entry) = self.breakers.read().await.get(destination) {
            return entry.clone();
        }
        let mut breakers = self.breakers.write().await;
        breakers
            .entry(destination.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(CircuitCore::new())))
            .clone()
    }

    /// Decide admission for one attempt against this destination.
    pub(crate) async fn before_attempt(&self, destination: &str) -> CircuitAdmission {
        if !self.settings.enabled {
            return CircuitAdmission::Admit {
                probe: false,
                half_opened: false,
            };
        }

        let entry = self.entry(destination).await;
        let mut core = entry.lock().await;
        match core.state {
            CircuitState::Closed => CircuitAdmission::Admit {
                probe: false,
                half_opened: false,
            },
            CircuitState::Open => {
                let cooled_down = core
                    .opened_at
                    .map(|at| at.elapsed() >= Duration::from_millis(self.settings.cooldown_ms))
                    .unwrap_or(true);
                if cooled_down {
                    core.state = CircuitState::HalfOpen;
                    core.probe_in_flight = true;
                    CircuitAdmission::Admit {
                        probe: true,
                        half_opened: true,
                    }
                } else {
                    CircuitAdmission::Reject
                }
            }
            CircuitState::HalfOpen => {
                if core.probe_in_flight {
                    CircuitAdmission::Reject
                } else {
                    core.probe_in_flight = true;
                    CircuitAdmission::Admit {
                        probe: true,
                        half_opened: false,
                    }
                }
            }
        }
    }

    /// Record a successful attempt. A successful probe closes the breaker.
    pub(crate) async fn record_success(
        &self,
        destination: &str,
        probe: bool,
    ) -> Option<CircuitTransition> {
        if !self.settings.enabled {
            return None;
        }

        let entry = self.entry(destination).await;
        let mut core = entry.lock().await;
        if probe {
            core.state = CircuitState::Closed;
            core.consecutive_failures = 0;
            core.opened_at = None;
            core.probe_in_flight = false;
            Some(CircuitTransition::Closed)
        } else {
            if core.state == CircuitState::Closed {
                core.consecutive_failures = 0;
            }
            None
        }
    }

    /// Record a failed attempt. A failed probe re-opens the breaker and
    /// restarts the cooldown; in the closed state the consecutive counter
    /// advances and opens the breaker at the threshold.
    pub(crate) async fn record_failure(
        &self,
        destination: &str,
        probe: bool,
    ) -> Option<CircuitTransition> {
        if !self.settings.enabled {
            return None;
        }

        let entry = self.entry(destination).await;
        let mut core = entry.lock().await;
        if probe {
            core.consecutive_failures = core.consecutive_failures.saturating_add(1);
            let failures = core.consecutive_failures;
            core.open();
            return Some(CircuitTransition::Opened {
                consecutive_failures: failures,
            });
        }

        match core.state {
            CircuitState::Closed => {
                core.consecutive_failures = core.consecutive_failures.saturating_add(1);
                if core.consecutive_failures >= self.settings.failure_threshold {
                    let failures = core.consecutive_failures;
                    core.open();
                    Some(CircuitTransition::Opened {
                        consecutive_failures: failures,
                    })
                } else {
                    None
                }
            }
            // A non-probe straggler finishing while open/half-open carries no
            // new information about recovery.
            CircuitState::Open | CircuitState::HalfOpen => None,
        }
    }

    /// Release a probe slot taken by `before_attempt` when the admitted call
    /// was rejected by a later pipeline stage and will never resolve.
    pub(crate) async fn abandon_probe(&self, destination: &str) {
        if !self.settings.enabled {
            return;
        }
        let entry = self.entry(destination).await;
        let mut core = entry.lock().await;
        if core.state == CircuitState::HalfOpen {
            core.probe_in_flight = false;
        }
    }

    /// Current state for a destination (closed if never seen).
    pub(crate) async fn state(&self, destination: &str) -> CircuitState {
        match self.breakers.read().await.get(destination) {
            Some(entry) => entry.lock().await.state,
            None => CircuitState::Closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(threshold: u32, cooldown_ms: u64) -> CircuitSettings {
        CircuitSettings {
            enabled: true,
            failure_threshold: threshold,
            cooldown_ms,
        }
    }

    #[tokio::test]
    async fn opens_after_consecutive_failures() {
        let reg = CircuitRegistry::new(settings(3, 60_000));
        assert!(reg.record_failure("api", false).await.is_none());
        assert!(reg.record_failure("api", false).await.is_none());
        assert!(matches!(
            reg.record_failure("api", false).await,
            Some(CircuitTransition::Opened {
                consecutive_failures: 3
            })
        ));
        assert_eq!(reg.state("api").await, CircuitState::Open);
        assert_eq!(reg.before_attempt("api").await, CircuitAdmission::Reject);
    }

    #[tokio::test]
    async fn success_resets_the_streak() {
        let reg = CircuitRegistry::new(settings(3, 60_000));
        reg.record_failure("api", false).await;
        reg.record_failure("api", false).await;
        reg.record_success("api", false).await;
        assert!(reg.record_failure("api", false).await.is_none());
        assert_eq!(reg.state("api").await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn destinations_are_independent() {
        let reg = CircuitRegistry::new(settings(1, 60_000));
        reg.record_failure("a", false).await;
        assert_eq!(reg.state("a").await, CircuitState::Open);
        assert_eq!(reg.state("b").await, CircuitState::Closed);
        assert!(matches!(
            reg.before_attempt("b").await,
            CircuitAdmission::Admit { probe: false, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_admits_single_probe() {
        let reg = CircuitRegistry::new(settings(1, 1_000));
        reg.record_failure("api", false).await;
        assert_eq!(reg.before_attempt("api").await, CircuitAdmission::Reject);

        tokio::time::advance(Duration::from_millis(1_100)).await;

        // First caller becomes the probe, second is rejected.
        assert_eq!(
            reg.before_attempt("api").await,
            CircuitAdmission::Admit {
                probe: true,
                half_opened: true
            }
        );
        assert_eq!(reg.state("api").await, CircuitState::HalfOpen);
        assert_eq!(reg.before_attempt("api").await, CircuitAdmission::Reject);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_success_closes() {
        let reg = CircuitRegistry::new(settings(1, 1_000));
        reg.record_failure("api", false).await;
        tokio::time::advance(Duration::from_millis(1_100)).await;
        reg.before_attempt("api").await;

        assert_eq!(
            reg.record_success("api", true).await,
            Some(CircuitTransition::Closed)
        );
        assert_eq!(reg.state("api").await, CircuitState::Closed);
        assert!(matches!(
            reg.before_attempt("api").await,
            CircuitAdmission::Admit { probe: false, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn probe_failure_reopens_with_fresh_cooldown() {
        let reg = CircuitRegistry::new(settings(1, 1_000));
        reg.record_failure("api", false).await;
        tokio::time::advance(Duration::from_millis(1_100)).await;
        reg.before_attempt("api").await;

        assert!(matches!(
            reg.record_failure("api", true).await,
            Some(CircuitTransition::Opened { .. })
        ));
        assert_eq!(reg.state("api").await, CircuitState::Open);
        assert_eq!(reg.before_attempt("api").await, CircuitAdmission::Reject);

        tokio::time::advance(Duration::from_millis(1_100)).await;
        assert!(matches!(
            reg.before_attempt("api").await,
            CircuitAdmission::Admit { probe: true, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_probe_frees_the_slot() {
        let reg = CircuitRegistry::new(settings(1, 1_000));
        reg.record_failure("api", false).await;
        tokio::time::advance(Duration::from_millis(1_100)).await;
        reg.before_attempt("api").await;

        reg.abandon_probe("api").await;
        assert!(matches!(
            reg.before_attempt("api").await,
            CircuitAdmission::Admit {
                probe: true,
                half_opened: false
            }
        ));
    }

    #[tokio::test]
    async fn disabled_breaker_admits_everything() {
        let reg = CircuitRegistry::new(CircuitSettings {
            enabled: false,
            ..CircuitSettings::default()
        });
        for _ in 0..10 {
            reg.record_failure("api", false).await;
        }
        assert!(matches!(
            reg.before_attempt("api").await,
            CircuitAdmission::Admit { probe: false, .. }
        ));
    }
}
