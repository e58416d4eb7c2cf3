//! Keyed concurrency locks for in-flight calls.
//!
//! One `tokio::sync::Mutex` per lock key; the owned guard travels with the
//! call and is released by drop on every exit path — success, failure,
//! timeout, and cancellation alike.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::{timeout, Duration};

use super::config::{LockScope, LockSettings};

/// Held for the duration of one wrapped call. Dropping it releases the key.
pub(crate) struct LockLease {
    _guard: Option<OwnedMutexGuard<()>>,
}

impl LockLease {
    fn unlocked() -> Self {
        Self { _guard: None }
    }
}

/// Outcome of a non-blocking acquisition attempt.
pub(crate) enum TryAcquire {
    Acquired(LockLease),
    /// The key is held by another in-flight call.
    Contended,
}

/// Outcome of waiting for a contended key.
pub(crate) enum WaitAcquire {
    Acquired(LockLease),
    /// `wait_timeout_ms` elapsed before the holder released the key.
    TimedOut,
}

/// Keyed lock table for one `RuntimeControls` instance.
pub(crate) struct LockManager {
    settings: LockSettings,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LockManager {
    pub(crate) fn new(settings: LockSettings) -> Self {
        Self {
            settings,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn settings(&self) -> &LockSettings {
        &self.settings
    }

    /// The lock key for a call, per the configured scope.
    pub(crate) fn key_for(&self, run_key: &str, tool_name: &str, destination: &str) -> String {
        match self.settings.scope {
            LockScope::RunTool => format!("run:{run_key}:tool:{tool_name}"),
            LockScope::Destination => format!("dest:{destination}"),
        }
    }

    async fn slot(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Attempt the key without waiting.
    pub(crate) async fn try_acquire(&self, key: &str) -> TryAcquire {
        if !self.settings.enabled {
            return TryAcquire::Acquired(LockLease::unlocked());
        }
        let slot = self.slot(key).await;
        match slot.try_lock_owned() {
            Ok(guard) => TryAcquire::Acquired(LockLease {
                _guard: Some(guard),
            }),
            Err(_) => TryAcquire::Contended,
        }
    }

    /// Wait for a contended key, bounded by `wait_timeout_ms` when set.
    pub(crate) async fn wait_acquire(&self, key: &str) -> WaitAcquire {
        if !self.settings.enabled {
            return WaitAcquire::Acquired(LockLease::unlocked());
        }
        let slot = self.slot(key).await;
        let guard = match self.settings.wait_timeout_ms {
            Some(wait_ms) => {
                match timeout(Duration::from_millis(wait_ms), slot.lock_owned()).await {
                    Ok(guard) => guard,
                    Err(_) => return WaitAcquire::TimedOut,
                }
            }
            None => slot.lock_owned().await,
        };
        WaitAcquire::Acquired(LockLease {
            _guard: Some(guard),
        })
    }

    /// Drop lock slots nobody currently holds. Called from `reset` to keep
    /// the table from accumulating keys of finished runs.
    pub(crate) async fn prune_unheld(&self) {
        let mut locks = self.locks.lock().await;
        locks.retain(|_, slot| slot.try_lock().is_err() || Arc::strong_count(slot) > 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controls::config::LockWaitMode;

    fn settings() -> LockSettings {
        LockSettings {
            enabled: true,
            scope: LockScope::RunTool,
            wait_mode: LockWaitMode::Wait,
            wait_timeout_ms: Some(100),
        }
    }

    #[tokio::test]
    async fn try_acquire_detects_contention() {
        let mgr = LockManager::new(settings());
        let first = mgr.try_acquire("k").await;
        assert!(matches!(first, TryAcquire::Acquired(_)));
        assert!(matches!(mgr.try_acquire("k").await, TryAcquire::Contended));

        drop(first);
        assert!(matches!(mgr.try_acquire("k").await, TryAcquire::Acquired(_)));
    }

    #[tokio::test]
    async fn distinct_keys_do_not_contend() {
        let mgr = LockManager::new(settings());
        let _a = mgr.try_acquire("a").await;
        assert!(matches!(mgr.try_acquire("b").await, TryAcquire::Acquired(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_acquire_times_out() {
        let mgr = LockManager::new(settings());
        let _held = mgr.try_acquire("k").await;
        assert!(matches!(mgr.wait_acquire("k").await, WaitAcquire::TimedOut));
    }

    #[tokio::test]
    async fn wait_acquire_succeeds_after_release() {
        let mgr = Arc::new(LockManager::new(settings()));
        let lease = match mgr.try_acquire("k").await {
            TryAcquire::Acquired(lease) => lease,
            TryAcquire::Contended => panic!("fresh key should acquire"),
        };

        let waiter = {
            let mgr = mgr.clone();
            tokio::spawn(async move { matches!(mgr.wait_acquire("k").await, WaitAcquire::Acquired(_)) })
        };

        tokio::task::yield_now().await;
        drop(lease);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn scope_determines_key() {
        let mgr = LockManager::new(settings());
        assert_eq!(mgr.key_for("r", "t", "d"), "run:r:tool:t");

        let mgr = LockManager::new(LockSettings {
            scope: LockScope::Destination,
            ..settings()
        });
        assert_eq!(mgr.key_for("r", "t", "d"), "dest:d");
    }

    #[tokio::test]
    async fn disabled_manager_never_contends() {
        let mgr = LockManager::new(LockSettings {
            enabled: false,
            ..settings()
        });
        let _a = mgr.try_acquire("k").await;
        assert!(matches!(mgr.try_acquire("k").await, TryAcquire::Acquired(_)));
    }

    #[tokio::test]
    async fn prune_keeps_held_slots() {
        let mgr = LockManager::new(settings());
        let _held = mgr.try_acquire("held").await;
        let released = mgr.try_acquire("released").await;
        drop(released);

        mgr.prune_unheld().await;
        assert_eq!(mgr.locks.lock().await.len(), 1);
        assert!(mgr.locks.lock().await.contains_key("held"));
    }
}
