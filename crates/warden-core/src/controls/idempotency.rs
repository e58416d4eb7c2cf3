//! Idempotency cache: replay cached results for repeated identical calls.
//!
//! Keys are computed from (tool name, run key, canonical arguments); only
//! successful results are cached. Expired entries are pruned on lookup.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};

use super::config::IdempotencySettings;

#[derive(Debug, Clone)]
struct CachedResult {
    run_key: String,
    value: Value,
    expires_at: Option<Instant>,
}

/// In-memory result cache, private to one `RuntimeControls` instance.
pub(crate) struct IdempotencyCache {
    settings: IdempotencySettings,
    entries: RwLock<HashMap<String, CachedResult>>,
}

impl IdempotencyCache {
    pub(crate) fn new(settings: IdempotencySettings) -> Self {
        Self {
            settings,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn enabled(&self) -> bool {
        self.settings.enabled
    }

    /// Return the cached result for `key` if present and unexpired.
    pub(crate) async fn lookup(&self, key: &str) -> Option<Value> {
        if !self.settings.enabled {
            return None;
        }

        let expired = {
            let entries = self.entries.read().await;
            match entries.get(key) {
                None => return None,
                Some(entry) => match entry.expires_at {
                    Some(at) if at <= Instant::now() => true,
                    _ => return Some(entry.value.clone()),
                },
            }
        };

        if expired {
            self.entries.write().await.remove(key);
        }
        None
    }

    /// Cache a successful result under `key`.
    pub(crate) async fn store(&self, key: String, run_key: &str, value: &Value) {
        if !self.settings.enabled {
            return;
        }

        let expires_at = self
            .settings
            .ttl_ms
            .map(|ttl| Instant::now() + Duration::from_millis(ttl));
        self.entries.write().await.insert(
            key,
            CachedResult {
                run_key: run_key.to_string(),
                value: value.clone(),
                expires_at,
            },
        );
    }

    /// Drop every entry scoped to `run_key`.
    pub(crate) async fn reset(&self, run_key: &str) {
        self.entries
            .write()
            .await
            .retain(|_, entry| entry.run_key != run_key);
    }
}
