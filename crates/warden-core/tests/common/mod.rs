//! Shared scripted work and event-collection helpers for integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex as AsyncMutex;

use warden_core::{CallContext, ControlEvent, EventKind, EventSink, ToolWork, WorkError};

/// One scripted behavior for a single invocation of the work.
#[derive(Clone)]
pub enum Step {
    Return(Value),
    /// Fail with a bare message (classified by message heuristics).
    Fail(&'static str),
    /// Fail with a status code (classified by status).
    FailStatus(&'static str, u16),
    /// Fail with an explicit non-retryable hint.
    FailFatal(&'static str),
    /// Sleep, then return `{"ok": true}`.
    Sleep(u64),
    /// Never complete (ignores cancellation; the controller abandons it).
    Hang,
}

/// Work that replays a fixed list of steps, one per invocation, and counts
/// how many times it was actually called.
pub struct ScriptedWork {
    steps: AsyncMutex<Vec<Step>>,
    calls: AtomicUsize,
}

impl ScriptedWork {
    pub fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: AsyncMutex::new(steps),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn ok() -> Arc<Self> {
        Self::new(vec![Step::Return(json!({"ok": true}))])
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolWork for ScriptedWork {
    async fn call(&self, _args: Value, _ctx: CallContext) -> Result<Value, WorkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = {
            let mut steps = self.steps.lock().await;
            if steps.is_empty() {
                Step::Return(json!({"ok": true}))
            } else {
                steps.remove(0)
            }
        };

        match step {
            Step::Return(value) => Ok(value),
            Step::Fail(message) => Err(WorkError::new(message)),
            Step::FailStatus(message, status) => Err(WorkError::new(message).with_status(status)),
            Step::FailFatal(message) => Err(WorkError::fatal(message)),
            Step::Sleep(ms) => {
                tokio::time::sleep(tokio::time::Duration::from_millis(ms)).await;
                Ok(json!({"ok": true}))
            }
            Step::Hang => {
                std::future::pending::<()>().await;
                Ok(Value::Null)
            }
        }
    }
}

/// Sink that records every event it sees.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<ControlEvent>>,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ControlEvent> {
        self.events.lock().expect("sink poisoned").clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events().iter().map(|e| e.kind).collect()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.kinds().into_iter().filter(|k| *k == kind).count()
    }
}

#[async_trait]
impl EventSink for CollectingSink {
    async fn on_event(&self, event: &ControlEvent) -> anyhow::Result<()> {
        self.events.lock().expect("sink poisoned").push(event.clone());
        Ok(())
    }
}

/// Sink that always fails, for isolation tests.
pub struct FailingSink;

#[async_trait]
impl EventSink for FailingSink {
    async fn on_event(&self, _event: &ControlEvent) -> anyhow::Result<()> {
        anyhow::bail!("sink is down")
    }
}
