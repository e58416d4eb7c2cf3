mod common;

use std::sync::Arc;

use serde_json::json;

use common::{CollectingSink, FailingSink, ScriptedWork, Step};
use warden_core::{
    work_fn, CallDescriptor, ControlsConfig, EventKind, RuntimeControls, TracingSink,
};

fn config() -> ControlsConfig {
    let mut cfg = ControlsConfig::default();
    cfg.timeout_ms = 0;
    cfg.retry.max_attempts = 2;
    cfg.retry.initial_delay_ms = 1;
    cfg.retry.jitter_ratio = 0.0;
    cfg.circuit_breaker.enabled = false;
    cfg.loop_breaker.enabled = false;
    cfg
}

fn descriptor() -> CallDescriptor {
    CallDescriptor::new("fetch")
        .with_run_key("run-1")
        .with_destination("https://api.example.com/v2")
        .with_action("read_status")
}

#[tokio::test]
async fn events_carry_call_identity_and_metadata() {
    let sink = CollectingSink::new();
    let controls = RuntimeControls::new(config())
        .unwrap()
        .with_sink(sink.clone());
    let work = ScriptedWork::new(vec![
        Step::FailStatus("gateway hiccup", 502),
        Step::Return(json!({"ok": true})),
    ]);

    controls.run(&descriptor(), json!({}), work.as_ref()).await.unwrap();

    let events = sink.events();
    assert_eq!(events.len(), 1);
    let retry = &events[0];
    assert_eq!(retry.kind, EventKind::Retry);
    assert_eq!(retry.tool_name, "fetch");
    assert_eq!(retry.run_key, "run-1");
    assert_eq!(retry.destination.as_deref(), Some("api.example.com"));
    assert_eq!(retry.metadata["attempt"], json!(2));
    assert_eq!(retry.metadata["max_attempts"], json!(2));
    assert_eq!(retry.metadata["error"], json!("gateway hiccup"));
}

#[tokio::test]
async fn a_failing_sink_never_changes_the_outcome() {
    let sink = CollectingSink::new();
    let controls = RuntimeControls::new(config())
        .unwrap()
        .with_sink(Arc::new(FailingSink))
        .with_sink(sink.clone());
    let work = ScriptedWork::new(vec![
        Step::FailStatus("gateway hiccup", 502),
        Step::Return(json!({"value": 7})),
    ]);

    let result = controls
        .run(&descriptor(), json!({}), work.as_ref())
        .await
        .expect("sink failures are isolated");
    assert_eq!(result, json!({"value": 7}));

    // The healthy sink still saw the retry despite the failing one.
    assert_eq!(sink.count(EventKind::Retry), 1);
}

#[tokio::test]
async fn sinks_receive_events_in_registration_order() {
    let first = CollectingSink::new();
    let second = CollectingSink::new();
    let controls = RuntimeControls::new(config())
        .unwrap()
        .with_sink(first.clone())
        .with_sink(second.clone());
    let work = ScriptedWork::new(vec![
        Step::FailStatus("gateway hiccup", 502),
        Step::Return(json!({})),
    ]);

    controls.run(&descriptor(), json!({}), work.as_ref()).await.unwrap();
    assert_eq!(first.kinds(), second.kinds());
    assert_eq!(first.count(EventKind::Retry), 1);
}

#[tokio::test]
async fn rejections_emit_before_returning() {
    let mut cfg = config();
    cfg.max_tool_calls = Some(1);
    let sink = CollectingSink::new();
    let controls = RuntimeControls::new(cfg)
        .unwrap()
        .with_sink(sink.clone());
    let work = ScriptedWork::new(vec![]);

    controls.run(&descriptor(), json!({"n": 1}), work.as_ref()).await.unwrap();
    let err = controls
        .run(&descriptor(), json!({"n": 2}), work.as_ref())
        .await
        .expect_err("budget");

    // The budget-exceeded event was delivered before the error surfaced.
    assert_eq!(sink.count(EventKind::BudgetExceeded), 1);
    let event = sink
        .events()
        .into_iter()
        .find(|e| e.kind == EventKind::BudgetExceeded)
        .unwrap();
    assert!(event.message.contains("run-1"));
    assert_eq!(err.kind(), "budget_exceeded");
}

#[tokio::test]
async fn tracing_sink_accepts_every_event_kind() {
    let controls = RuntimeControls::new(config())
        .unwrap()
        .with_sink(Arc::new(TracingSink));
    let work = ScriptedWork::new(vec![
        Step::FailStatus("gateway hiccup", 502),
        Step::Return(json!({})),
    ]);

    controls
        .run(&descriptor(), json!({}), work.as_ref())
        .await
        .expect("tracing sink is passive");
}

#[tokio::test]
async fn event_timestamps_are_monotone_within_a_call() {
    let sink = CollectingSink::new();
    let mut cfg = config();
    cfg.retry.max_attempts = 3;
    let controls = RuntimeControls::new(cfg)
        .unwrap()
        .with_sink(sink.clone());
    let work = ScriptedWork::new(vec![
        Step::FailStatus("a", 502),
        Step::FailStatus("b", 502),
        Step::Return(json!({})),
    ]);

    controls.run(&descriptor(), json!({}), work.as_ref()).await.unwrap();
    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert!(events[0].timestamp <= events[1].timestamp);
}

#[tokio::test]
async fn closures_work_as_units_of_work() {
    let controls = RuntimeControls::new(config()).unwrap();
    let work = work_fn(|args, ctx| async move {
        assert_eq!(ctx.tool_name(), "fetch");
        assert_eq!(ctx.run_key(), "run-1");
        assert_eq!(ctx.attempt(), 1);
        assert!(!ctx.is_cancelled());
        Ok(json!({"echo": args}))
    });

    let result = controls
        .run(&descriptor(), json!({"q": 1}), &work)
        .await
        .unwrap();
    assert_eq!(result, json!({"echo": {"q": 1}}));
}

#[tokio::test]
async fn wrapped_tools_share_state_with_their_controls() {
    let mut cfg = config();
    cfg.max_tool_calls = Some(2);
    let controls = Arc::new(RuntimeControls::new(cfg).unwrap());
    let wrapped = controls.wrap(descriptor(), ScriptedWork::new(vec![]));

    wrapped.call(json!({"n": 1})).await.unwrap();
    wrapped.call(json!({"n": 2})).await.unwrap();
    let err = wrapped.call(json!({"n": 3})).await.expect_err("budget shared");
    assert_eq!(err.kind(), "budget_exceeded");
    assert_eq!(controls.budget_used("run-1").await, 2);
}
