// Orchestrator: events, debouncing and debugging across worker threads

use pattern_lang::{
    native, Arity, ErrorCode, Event, ExtensionRegistry, MemoryProvider, Orchestrator,
    OrchestratorConfig, PatternValue, ProviderId, RunState, RunStatus,
};
use std::collections::BTreeMap;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);

fn orchestrator(auto_evaluate: bool, debounce_ms: u64) -> Orchestrator {
    let mut shared = ExtensionRegistry::with_std();
    shared.freeze();
    let config = OrchestratorConfig {
        auto_evaluate,
        debounce_ms,
        worker_threads: 2,
        ..OrchestratorConfig::default()
    };
    Orchestrator::new(config, Arc::new(shared)).unwrap()
}

fn provider(data: &[u8]) -> Arc<MemoryProvider> {
    Arc::new(MemoryProvider::new(data.to_vec()))
}

fn event_provider(event: &Event) -> ProviderId {
    match event {
        Event::EvaluationStarted { provider }
        | Event::EvaluationFinished { provider, .. }
        | Event::PatternsChanged { provider }
        | Event::SectionsChanged { provider }
        | Event::HighlightingChanged { provider }
        | Event::ParseFinished { provider, .. }
        | Event::BreakpointHit { provider, .. } => *provider,
    }
}

/// Next event for `id`, skipping other providers'
fn next_for(rx: &Receiver<Event>, id: ProviderId) -> Event {
    loop {
        let event = rx.recv_timeout(TIMEOUT).expect("timed out waiting for an event");
        if event_provider(&event) == id {
            return event;
        }
    }
}

fn wait_finished(rx: &Receiver<Event>, id: ProviderId) -> RunStatus {
    loop {
        if let Event::EvaluationFinished { status, .. } = next_for(rx, id) {
            return status;
        }
    }
}

#[test]
fn test_execute_publishes_events_in_order() {
    let orch = orchestrator(false, 1000);
    let rx = orch.subscribe();
    let id = orch.attach(provider(&[1, 2, 3, 4]));

    orch.execute(id, "u32 x @ 0;", Vec::new(), BTreeMap::new()).unwrap();

    assert!(matches!(next_for(&rx, id), Event::EvaluationStarted { .. }));
    assert!(matches!(
        next_for(&rx, id),
        Event::EvaluationFinished {
            status: RunStatus::Success,
            ..
        }
    ));
    assert!(matches!(next_for(&rx, id), Event::PatternsChanged { .. }));
    assert!(matches!(next_for(&rx, id), Event::SectionsChanged { .. }));
    assert!(matches!(next_for(&rx, id), Event::HighlightingChanged { .. }));

    let value = orch
        .with_runtime(id, |rt| rt.pattern_by_name("x").map(|p| p.value.clone()))
        .unwrap();
    assert_eq!(value, Some(PatternValue::Unsigned(0x04030201)));
}

#[test]
fn test_compile_failure_does_not_touch_patterns() {
    let orch = orchestrator(false, 1000);
    let rx = orch.subscribe();
    let id = orch.attach(provider(&[0; 4]));

    orch.execute(id, "u32 x @ ;", Vec::new(), BTreeMap::new()).unwrap();
    assert_eq!(wait_finished(&rx, id), RunStatus::CompileFailed);
    orch.wait_idle(id).unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    let errors = orch.with_runtime(id, |rt| rt.compile_errors().len()).unwrap();
    assert!(errors > 0);
}

#[test]
fn test_source_changes_are_debounced() {
    let orch = orchestrator(false, 50);
    let rx = orch.subscribe();
    let id = orch.attach(provider(&[0; 4]));

    orch.source_changed(id, "u8 a @ 0;").unwrap();
    orch.source_changed(id, "u8 a @ 0; u8 b @ 1;").unwrap();
    orch.source_changed(id, "u8 a @ 0; u8 b @ 1; u8 c @ ;").unwrap();

    match next_for(&rx, id) {
        Event::ParseFinished { errors, .. } => assert!(!errors.is_empty()),
        other => panic!("expected a parse result, got {:?}", other),
    }
    // One parse for the burst and no evaluation without auto-evaluate
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    assert_eq!(
        orch.source(id).unwrap(),
        "u8 a @ 0; u8 b @ 1; u8 c @ ;"
    );
}

#[test]
fn test_auto_evaluate_runs_after_parse() {
    let orch = orchestrator(true, 20);
    let rx = orch.subscribe();
    let id = orch.attach(provider(&[7, 8]));

    orch.source_changed(id, "u8 a @ 1;").unwrap();
    match next_for(&rx, id) {
        Event::ParseFinished { errors, .. } => assert!(errors.is_empty()),
        other => panic!("expected a parse result, got {:?}", other),
    }
    assert_eq!(wait_finished(&rx, id), RunStatus::Success);
    let value = orch
        .with_runtime(id, |rt| rt.pattern_by_name("a").map(|p| p.value.clone()))
        .unwrap();
    assert_eq!(value, Some(PatternValue::Unsigned(8)));
}

#[test]
fn test_breakpoint_hit_resume_and_step() {
    let orch = orchestrator(false, 1000);
    let rx = orch.subscribe();
    let id = orch.attach(provider(&[1, 2, 3, 4]));
    orch.add_breakpoint(id, 2).unwrap();

    let source = "u8 a @ 0;\nu8 b @ 1;\nu8 c @ 2;\nu8 d @ 3;";
    orch.execute(id, source, Vec::new(), BTreeMap::new()).unwrap();

    assert!(matches!(next_for(&rx, id), Event::EvaluationStarted { .. }));
    assert!(matches!(next_for(&rx, id), Event::BreakpointHit { line: 2, .. }));
    assert_eq!(orch.state(id).unwrap(), RunState::Suspended);
    assert_eq!(orch.pause_line(id).unwrap(), Some(2));
    assert!(!orch.scopes(id).unwrap().is_empty());

    // Step stops again on the following line
    orch.step(id).unwrap();
    assert!(matches!(next_for(&rx, id), Event::BreakpointHit { line: 3, .. }));

    orch.resume(id).unwrap();
    assert_eq!(wait_finished(&rx, id), RunStatus::Success);
    orch.wait_idle(id).unwrap();
    let count = orch.with_runtime(id, |rt| rt.tree().len()).unwrap();
    assert_eq!(count, 4);
}

#[test]
fn test_abort_while_suspended() {
    let orch = orchestrator(false, 1000);
    let rx = orch.subscribe();
    let id = orch.attach(provider(&[1, 2, 3]));
    orch.add_breakpoint(id, 2).unwrap();

    orch.execute(id, "u8 a @ 0;\nu8 b @ 1;\nu8 c @ 2;", Vec::new(), BTreeMap::new())
        .unwrap();
    loop {
        if let Event::BreakpointHit { .. } = next_for(&rx, id) {
            break;
        }
    }

    orch.abort(id).unwrap();
    assert!(!orch.is_running(id).unwrap());
    assert_eq!(wait_finished(&rx, id), RunStatus::Aborted);
    let status = orch.with_runtime(id, |rt| rt.status()).unwrap();
    assert_eq!(status, Some(RunStatus::Aborted));
}

#[test]
fn test_providers_run_independently() {
    let orch = orchestrator(false, 1000);
    let rx = orch.subscribe();
    let blocked = orch.attach(provider(&[1, 2]));
    let free = orch.attach(provider(&[3, 4]));
    orch.add_breakpoint(blocked, 2).unwrap();

    let source = "u8 a @ 0;\nu8 b @ 1;";
    orch.execute(blocked, source, Vec::new(), BTreeMap::new()).unwrap();
    loop {
        if let Event::BreakpointHit { .. } = next_for(&rx, blocked) {
            break;
        }
    }

    // The other provider finishes while the first one is suspended
    orch.execute(free, source, Vec::new(), BTreeMap::new()).unwrap();
    assert_eq!(wait_finished(&rx, free), RunStatus::Success);
    assert_eq!(orch.state(blocked).unwrap(), RunState::Suspended);

    orch.resume(blocked).unwrap();
    assert_eq!(wait_finished(&rx, blocked), RunStatus::Success);
}

#[test]
fn test_detach_during_run() {
    let orch = orchestrator(false, 1000);
    let rx = orch.subscribe();
    let id = orch.attach(provider(&[1, 2]));
    orch.add_breakpoint(id, 1).unwrap();

    orch.execute(id, "u8 a @ 0;", Vec::new(), BTreeMap::new()).unwrap();
    loop {
        if let Event::BreakpointHit { .. } = next_for(&rx, id) {
            break;
        }
    }
    orch.detach(id).unwrap();
    assert!(orch.providers().is_empty());
    assert!(orch.state(id).is_err());
}

#[test]
fn test_set_provider_keeps_breakpoints_and_source() {
    let orch = orchestrator(false, 1000);
    let rx = orch.subscribe();
    let id = orch.attach(provider(&[1]));
    orch.add_breakpoint(id, 4).unwrap();
    orch.execute(id, "u8 v @ 0;", Vec::new(), BTreeMap::new()).unwrap();
    assert_eq!(wait_finished(&rx, id), RunStatus::Success);
    orch.wait_idle(id).unwrap();

    orch.set_provider(id, provider(&[9])).unwrap();
    assert_eq!(orch.breakpoints(id).unwrap(), vec![4]);
    assert_eq!(orch.source(id).unwrap(), "u8 v @ 0;");

    orch.execute(id, "u8 v @ 0;", Vec::new(), BTreeMap::new()).unwrap();
    assert_eq!(wait_finished(&rx, id), RunStatus::Success);
    orch.wait_idle(id).unwrap();
    let value = orch
        .with_runtime(id, |rt| rt.pattern_by_name("v").map(|p| p.value.clone()))
        .unwrap();
    assert_eq!(value, Some(PatternValue::Unsigned(9)));
}

#[test]
fn test_panicking_native_function_leaves_provider_idle() {
    let orch = orchestrator(false, 1000);
    let rx = orch.subscribe();
    let id = orch.attach(provider(&[5]));
    orch.with_runtime_mut(id, |rt| {
        rt.add_function("host", "explode", Arity::Exactly(0), native(|_, _| panic!("native bug")))
            .unwrap();
    })
    .unwrap();

    orch.execute(id, "u8 a @ 0;\nhost::explode();", Vec::new(), BTreeMap::new())
        .unwrap();
    assert_eq!(wait_finished(&rx, id), RunStatus::EvalFailed);
    orch.wait_idle(id).unwrap();
    assert!(!orch.is_running(id).unwrap());
    let code = orch
        .with_runtime(id, |rt| rt.eval_error().map(|e| e.code))
        .unwrap();
    assert_eq!(code, Some(ErrorCode::NativeFailure));

    // The worker survives and the provider accepts new runs
    orch.execute(id, "u8 a @ 0;", Vec::new(), BTreeMap::new()).unwrap();
    assert_eq!(wait_finished(&rx, id), RunStatus::Success);
    orch.abort(id).unwrap();
    orch.wait_idle(id).unwrap();
}
