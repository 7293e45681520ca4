use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use chrono::NaiveDate;
use indexmap::IndexMap;
use meridian_engine::{
    BreakerConfig, CapabilityCall, ContextBuilder, ContextRequest, EngineError, HandlerFailure, HandlerRegistration,
    InMemoryPatternSource, Orchestrator, PatternStore, RequestContext, Runtime, StaticSnapshotSource,
};
use meridian_types::{CapabilityResult, PatternDefinition, SnapshotState, SnapshotStatus, StepOutcome, Value};
use tokio_util::sync::CancellationToken;

const OVERVIEW: &str = r#"
id: portfolio_overview
inputs:
  portfolio_id: { required: true, type: string }
  lookback_days: { type: number, default: 252 }
steps:
  - capability: ledger.positions
    args: { portfolio_id: "{{inputs.portfolio_id}}" }
    as: positions
  - capability: ratings.compute
    args: { positions: "{{state.positions}}" }
    as: ratings
  - capability: metrics.compute_twr
    args:
      positions: "{{state.positions}}"
      lookback: "{{inputs.lookback_days}}"
      pack: "{{ctx.snapshot_id}}"
    as: twr
outputs: [positions, twr]
"#;

fn snapshot(snapshot_id: &str, status: SnapshotStatus) -> SnapshotState {
    SnapshotState {
        snapshot_id: snapshot_id.into(),
        ledger_id: "LEDGER_abc123".into(),
        as_of: NaiveDate::from_ymd_opt(2024, 6, 28).expect("date"),
        status,
        estimated_ready_at: None,
        error: None,
    }
}

async fn fresh_context() -> Arc<RequestContext> {
    let source = Arc::new(StaticSnapshotSource::new(snapshot("PP_2024-06-28", SnapshotStatus::Fresh)));
    ContextBuilder::new(source).build(ContextRequest::new()).await.expect("context")
}

fn store(patterns: &[&str]) -> Arc<PatternStore> {
    let definitions: Vec<PatternDefinition> = patterns
        .iter()
        .map(|text| serde_yaml::from_str(text).expect("pattern yaml"))
        .collect();
    Arc::new(PatternStore::new(Arc::new(InMemoryPatternSource::with_definitions(definitions))))
}

fn inputs(portfolio_id: &str) -> IndexMap<String, Value> {
    IndexMap::from([("portfolio_id".to_string(), Value::from(portfolio_id))])
}

/// Echoes its arguments back and counts invocations.
fn counting(handler: &str, capability: &str, calls: Arc<AtomicUsize>) -> HandlerRegistration {
    HandlerRegistration::new(handler).capability(capability, move |call: CapabilityCall| {
        let calls = Arc::clone(&calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, HandlerFailure>(
                CapabilityResult::new(Value::Map(call.args), call.operation).with_as_of(call.context.as_of()),
            )
        }
    })
}

#[tokio::test]
async fn unregistered_capability_stops_run_at_failing_step() {
    let ledger_calls = Arc::new(AtomicUsize::new(0));
    let metrics_calls = Arc::new(AtomicUsize::new(0));
    let mut runtime = Runtime::default();
    runtime
        .register(counting("data_harvester", "ledger.positions", ledger_calls.clone()))
        .expect("register ledger");
    runtime
        .register(counting("financial_analyst", "metrics.compute_twr", metrics_calls.clone()))
        .expect("register metrics");

    let orchestrator = Orchestrator::new(store(&[OVERVIEW]), Arc::new(runtime));
    let failure = orchestrator
        .run("portfolio_overview", fresh_context().await, inputs("P-1"))
        .await
        .expect_err("step 2 has no handler");

    assert!(matches!(failure.error, EngineError::StepFailed { index: 1, ref capability, .. } if capability == "ratings.compute"));
    assert!(matches!(failure.error.root(), EngineError::CapabilityNotRegistered { .. }));
    assert_eq!(failure.error.code(), "CAPABILITY_NOT_REGISTERED");

    assert_eq!(failure.trace.completed(), 1);
    assert_eq!(failure.trace.steps.len(), 2);
    assert_eq!(failure.trace.failed_step().map(|record| record.index), Some(1));
    assert_eq!(ledger_calls.load(Ordering::SeqCst), 1);
    assert_eq!(metrics_calls.load(Ordering::SeqCst), 0, "no step after the failure is dispatched");
}

#[tokio::test(start_paused = true)]
async fn repeated_handler_failures_open_the_breaker_until_the_window_elapses() {
    const FLAKY: &str = r#"
id: prices
steps:
  - capability: pricing.get
    as: prices
outputs: [prices]
"#;

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut runtime = Runtime::new(BreakerConfig {
        failure_threshold: 5,
        open_duration: Duration::from_secs(60),
        ..BreakerConfig::default()
    });
    runtime
        .register(HandlerRegistration::new("data_harvester").capability("pricing.get", move |_call: CapabilityCall| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<CapabilityResult, _>(HandlerFailure::upstream("price provider returned 503"))
            }
        }))
        .expect("register");

    let orchestrator = Orchestrator::new(store(&[FLAKY]), Arc::new(runtime));
    let context = fresh_context().await;

    for _ in 0..5 {
        let failure = orchestrator
            .run("prices", Arc::clone(&context), IndexMap::new())
            .await
            .expect_err("handler fails");
        assert_eq!(failure.error.code(), "CAPABILITY_EXECUTION_FAILED");
    }

    let short_circuited = orchestrator
        .run("prices", Arc::clone(&context), IndexMap::new())
        .await
        .expect_err("breaker open");
    assert_eq!(short_circuited.error.code(), "HANDLER_UNAVAILABLE");
    assert!(short_circuited.error.is_retryable());
    assert!(short_circuited.error.retry_hint().is_some_and(|hint| hint <= Duration::from_secs(60)));
    assert_eq!(calls.load(Ordering::SeqCst), 5, "open breaker does not invoke the handler");

    tokio::time::advance(Duration::from_secs(60)).await;
    let trial = orchestrator
        .run("prices", Arc::clone(&context), IndexMap::new())
        .await
        .expect_err("handler still failing");
    assert_eq!(trial.error.code(), "CAPABILITY_EXECUTION_FAILED");
    assert_eq!(calls.load(Ordering::SeqCst), 6, "half-open trial reaches the handler");
}

#[tokio::test]
async fn reading_state_before_it_is_bound_fails_without_dispatch() {
    const OUT_OF_ORDER: &str = r#"
id: out_of_order
steps:
  - capability: metrics.compute_twr
    args: { positions: "{{state.positions}}" }
    as: twr
  - capability: ledger.positions
    as: positions
outputs: [twr]
"#;

    let calls = Arc::new(AtomicUsize::new(0));
    let mut runtime = Runtime::default();
    runtime
        .register(counting("financial_analyst", "metrics.compute_twr", calls.clone()))
        .expect("register metrics");
    runtime
        .register(counting("data_harvester", "ledger.positions", calls.clone()))
        .expect("register ledger");

    let orchestrator = Orchestrator::new(store(&[OUT_OF_ORDER]), Arc::new(runtime));
    let failure = orchestrator
        .run("out_of_order", fresh_context().await, IndexMap::new())
        .await
        .expect_err("unresolved template");

    assert!(
        matches!(failure.error.root(), EngineError::TemplateUnresolved { expression, .. } if expression == "state.positions")
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(failure.trace.steps.len(), 1);
    assert_eq!(failure.trace.steps[0].outcome, StepOutcome::Failed);
    assert_eq!(failure.trace.steps[0].handler.as_deref(), Some("financial_analyst"));
    assert_eq!(failure.trace.steps[0].operation.as_deref(), Some("metrics_compute_twr"));
    assert_eq!(failure.trace.completed(), 0);
}

#[tokio::test]
async fn warming_snapshot_runs_only_with_stale_override() {
    let source = Arc::new(StaticSnapshotSource::new(snapshot("PP_2024-07-01", SnapshotStatus::Warming)));
    let builder = ContextBuilder::new(source);

    let blocked = builder.build(ContextRequest::new()).await.expect_err("gate blocks warming");
    assert_eq!(blocked.code(), "SNAPSHOT_NOT_READY");
    assert!(blocked.retry_hint().is_some());

    let calls = Arc::new(AtomicUsize::new(0));
    let mut runtime = Runtime::default();
    for (handler, capability) in [
        ("data_harvester", "ledger.positions"),
        ("ratings_desk", "ratings.compute"),
        ("financial_analyst", "metrics.compute_twr"),
    ] {
        runtime.register(counting(handler, capability, calls.clone())).expect("register");
    }
    let orchestrator = Orchestrator::new(store(&[OVERVIEW]), Arc::new(runtime));

    let context = builder.build(ContextRequest::new().allow_stale()).await.expect("override");
    let output = orchestrator
        .run("portfolio_overview", context, inputs("P-1"))
        .await
        .expect("run");

    assert_eq!(output.trace.snapshot_id, "PP_2024-07-01");
    assert_eq!(output.trace.snapshot_status, SnapshotStatus::Warming);
    let twr = output.outputs["twr"].as_map().expect("twr map");
    assert_eq!(twr["pack"], Value::from("PP_2024-07-01"));
    assert_eq!(twr["lookback"], Value::from(252));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn same_inputs_against_same_snapshot_produce_same_outputs() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut runtime = Runtime::default();
    for (handler, capability) in [
        ("data_harvester", "ledger.positions"),
        ("ratings_desk", "ratings.compute"),
        ("financial_analyst", "metrics.compute_twr"),
    ] {
        runtime.register(counting(handler, capability, calls.clone())).expect("register");
    }
    let orchestrator = Orchestrator::new(store(&[OVERVIEW]), Arc::new(runtime));

    let first = orchestrator
        .run("portfolio_overview", fresh_context().await, inputs("P-1"))
        .await
        .expect("first run");
    let second = orchestrator
        .run("portfolio_overview", fresh_context().await, inputs("P-1"))
        .await
        .expect("second run");

    assert_eq!(first.outputs, second.outputs);
    assert_ne!(first.trace.request_id, second.trace.request_id);
    assert_eq!(first.outputs.keys().collect::<Vec<_>>(), vec!["positions", "twr"]);
    assert_eq!(
        first.trace.steps.iter().map(|record| record.handler.as_deref()).collect::<Vec<_>>(),
        vec![Some("data_harvester"), Some("ratings_desk"), Some("financial_analyst")]
    );
}

#[tokio::test]
async fn false_condition_skips_step_and_leaves_output_null() {
    const CONDITIONAL: &str = r#"
id: conditional
inputs:
  include_benchmark: { type: boolean, default: false }
steps:
  - capability: ledger.positions
    as: positions
  - capability: metrics.benchmark
    when: "inputs.include_benchmark"
    as: benchmark
outputs: [positions, benchmark]
"#;

    let calls = Arc::new(AtomicUsize::new(0));
    let mut runtime = Runtime::default();
    runtime
        .register(counting("data_harvester", "ledger.positions", Arc::new(AtomicUsize::new(0))))
        .expect("register ledger");
    runtime
        .register(counting("financial_analyst", "metrics.benchmark", calls.clone()))
        .expect("register benchmark");
    let orchestrator = Orchestrator::new(store(&[CONDITIONAL]), Arc::new(runtime));

    let output = orchestrator
        .run("conditional", fresh_context().await, IndexMap::new())
        .await
        .expect("run");

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(output.outputs["benchmark"], Value::Null);
    assert_eq!(output.trace.steps[1].outcome, StepOutcome::Skipped);
    assert_eq!(output.trace.completed(), 2);
}

#[tokio::test]
async fn cancellation_stops_before_next_dispatch() {
    let token = CancellationToken::new();
    let later_calls = Arc::new(AtomicUsize::new(0));
    let cancel_from_handler = token.clone();

    let mut runtime = Runtime::default();
    runtime
        .register(HandlerRegistration::new("data_harvester").capability("ledger.positions", move |call: CapabilityCall| {
            let token = cancel_from_handler.clone();
            async move {
                token.cancel();
                Ok::<_, HandlerFailure>(CapabilityResult::new(Value::Map(call.args), "ledger"))
            }
        }))
        .expect("register ledger");
    runtime
        .register(counting("ratings_desk", "ratings.compute", later_calls.clone()))
        .expect("register ratings");
    runtime
        .register(counting("financial_analyst", "metrics.compute_twr", later_calls.clone()))
        .expect("register metrics");

    let orchestrator = Orchestrator::new(store(&[OVERVIEW]), Arc::new(runtime));
    let failure = orchestrator
        .run_with_cancellation("portfolio_overview", fresh_context().await, inputs("P-1"), token)
        .await
        .expect_err("cancelled");

    assert!(matches!(failure.error, EngineError::Cancelled { index: 1 }));
    assert_eq!(later_calls.load(Ordering::SeqCst), 0);
    assert_eq!(failure.trace.steps.len(), 1);
}

#[tokio::test]
async fn unknown_pattern_returns_empty_trace() {
    let orchestrator = Orchestrator::new(store(&[OVERVIEW]), Arc::new(Runtime::default()));
    let failure = orchestrator
        .run("tax_lot_report", fresh_context().await, IndexMap::new())
        .await
        .expect_err("missing pattern");

    assert_eq!(failure.error.code(), "PATTERN_NOT_FOUND");
    assert!(failure.trace.steps.is_empty());
    assert_eq!(failure.trace.pattern_version, None);
}
