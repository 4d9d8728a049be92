//! Integration tests for join synchronization
//!
//! Drives the orchestrator end to end: commands are submitted through the
//! in-process bus, their events flow through the processor, and join
//! handlers fire once every tracked command in a correlation has settled.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use flowbus_core::dispatch::DispatchAction;
use flowbus_core::environment::Clock;
use flowbus_core::event::{Command, Event};
use flowbus_core::handler::{CommandHandler, HandlerError};
use flowbus_runtime::config::{RearmPolicy, RuntimeConfig};
use flowbus_runtime::join::{JoinContext, JoinKey, JoinOutcome, SettledEvents};
use flowbus_runtime::Orchestrator;
use flowbus_testing::properties::{completion_order, correlation_id};
use flowbus_testing::{init_test_tracing, test_clock, ManualClock, ScriptedHandler};
use proptest::prelude::*;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Test Fixtures
// ============================================================================

const CHECKS: [&str; 3] = ["CheckTests", "CheckTypes", "CheckLint"];
const TEMPLATE: &str = r#"["CheckLint","CheckTests","CheckTypes"]"#;

/// Every firing: correlation id and the settled events.
type Firings = Arc<Mutex<Vec<(String, SettledEvents)>>>;

struct Pipeline {
    orchestrator: Orchestrator,
    handlers: Vec<ScriptedHandler>,
    report: ScriptedHandler,
    fired: Firings,
}

impl Pipeline {
    fn firings(&self) -> Vec<(String, SettledEvents)> {
        self.fired.lock().unwrap().clone()
    }

    fn fired_count(&self) -> usize {
        self.fired.lock().unwrap().len()
    }

    async fn run(&self, name: &str, correlation_id: &str) {
        self.orchestrator
            .send_command(Command::new(name, json!({})).with_correlation_id(correlation_id))
            .await
            .unwrap();
    }

    async fn run_all(&self, correlation_id: &str) {
        for name in CHECKS {
            self.run(name, correlation_id).await;
        }
    }
}

fn default_checks() -> Vec<ScriptedHandler> {
    vec![
        ScriptedHandler::check("CheckTests", "TestsCheckPassed", "TestsCheckFailed"),
        ScriptedHandler::check("CheckTypes", "TypesCheckPassed", "TypesCheckFailed"),
        ScriptedHandler::check("CheckLint", "LintCheckPassed", "LintCheckFailed"),
    ]
}

/// Orchestrator with the three checks, a `Report` command, and a join over
/// the checks that records its input, sends `Report`, and returns `outcome`.
fn pipeline_with<F>(config: RuntimeConfig, handlers: Vec<ScriptedHandler>, outcome: F) -> Pipeline
where
    F: Fn() -> Result<JoinOutcome, HandlerError> + Send + Sync + 'static,
{
    pipeline_on(Orchestrator::new(config), handlers, outcome)
}

/// Same as [`pipeline_with`] on a prebuilt orchestrator.
fn pipeline_on<F>(orchestrator: Orchestrator, handlers: Vec<ScriptedHandler>, outcome: F) -> Pipeline
where
    F: Fn() -> Result<JoinOutcome, HandlerError> + Send + Sync + 'static,
{
    init_test_tracing();
    let report = ScriptedHandler::new("Report").emitting("Reported", json!({}));

    for handler in handlers.iter().chain(std::iter::once(&report)) {
        orchestrator
            .register_command_handler(Arc::new(handler.clone()) as Arc<dyn CommandHandler>)
            .unwrap();
    }

    let fired: Firings = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&fired);
    orchestrator.configure(move |ctx| {
        ctx.settled(CHECKS, move |events: &SettledEvents, join: &mut JoinContext| {
            sink.lock()
                .unwrap()
                .push((join.correlation_id().to_string(), events.clone()));
            join.send(Command::new("Report", json!({})));
            outcome()
        });
    });

    Pipeline {
        orchestrator,
        handlers,
        report,
        fired,
    }
}

fn pipeline() -> Pipeline {
    pipeline_with(RuntimeConfig::default(), default_checks(), || Ok(JoinOutcome::done()))
}

fn event_types(events: &[Event]) -> Vec<&str> {
    events.iter().map(|e| e.event_type.as_str()).collect()
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_join_fires_once_after_all_checks() {
    let p = pipeline();

    p.run("CheckTests", "run-1").await;
    p.run("CheckTypes", "run-1").await;
    assert_eq!(p.fired_count(), 0);
    assert_eq!(
        p.orchestrator.live_join_instances(),
        vec![JoinKey::new(TEMPLATE, "run-1")]
    );

    p.run("CheckLint", "run-1").await;

    let firings = p.firings();
    assert_eq!(firings.len(), 1);
    let (correlation_id, events) = &firings[0];
    assert_eq!(correlation_id, "run-1");
    assert_eq!(event_types(&events["CheckTests"]), vec!["TestsCheckPassed"]);
    assert_eq!(event_types(&events["CheckTypes"]), vec!["TypesCheckPassed"]);
    assert_eq!(event_types(&events["CheckLint"]), vec!["LintCheckPassed"]);

    assert!(p.orchestrator.live_join_instances().is_empty());
    assert!(p.handlers.iter().all(|h| h.calls() == 1));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn test_join_fires_once_in_any_completion_order(
        order in completion_order(CHECKS.len()),
        run in correlation_id(),
    ) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let p = pipeline();
            for (step, idx) in order.iter().enumerate() {
                assert_eq!(p.fired_count(), 0, "fired early at step {step} of {order:?}");
                p.run(CHECKS[*idx], &run).await;
            }
            let firings = p.firings();
            assert_eq!(firings.len(), 1, "order {order:?}");
            assert_eq!(firings[0].0, run);
            assert!(p.orchestrator.live_join_instances().is_empty());
        });
    }
}

#[tokio::test]
async fn test_correlations_are_isolated() {
    let p = pipeline();

    p.run("CheckTests", "run-a").await;
    p.run("CheckTests", "run-b").await;
    p.run("CheckTypes", "run-a").await;
    p.run("CheckLint", "run-a").await;

    let firings = p.firings();
    assert_eq!(firings.len(), 1);
    assert_eq!(firings[0].0, "run-a");
    assert_eq!(
        p.orchestrator.live_join_instances(),
        vec![JoinKey::new(TEMPLATE, "run-b")]
    );

    p.run("CheckLint", "run-b").await;
    p.run("CheckTypes", "run-b").await;
    let firings = p.firings();
    assert_eq!(firings.len(), 2);
    assert_eq!(firings[1].0, "run-b");
    assert_eq!(firings[1].1["CheckTests"].len(), 1);
}

#[tokio::test]
async fn test_partial_completion_never_fires() {
    let p = pipeline();
    p.run("CheckTests", "run-1").await;
    p.run("CheckLint", "run-1").await;

    assert_eq!(p.fired_count(), 0);
    let info = p.orchestrator.join_instance_info();
    assert_eq!(info.len(), 1);
    assert_eq!(info[0].completed, 2);
    assert_eq!(info[0].total, 3);
    assert_eq!(p.report.calls(), 0);
}

#[tokio::test]
async fn test_uncorrelated_commands_are_not_tracked() {
    let p = pipeline();
    for name in CHECKS {
        p.orchestrator
            .send_command(Command::new(name, json!({})))
            .await
            .unwrap();
    }
    assert_eq!(p.fired_count(), 0);
    assert!(p.orchestrator.live_join_instances().is_empty());
}

#[tokio::test]
async fn test_failed_check_still_settles() {
    let mut handlers = default_checks();
    handlers[2] = ScriptedHandler::new("CheckLint")
        .declaring(["LintCheckPassed", "LintCheckFailed"])
        .emitting("LintCheckFailed", json!({ "error": "3 warnings" }));
    let p = pipeline_with(RuntimeConfig::default(), handlers, || Ok(JoinOutcome::done()));

    p.run_all("run-1").await;

    let firings = p.firings();
    assert_eq!(firings.len(), 1);
    let lint = &firings[0].1["CheckLint"];
    assert_eq!(event_types(lint), vec!["LintCheckFailed"]);
    assert!(lint[0].has_error_marker());
}

#[tokio::test]
async fn test_progress_events_are_collected() {
    let mut handlers = default_checks();
    handlers[0] = ScriptedHandler::new("CheckTests")
        .declaring(["TestsCheckPassed", "TestsCheckFailed"])
        .emitting("TestsProgress", json!({ "done": 10 }))
        .emitting("TestsProgress", json!({ "done": 20 }))
        .emitting("TestsCheckPassed", json!({}));
    let p = pipeline_with(RuntimeConfig::default(), handlers, || Ok(JoinOutcome::done()));

    p.run_all("run-1").await;

    let firings = p.firings();
    assert_eq!(firings.len(), 1);
    assert_eq!(
        event_types(&firings[0].1["CheckTests"]),
        vec!["TestsProgress", "TestsProgress", "TestsCheckPassed"]
    );
    assert_eq!(firings[0].1["CheckTests"][1].data["done"], 20);
}

#[tokio::test]
async fn test_join_dispatch_inherits_correlation() {
    let p = pipeline();
    p.run_all("run-7").await;

    assert_eq!(p.report.calls(), 1);
    let report = &p.report.received()[0];
    assert_eq!(report.correlation(), Some("run-7"));
    assert!(report.request().is_some());
    assert!(p
        .orchestrator
        .history()
        .iter()
        .any(|e| e.event_type == "Reported" && e.correlation() == Some("run-7")));
}

#[tokio::test]
async fn test_persist_rearms_until_cap() {
    let config = RuntimeConfig::default().with_rearm_policy(RearmPolicy::MaxRearms(1));
    let p = pipeline_with(config, default_checks(), || Ok(JoinOutcome::persist()));

    p.run_all("run-1").await;
    assert_eq!(p.fired_count(), 1);
    let info = p.orchestrator.join_instance_info();
    assert_eq!(info.len(), 1);
    assert_eq!(info[0].rearm_count, 1);
    assert_eq!(info[0].completed, 0);

    p.run_all("run-1").await;
    assert_eq!(p.fired_count(), 2);
    assert!(p.orchestrator.live_join_instances().is_empty());
}

#[tokio::test]
async fn test_unlimited_persist_keeps_instance() {
    let p = pipeline_with(RuntimeConfig::default(), default_checks(), || {
        Ok(JoinOutcome::persist())
    });

    for _ in 0..3 {
        p.run_all("run-1").await;
    }
    assert_eq!(p.fired_count(), 3);
    assert_eq!(p.orchestrator.join_instance_info()[0].rearm_count, 3);
}

#[tokio::test]
async fn test_failing_join_handler_cleans_up() {
    let p = pipeline_with(RuntimeConfig::default(), default_checks(), || {
        Err(HandlerError::failed("report store unavailable"))
    });

    p.run_all("run-1").await;
    assert_eq!(p.fired_count(), 1);
    assert!(p.orchestrator.live_join_instances().is_empty());
    // Dispatches queued by a failed handler are discarded.
    assert_eq!(p.report.calls(), 0);

    p.run_all("run-1").await;
    assert_eq!(p.fired_count(), 2);
}

#[tokio::test]
async fn test_parallel_fan_out_settles_after_wait_idle() {
    let handlers = vec![
        ScriptedHandler::check("CheckTests", "TestsCheckPassed", "TestsCheckFailed")
            .with_delay(Duration::from_millis(30)),
        ScriptedHandler::check("CheckTypes", "TypesCheckPassed", "TypesCheckFailed")
            .with_delay(Duration::from_millis(5)),
        ScriptedHandler::check("CheckLint", "LintCheckPassed", "LintCheckFailed")
            .with_delay(Duration::from_millis(15)),
    ];
    let p = pipeline_with(RuntimeConfig::default(), handlers, || Ok(JoinOutcome::done()));

    let detect = ScriptedHandler::new("DetectChanges").emitting("ChangesDetected", json!({}));
    p.orchestrator
        .register_command_handler(Arc::new(detect))
        .unwrap();
    p.orchestrator.configure(|ctx| {
        ctx.on("ChangesDetected", |_event: &Event| {
            Ok(DispatchAction::parallel(
                CHECKS
                    .iter()
                    .map(|name| Command::new(*name, json!({})))
                    .collect(),
            ))
        });
    });

    p.orchestrator
        .send_command(Command::new("DetectChanges", json!({})).with_correlation_id("run-9"))
        .await
        .unwrap();
    p.orchestrator
        .wait_idle(Duration::from_secs(5))
        .await
        .unwrap();

    let firings = p.firings();
    assert_eq!(firings.len(), 1);
    assert_eq!(firings[0].0, "run-9");
    for handler in &p.handlers {
        assert_eq!(handler.calls(), 1);
        assert_eq!(handler.received()[0].correlation(), Some("run-9"));
    }
    assert!(p.orchestrator.live_join_instances().is_empty());
    assert_eq!(p.orchestrator.in_flight(), 0);
}

#[tokio::test]
async fn test_stale_instances_can_be_evicted() {
    let clock = ManualClock::new(test_clock().now());
    let orchestrator = Orchestrator::builder(RuntimeConfig::default())
        .clock(Arc::new(clock.clone()))
        .build();
    let p = pipeline_on(orchestrator, default_checks(), || Ok(JoinOutcome::done()));

    p.run("CheckTests", "run-1").await;
    p.run("CheckTests", "run-2").await;
    clock.advance(chrono::Duration::minutes(10));
    p.run("CheckTests", "run-3").await;

    assert!(p.orchestrator.evict_join_instance(&JoinKey::new(TEMPLATE, "run-1")));
    assert!(!p.orchestrator.evict_join_instance(&JoinKey::new(TEMPLATE, "run-1")));

    let cutoff = clock.now() - chrono::Duration::minutes(5);
    assert_eq!(
        p.orchestrator.evict_join_instances_before(cutoff),
        vec![JoinKey::new(TEMPLATE, "run-2")]
    );
    assert_eq!(
        p.orchestrator.live_join_instances(),
        vec![JoinKey::new(TEMPLATE, "run-3")]
    );
    assert_eq!(p.orchestrator.join_instance_info()[0].started_at, clock.now());

    // Late completions of an evicted instance fire nothing.
    p.run("CheckTypes", "run-2").await;
    p.run("CheckLint", "run-2").await;
    assert_eq!(p.fired_count(), 0);
}

#[tokio::test]
async fn test_reaction_and_join_handler_can_read_orchestrator_state() {
    let p = pipeline();
    let seen: Arc<Mutex<Vec<(&str, Value)>>> = Arc::default();

    let (observer, log) = (p.orchestrator.clone(), Arc::clone(&seen));
    let (join_observer, join_log) = (p.orchestrator.clone(), Arc::clone(&seen));
    p.orchestrator.configure(move |ctx| {
        ctx.fold("LintCheckPassed", |mut state: Value, _: &Event| {
            state["lint"] = json!("passed");
            Ok(state)
        });
        ctx.on("LintCheckPassed", move |_event: &Event| {
            log.lock().unwrap().push(("reaction", observer.state()));
            Ok(())
        });
        ctx.settled(["CheckLint"], move |_: &SettledEvents, _: &mut JoinContext| {
            let live = join_observer.live_join_instances().len();
            join_log
                .lock()
                .unwrap()
                .push(("join", json!({ "state": join_observer.state(), "live": live })));
            Ok(())
        });
    });

    tokio::time::timeout(Duration::from_secs(5), p.run("CheckLint", "run-1"))
        .await
        .expect("event processing deadlocked");

    let seen = seen.lock().unwrap();
    assert_eq!(
        *seen,
        vec![
            ("reaction", json!({ "lint": "passed" })),
            ("join", json!({ "state": { "lint": "passed" }, "live": 2 })),
        ]
    );
}
