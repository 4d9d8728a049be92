//! Integration tests for an orchestrator wired to an external bus
//!
//! The bus is created and partly configured before the orchestrator, the way
//! an embedding application shares one bus between several components.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use flowbus_core::event::Command;
use flowbus_core::event_bus::{BusError, CommandBus, EventSubscriber};
use flowbus_core::handler::CommandHandler;
use flowbus_runtime::config::RuntimeConfig;
use flowbus_runtime::{InProcessBus, Orchestrator, OrchestratorError};
use flowbus_testing::{init_test_tracing, RecordingSubscriber, ScriptedHandler};
use serde_json::json;
use std::sync::Arc;

// ============================================================================
// Test Fixtures
// ============================================================================

fn build_check() -> ScriptedHandler {
    ScriptedHandler::check("Build", "BuildPassed", "BuildFailed")
}

fn orchestrator_on(bus: &Arc<InProcessBus>) -> Orchestrator {
    init_test_tracing();
    Orchestrator::builder(RuntimeConfig::default())
        .bus(Arc::clone(bus) as Arc<dyn CommandBus>)
        .build()
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_handler_refused_by_bus_leaves_no_trace() {
    let bus = Arc::new(InProcessBus::new());
    let existing = ScriptedHandler::new("Build").emitting("BuildPassed", json!({}));
    bus.register_command_handler(Arc::new(existing.clone()) as Arc<dyn CommandHandler>)
        .unwrap();
    let orchestrator = orchestrator_on(&bus);
    let generation = orchestrator.registry().generation();

    let result = orchestrator.register_command_handler(Arc::new(build_check()));

    assert!(matches!(
        result,
        Err(OrchestratorError::Bus(BusError::DuplicateHandler(ref name))) if name == "Build"
    ));
    assert!(orchestrator.registry().handler_names().is_empty());
    assert!(orchestrator.command_metadata().is_empty());
    assert!(orchestrator.registry().completion_index().is_empty());
    assert!(orchestrator.registry().generation() > generation);

    // The bus keeps serving its own handler.
    orchestrator
        .send_command(Command::new("Build", json!({})))
        .await
        .unwrap();
    assert_eq!(existing.calls(), 1);
}

#[tokio::test]
async fn test_batch_registration_reports_bus_refusals() {
    let bus = Arc::new(InProcessBus::new());
    bus.register_command_handler(Arc::new(ScriptedHandler::new("Build")) as Arc<dyn CommandHandler>)
        .unwrap();
    let orchestrator = orchestrator_on(&bus);

    let rejected = orchestrator.register_command_handlers(vec![
        Arc::new(build_check()) as Arc<dyn CommandHandler>,
        Arc::new(ScriptedHandler::check("Lint", "LintPassed", "LintFailed")) as Arc<dyn CommandHandler>,
    ]);

    assert_eq!(rejected.len(), 1);
    assert_eq!(orchestrator.registry().handler_names(), vec!["Lint"]);
    assert_eq!(
        orchestrator.command_metadata().keys().collect::<Vec<_>>(),
        vec!["Lint"]
    );
}

#[tokio::test]
async fn test_other_subscribers_see_the_same_events() {
    let bus = Arc::new(InProcessBus::new());
    let recorder = Arc::new(RecordingSubscriber::new());
    bus.subscribe_all(Arc::clone(&recorder) as Arc<dyn EventSubscriber>);
    let orchestrator = orchestrator_on(&bus);
    orchestrator
        .register_command_handler(Arc::new(build_check()))
        .unwrap();
    orchestrator
        .register_command_handler(Arc::new(
            ScriptedHandler::new("Deploy").emitting("Deployed", json!({})),
        ))
        .unwrap();
    orchestrator.configure(|ctx| {
        ctx.on("BuildPassed", |_event: &flowbus_core::event::Event| {
            Ok(Command::new("Deploy", json!({})))
        });
    });

    orchestrator
        .send_command(Command::new("Build", json!({})).with_correlation_id("run-1"))
        .await
        .unwrap();

    assert_eq!(recorder.event_types(), vec!["BuildPassed", "Deployed"]);
    assert!(recorder
        .events()
        .iter()
        .all(|e| e.correlation() == Some("run-1")));
    let history: Vec<String> = orchestrator
        .history()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(history, recorder.event_types());
}
