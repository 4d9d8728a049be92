//! Integration tests for the pipeline graph
//!
//! Builds graphs from a configured orchestrator and checks the edge
//! derivation rules directly against the builder.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use flowbus_core::dispatch::DispatchAction;
use flowbus_core::event::{Command, Event, Message};
use flowbus_core::handler::CommandHandler;
use flowbus_core::metadata::CommandMetadata;
use flowbus_runtime::config::RuntimeConfig;
use flowbus_runtime::graph::{
    DependencyGraphBuilder, GraphEdge, GraphError, GraphOptions, NodeStatus, PipelineGraph,
};
use flowbus_runtime::join::{JoinContext, JoinRegistration, SettledEvents};
use flowbus_runtime::registration::ReactionRule;
use flowbus_runtime::Orchestrator;
use flowbus_testing::{init_test_tracing, ScriptedHandler};
use proptest::prelude::*;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Test Fixtures
// ============================================================================

const CHECKS: [(&str, &str, &str, &str); 3] = [
    ("CheckTests", "tests", "TestsCheckPassed", "TestsCheckFailed"),
    ("CheckTypes", "types", "TypesCheckPassed", "TypesCheckFailed"),
    ("CheckLint", "lint", "LintCheckPassed", "LintCheckFailed"),
];

fn check_metadata(name: &str, alias: &str, passed: &str, failed: &str) -> CommandMetadata {
    CommandMetadata::new(name)
        .with_package("checks")
        .with_alias(alias)
        .with_category("quality")
        .with_events([passed, failed])
}

/// `DetectChanges` fans out to the three checks; a join over the checks
/// sends `Report`. Lint fails.
fn ci_pipeline() -> Orchestrator {
    init_test_tracing();
    let orchestrator = Orchestrator::new(RuntimeConfig::default());

    let detect = ScriptedHandler::new("DetectChanges")
        .with_metadata(
            CommandMetadata::new("DetectChanges")
                .with_package("ci")
                .with_alias("detect")
                .with_description("Find changed files")
                .with_icon("search")
                .with_events(["ChangesDetected"]),
        )
        .emitting("ChangesDetected", json!({ "files": 3 }));
    let report = ScriptedHandler::new("Report").emitting("Reported", json!({}));

    let mut handlers: Vec<Arc<dyn CommandHandler>> = vec![Arc::new(detect), Arc::new(report)];
    for (name, alias, passed, failed) in CHECKS {
        let (emitted, data) = if name == "CheckLint" {
            (failed, json!({ "error": "2 warnings" }))
        } else {
            (passed, json!({}))
        };
        handlers.push(Arc::new(
            ScriptedHandler::new(name)
                .with_metadata(check_metadata(name, alias, passed, failed))
                .emitting(emitted, data),
        ));
    }
    assert!(orchestrator.register_command_handlers(handlers).is_empty());

    orchestrator.configure(|ctx| {
        ctx.reaction(
            ReactionRule::new("ChangesDetected", |_event: &Event| {
                Ok(DispatchAction::parallel(
                    CHECKS
                        .iter()
                        .map(|(name, ..)| Command::new(*name, json!({})))
                        .collect(),
                ))
            })
            .dispatching(CHECKS.iter().map(|(name, ..)| *name)),
        )
        .join(
            JoinRegistration::new(
                CHECKS.iter().map(|(name, ..)| *name),
                |_events: &SettledEvents, join: &mut JoinContext| {
                    join.send(Command::new("Report", json!({})));
                    Ok(())
                },
            )
            .dispatching(["Report"]),
        );
    });
    orchestrator
}

fn node_ids(graph: &PipelineGraph) -> Vec<&str> {
    graph.nodes.iter().map(|n| n.id.as_str()).collect()
}

fn status(graph: &PipelineGraph, id: &str) -> Option<NodeStatus> {
    graph.node(id).and_then(|n| n.status)
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_static_graph_from_registrations() {
    let graph = ci_pipeline().pipeline_graph(GraphOptions::default()).unwrap();

    assert_eq!(
        node_ids(&graph),
        vec!["Report", "checks/lint", "checks/tests", "checks/types", "ci/detect"]
    );
    for check in ["checks/tests", "checks/types", "checks/lint"] {
        assert!(graph.has_edge("ci/detect", check), "missing ci/detect -> {check}");
        assert!(graph.has_edge(check, "Report"), "missing {check} -> Report");
    }
    assert_eq!(graph.edges.len(), 6);

    let detect = graph.node("ci/detect").unwrap();
    assert_eq!(detect.title, "DetectChanges");
    assert_eq!(detect.description, "Find changed files");
    assert_eq!(detect.icon.as_deref(), Some("search"));
    assert_eq!(detect.status, None);

    let report = graph.node("Report").unwrap();
    assert_eq!(report.package, "default");
    assert_eq!(report.description, "");
    assert_eq!(graph.node("checks/lint").unwrap().category.as_deref(), Some("quality"));
}

#[tokio::test]
async fn test_status_follows_latest_run() {
    let orchestrator = ci_pipeline();

    let idle = orchestrator.pipeline_graph(GraphOptions::with_status()).unwrap();
    assert!(idle.nodes.iter().all(|n| n.status == Some(NodeStatus::Idle)));

    orchestrator
        .send_command(Command::new("DetectChanges", json!({})).with_correlation_id("run-1"))
        .await
        .unwrap();
    orchestrator.wait_idle(Duration::from_secs(5)).await.unwrap();

    let graph = orchestrator.pipeline_graph(GraphOptions::with_status()).unwrap();
    assert_eq!(status(&graph, "ci/detect"), Some(NodeStatus::Pass));
    assert_eq!(status(&graph, "checks/tests"), Some(NodeStatus::Pass));
    assert_eq!(status(&graph, "checks/types"), Some(NodeStatus::Pass));
    assert_eq!(status(&graph, "checks/lint"), Some(NodeStatus::Fail));
    assert_eq!(status(&graph, "Report"), Some(NodeStatus::Pass));
}

#[tokio::test]
async fn test_failed_handler_leaves_node_running() {
    init_test_tracing();
    let orchestrator = Orchestrator::new(RuntimeConfig::default());
    orchestrator
        .register_command_handler(Arc::new(
            ScriptedHandler::new("Publish")
                .declaring(["Published"])
                .failing("registry offline"),
        ))
        .unwrap();
    orchestrator.configure(|ctx| {
        ctx.reaction(ReactionRule::dispatch("ReleaseTagged", "Publish"));
    });

    assert!(orchestrator
        .send_command(Command::new("Publish", json!({})))
        .await
        .is_err());

    let graph = orchestrator.pipeline_graph(GraphOptions::with_status()).unwrap();
    assert_eq!(status(&graph, "default/Publish"), Some(NodeStatus::Running));
}

#[test]
fn test_missing_request_id_is_an_error() {
    let mut metadata = BTreeMap::new();
    metadata.insert(
        "Publish".to_string(),
        CommandMetadata::new("Publish").with_events(["Published"]),
    );
    let err = DependencyGraphBuilder::new()
        .with_reactions(vec![ReactionRule::dispatch("ReleaseTagged", "Publish").summary()])
        .with_metadata(metadata)
        .with_history(vec![Message::Command(Command::new("Publish", json!({})))])
        .build()
        .unwrap_err();

    assert_eq!(
        err,
        GraphError::MissingRequestId {
            command_type: "Publish".to_string()
        }
    );
}

#[test]
fn test_graph_serializes_camel_case() {
    let graph = ci_pipeline().pipeline_graph(GraphOptions::default()).unwrap();
    let value = serde_json::to_value(&graph).unwrap();

    assert_eq!(value["nodes"][0]["id"], "Report");
    assert!(value["nodes"][0].get("status").is_none());
    assert_eq!(value["edges"][0]["from"], "checks/lint");
    assert_eq!(value["edges"][0]["to"], "Report");
}

proptest! {
    /// An edge `a -> b` exists exactly when some rule triggered by one of
    /// `a`'s completion events declares `b`.
    #[test]
    fn prop_reaction_edges_match_declarations(
        rules in proptest::collection::vec((0..5_usize, 0..5_usize), 0..12)
    ) {
        let metadata: BTreeMap<String, CommandMetadata> = (0..5)
            .map(|i| {
                let name = format!("C{i}");
                let meta = CommandMetadata::new(name.clone()).with_events([format!("E{i}")]);
                (name, meta)
            })
            .collect();
        let reactions = rules
            .iter()
            .map(|(trigger, dispatched)| {
                ReactionRule::dispatch(format!("E{trigger}"), format!("C{dispatched}")).summary()
            })
            .collect();

        let graph = DependencyGraphBuilder::new()
            .with_reactions(reactions)
            .with_metadata(metadata)
            .build()
            .unwrap();

        let expected: BTreeSet<GraphEdge> = rules
            .iter()
            .map(|(trigger, dispatched)| GraphEdge {
                from: format!("default/C{trigger}"),
                to: format!("default/C{dispatched}"),
            })
            .collect();
        let expected: Vec<GraphEdge> = expected.into_iter().collect();
        prop_assert_eq!(&graph.edges, &expected);

        let ids = node_ids(&graph);
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        sorted.dedup();
        prop_assert_eq!(&ids, &sorted);
    }
}
