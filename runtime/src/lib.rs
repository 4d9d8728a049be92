//! # Flowbus Runtime
//!
//! Runtime implementation of the flowbus command/event orchestration layer.
//!
//! This crate turns the contracts in `flowbus-core` into a working system:
//! commands are routed to handlers, the resulting events are projected into
//! a single shared state, reaction rules dispatch follow-up commands, and
//! join handlers fire exactly once when a set of commands sharing a
//! correlation id has completed.
//!
//! ## Core Components
//!
//! - **Handler Registry**: handlers, their metadata, and folds
//! - **State Projector**: the single projection, mutated only by folds
//! - **Event Processor**: history, projection, reactions and joins per event
//! - **Join Synchronizer**: correlation-scoped completion tracking
//! - **Dependency Graph Builder**: a static command graph with optional status
//! - **Orchestrator**: wires the above to a bus and runs dispatch actions
//!
//! ## Example
//!
//! ```
//! use flowbus_core::event::{Command, Event};
//! use flowbus_core::handler::FnHandler;
//! use flowbus_core::metadata::CommandMetadata;
//! use flowbus_runtime::join::{JoinContext, SettledEvents};
//! use flowbus_runtime::{Orchestrator, RuntimeConfig};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let orchestrator = Orchestrator::new(RuntimeConfig::default());
//! for (name, done) in [("CheckTests", "TestsCheckPassed"), ("CheckLint", "LintCheckPassed")] {
//!     orchestrator.register_command_handler(Arc::new(
//!         FnHandler::new(name, move |command| async move {
//!             Ok(vec![Event::for_command(&command, done, json!({}))])
//!         })
//!         .with_metadata(CommandMetadata::new(name).with_events([done])),
//!     ))?;
//! }
//!
//! orchestrator.configure(|ctx| {
//!     ctx.settled(["CheckTests", "CheckLint"], |_events: &SettledEvents, _ctx: &mut JoinContext| {
//!         Ok(())
//!     });
//! });
//!
//! for name in ["CheckTests", "CheckLint"] {
//!     let command = Command::new(name, json!({})).with_correlation_id("run-1");
//!     orchestrator.send_command(command).await?;
//! }
//! assert!(orchestrator.live_join_instances().is_empty());
//! # Ok::<(), flowbus_runtime::OrchestratorError>(())
//! # }).unwrap();
//! ```

use flowbus_core::event_bus::BusError;
use flowbus_core::handler::HandlerError;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use thiserror::Error;

/// Runtime configuration
pub mod config;

/// Prometheus metrics for observability
pub mod metrics;

/// Handler registry
pub mod registry;

/// State projector
pub mod projector;

/// Reaction rules and the registration context
pub mod registration;

/// Join synchronizer
pub mod join;

/// Event processor
pub mod processor;

/// Dependency graph builder
pub mod graph;

/// In-process command bus
pub mod bus;

/// Orchestrator facade
pub mod orchestrator;

mod lock;

pub use bus::InProcessBus;
pub use config::{ConfigError, RearmPolicy, RuntimeConfig};
pub use graph::{DependencyGraphBuilder, GraphError, GraphOptions, PipelineGraph};
pub use join::{JoinContext, JoinKey, JoinOutcome, JoinRegistration, SettledEvents};
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use registration::{ReactionRule, RegistrationContext, Registrations};
pub use registry::{HandlerRegistry, RegistrationError};

/// Errors surfaced by the [`Orchestrator`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    /// The bus refused or failed a command.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// A handler was refused at registration time.
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    /// A dispatch action could not produce its commands.
    #[error("Dispatch failed: {0}")]
    Dispatch(HandlerError),

    /// The pipeline graph could not be built.
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Spawned submissions were still running when the wait timed out.
    #[error("Timed out with {0} submissions still in flight")]
    IdleTimeout(usize),
}

/// Run `f`, converting a panic into its message.
pub(crate) fn catch_panic<T>(f: impl FnOnce() -> T) -> Result<T, String> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| panic_message(&*payload))
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}
