//! The orchestrator: registry, processor and bus wired together.
//!
//! [`Orchestrator`] is the surface outer layers (transports, config loaders,
//! tests) drive. It owns the [`HandlerRegistry`] and the [`EventProcessor`],
//! subscribes the processor to the bus, and interprets the
//! [`DispatchAction`]s that reactions and join handlers produce.
//!
//! # Submission
//!
//! Every command passes through one path before reaching the bus:
//!
//! 1. a missing `requestId` is filled with a fresh UUID v4
//! 2. a missing `correlationId` is inherited from the triggering event, if any
//! 3. a missing `timestamp` is taken from the clock
//! 4. the processor records the command (message log, join start)
//!
//! Dispatch actions run after the processor has released its lock:
//! `single` and `sequence` are awaited inline, `parallel` spawns each
//! submission onto the tokio runtime and returns once all are handed off.
//! [`Orchestrator::wait_idle`] waits for spawned submissions to drain.

use crate::bus::InProcessBus;
use crate::config::RuntimeConfig;
use crate::graph::{DependencyGraphBuilder, GraphError, GraphOptions, PipelineGraph};
use crate::join::{JoinInstanceInfo, JoinKey};
use crate::metrics::CommandMetrics;
use crate::processor::EventProcessor;
use crate::projector::StateProjector;
use crate::registration::{RegistrationContext, Registrations};
use crate::registry::HandlerRegistry;
use crate::{catch_panic, OrchestratorError};
use chrono::{DateTime, Utc};
use flowbus_core::dispatch::DispatchAction;
use flowbus_core::environment::{Clock, SystemClock};
use flowbus_core::event::{Command, Event, Message};
use flowbus_core::event_bus::{BusError, CommandBus, EventSubscriber};
use flowbus_core::handler::{CommandHandler, HandlerError};
use flowbus_core::metadata::CommandMetadata;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    config: RuntimeConfig,
    bus: Option<Arc<dyn CommandBus>>,
    clock: Arc<dyn Clock>,
    initial_state: Option<Value>,
}

impl OrchestratorBuilder {
    /// Use an external bus instead of a fresh [`InProcessBus`].
    #[must_use]
    pub fn bus(mut self, bus: Arc<dyn CommandBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Use `clock` for command timestamps and join start times.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Start the projection from `state` instead of `{}`.
    #[must_use]
    pub fn initial_state(mut self, state: Value) -> Self {
        self.initial_state = Some(state);
        self
    }

    /// Build and subscribe the processor to the bus.
    #[must_use]
    pub fn build(self) -> Orchestrator {
        let Self {
            config,
            bus,
            clock,
            initial_state,
        } = self;
        let bus = bus.unwrap_or_else(|| Arc::new(InProcessBus::with_clock(Arc::clone(&clock))));
        let registry = Arc::new(HandlerRegistry::new());
        let projector = initial_state.map_or_else(StateProjector::new, StateProjector::with_initial);
        let processor = EventProcessor::with_projector(
            &config,
            Arc::clone(&registry),
            Arc::clone(&clock),
            projector,
        );

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            bus.subscribe_all(Arc::new(ProcessorSubscriber {
                inner: weak.clone(),
            }));
            Inner {
                config,
                registry,
                processor,
                bus,
                clock,
                in_flight: Arc::new(AtomicUsize::new(0)),
            }
        });
        tracing::debug!("Orchestrator started");
        Orchestrator { inner }
    }
}

impl std::fmt::Debug for OrchestratorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorBuilder")
            .field("config", &self.config)
            .field("external_bus", &self.bus.is_some())
            .finish_non_exhaustive()
    }
}

struct Inner {
    config: RuntimeConfig,
    registry: Arc<HandlerRegistry>,
    processor: EventProcessor,
    bus: Arc<dyn CommandBus>,
    clock: Arc<dyn Clock>,
    in_flight: Arc<AtomicUsize>,
}

/// Decrements the in-flight counter when a spawned submission ends, even if
/// it panicked.
struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct ProcessorSubscriber {
    inner: Weak<Inner>,
}

impl EventSubscriber for ProcessorSubscriber {
    fn on_event(&self, event: Event) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let Some(inner) = self.inner.upgrade() else {
                tracing::trace!("Orchestrator dropped, ignoring event");
                return;
            };
            inner.handle_event(event).await;
        })
    }
}

impl Inner {
    fn accept(&self, mut command: Command, correlation_id: Option<&str>) -> Command {
        if command.request().is_none() {
            command.request_id = Some(uuid::Uuid::new_v4().to_string());
        }
        if command.correlation().is_none() {
            command.correlation_id = correlation_id.map(str::to_string);
        }
        if command.timestamp.is_none() {
            command.timestamp = Some(self.clock.now());
        }
        CommandMetrics::record_submitted();
        self.processor.on_command_started(&command);
        command
    }

    async fn deliver(&self, command: Command) -> Result<Vec<Event>, BusError> {
        self.bus.send_command(command).await
    }

    async fn handle_event(self: &Arc<Self>, event: Event) {
        let report = self.processor.process_event(&event);
        for dispatch in report.dispatches {
            if let Err(error) = self
                .run_dispatch(dispatch.action, dispatch.correlation_id.as_deref())
                .await
            {
                tracing::warn!(
                    event_type = %event.event_type,
                    error = %error,
                    "Dispatch triggered by event failed"
                );
            }
        }
    }

    async fn run_dispatch(
        self: &Arc<Self>,
        action: DispatchAction,
        correlation_id: Option<&str>,
    ) -> Result<(), OrchestratorError> {
        tracing::trace!(kind = action.kind(), "Running dispatch action");
        match action {
            DispatchAction::Single(command) => {
                let command = self.accept(command, correlation_id);
                self.deliver(command).await?;
            },
            DispatchAction::Sequence(commands) => {
                self.run_sequence(commands, correlation_id).await?;
            },
            DispatchAction::Custom(factory) => {
                let commands = catch_panic(factory.as_ref())
                    .map_err(|message| OrchestratorError::Dispatch(HandlerError::Panicked(message)))?;
                self.run_sequence(commands, correlation_id).await?;
            },
            DispatchAction::Parallel(commands) => {
                for command in commands {
                    let command = self.accept(command, correlation_id);
                    self.spawn_delivery(command);
                }
            },
        }
        Ok(())
    }

    async fn run_sequence(
        &self,
        commands: Vec<Command>,
        correlation_id: Option<&str>,
    ) -> Result<(), OrchestratorError> {
        let total = commands.len();
        for (idx, command) in commands.into_iter().enumerate() {
            tracing::trace!("Submitting sequential command {} of {}", idx + 1, total);
            let command = self.accept(command, correlation_id);
            self.deliver(command).await?;
        }
        Ok(())
    }

    fn spawn_delivery(self: &Arc<Self>, command: Command) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlightGuard(Arc::clone(&self.in_flight));
        let inner = Arc::clone(self);

        tokio::spawn(async move {
            let _guard = guard;
            let command_type = command.command_type.clone();
            if let Err(error) = inner.deliver(command).await {
                tracing::warn!(command_type = %command_type, error = %error, "Parallel submission failed");
            }
        });
    }
}

/// Command/event orchestration over a bus.
///
/// Cheap to clone; clones share all state.
///
/// # Example
///
/// ```
/// use flowbus_core::event::{Command, Event};
/// use flowbus_core::handler::FnHandler;
/// use flowbus_core::metadata::CommandMetadata;
/// use flowbus_runtime::config::RuntimeConfig;
/// use flowbus_runtime::orchestrator::Orchestrator;
/// use serde_json::json;
/// use std::sync::Arc;
///
/// # tokio_test::block_on(async {
/// let orchestrator = Orchestrator::new(RuntimeConfig::default());
/// orchestrator.register_command_handler(Arc::new(
///     FnHandler::new("CheckLint", |command| async move {
///         Ok(vec![Event::for_command(&command, "LintCheckPassed", json!({}))])
///     })
///     .with_metadata(CommandMetadata::new("CheckLint").with_events(["LintCheckPassed"])),
/// ))?;
/// orchestrator.configure(|ctx| {
///     ctx.fold("LintCheckPassed", |mut state, _event| {
///         state["lint"] = json!("passed");
///         Ok(state)
///     });
/// });
///
/// orchestrator.send_command(Command::new("CheckLint", json!({}))).await?;
/// assert_eq!(orchestrator.property("lint"), Some(json!("passed")));
/// # Ok::<(), flowbus_runtime::OrchestratorError>(())
/// # }).unwrap();
/// ```
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Orchestrator over a fresh [`InProcessBus`] with wall-clock time.
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        Self::builder(config).build()
    }

    /// Start a builder.
    #[must_use]
    pub fn builder(config: RuntimeConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            bus: None,
            clock: Arc::new(SystemClock),
            initial_state: None,
        }
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// The handler registry.
    #[must_use]
    pub fn registry(&self) -> &HandlerRegistry {
        &self.inner.registry
    }

    /// Validate and register one command handler with the registry and bus.
    ///
    /// A handler the bus refuses is removed from the registry again, so the
    /// two never disagree.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Registration`] if the handler is
    /// malformed or already registered, or [`OrchestratorError::Bus`] if the
    /// bus refuses it.
    pub fn register_command_handler(
        &self,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<(), OrchestratorError> {
        self.inner.registry.register(Arc::clone(&handler))?;
        if let Err(error) = self.inner.bus.register_command_handler(Arc::clone(&handler)) {
            self.inner.registry.unregister(handler.name());
            tracing::warn!(command = %handler.name(), error = %error, "Bus refused command handler");
            return Err(error.into());
        }
        Ok(())
    }

    /// Register a batch of handlers, skipping and logging rejected ones.
    ///
    /// Returns the rejections.
    pub fn register_command_handlers<I>(&self, handlers: I) -> Vec<OrchestratorError>
    where
        I: IntoIterator<Item = Arc<dyn CommandHandler>>,
    {
        handlers
            .into_iter()
            .filter_map(|handler| {
                self.register_command_handler(handler)
                    .map_err(|error| {
                        tracing::warn!(error = %error, "Skipping command handler");
                        error
                    })
                    .err()
            })
            .collect()
    }

    /// Install captured registrations.
    pub fn install(&self, registrations: Registrations) {
        let Registrations {
            reactions,
            folds,
            joins,
        } = registrations;
        tracing::info!(
            reactions = reactions.len(),
            folds = folds.len(),
            joins = joins.len(),
            "Installing registrations"
        );
        for rule in reactions {
            self.inner.processor.add_reaction(rule);
        }
        for fold in folds {
            self.inner.registry.register_fold(fold);
        }
        for join in joins {
            self.inner.processor.add_join(join);
        }
    }

    /// Run `define` against a fresh [`RegistrationContext`] and install what
    /// it registered.
    pub fn configure<F>(&self, define: F)
    where
        F: FnOnce(&mut RegistrationContext),
    {
        let mut ctx = RegistrationContext::new();
        define(&mut ctx);
        self.install(ctx.capture());
    }

    /// Submit a command and wait for its handler and everything it triggers,
    /// except `parallel` submissions (see [`wait_idle`](Self::wait_idle)).
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Bus`] if the bus has no handler, the
    /// handler fails, or the bus is closed.
    #[tracing::instrument(skip(self, command), fields(command_type = %command.command_type), name = "orchestrator_send")]
    pub async fn send_command(&self, command: Command) -> Result<Vec<Event>, OrchestratorError> {
        let command = self.inner.accept(command, None);
        Ok(self.inner.deliver(command).await?)
    }

    /// Interpret a dispatch action, inheriting `correlation_id` where
    /// commands carry none.
    ///
    /// # Errors
    ///
    /// Returns the first submission error of a `single`, `sequence` or
    /// `custom` action; a `sequence` stops at its first failure. A panicking
    /// `custom` factory yields [`OrchestratorError::Dispatch`].
    #[tracing::instrument(skip(self, action), fields(kind = action.kind()), name = "orchestrator_dispatch")]
    pub async fn dispatch(
        &self,
        action: DispatchAction,
        correlation_id: Option<&str>,
    ) -> Result<(), OrchestratorError> {
        self.inner.run_dispatch(action, correlation_id).await
    }

    /// A copy of the projection.
    #[must_use]
    pub fn state(&self) -> Value {
        self.inner.processor.state()
    }

    /// A value inside the projection by dotted path.
    #[must_use]
    pub fn property(&self, path: &str) -> Option<Value> {
        self.inner.processor.property(path)
    }

    /// Event history, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<Event> {
        self.inner.processor.history()
    }

    /// Commands and events, oldest first.
    #[must_use]
    pub fn message_log(&self) -> Vec<Message> {
        self.inner.processor.message_log()
    }

    /// Metadata of every registered command that has some.
    #[must_use]
    pub fn command_metadata(&self) -> BTreeMap<String, CommandMetadata> {
        self.inner.registry.metadata()
    }

    /// Keys of live join instances.
    #[must_use]
    pub fn live_join_instances(&self) -> Vec<JoinKey> {
        self.inner.processor.live_join_instances()
    }

    /// Diagnostics for live join instances.
    #[must_use]
    pub fn join_instance_info(&self) -> Vec<JoinInstanceInfo> {
        self.inner.processor.join_instance_info()
    }

    /// Remove a join instance without firing it.
    pub fn evict_join_instance(&self, key: &JoinKey) -> bool {
        self.inner.processor.evict_join_instance(key)
    }

    /// Remove join instances started before `cutoff`.
    pub fn evict_join_instances_before(&self, cutoff: DateTime<Utc>) -> Vec<JoinKey> {
        self.inner.processor.evict_join_instances_before(cutoff)
    }

    /// Build the pipeline graph from the installed registrations.
    ///
    /// # Errors
    ///
    /// With [`GraphOptions::with_status`], returns
    /// [`GraphError::MissingRequestId`] if a logged command lacks a request
    /// id.
    pub fn pipeline_graph(&self, options: GraphOptions) -> Result<PipelineGraph, GraphError> {
        let mut builder = DependencyGraphBuilder::new()
            .with_reactions(self.inner.processor.reactions())
            .with_joins(self.inner.processor.join_templates())
            .with_metadata(self.inner.registry.metadata());
        if options.with_status {
            builder = builder.with_history(self.inner.processor.message_log());
        }
        builder.build()
    }

    /// Number of spawned submissions still running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Wait until no spawned submission is running.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::IdleTimeout`] with the number still
    /// running if `timeout` elapses first.
    pub async fn wait_idle(&self, timeout: Duration) -> Result<(), OrchestratorError> {
        let start = std::time::Instant::now();
        let poll_interval = self.inner.config.idle_poll_interval;

        loop {
            let pending = self.in_flight();
            if pending == 0 {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                tracing::error!(pending, "Timed out waiting for in-flight submissions");
                return Err(OrchestratorError::IdleTimeout(pending));
            }
            tracing::trace!(
                pending,
                elapsed_ms = start.elapsed().as_millis(),
                "Waiting for in-flight submissions"
            );
            tokio::time::sleep(poll_interval).await;
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.inner.config)
            .field("registry", &self.inner.registry)
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use flowbus_core::handler::FnHandler;
    use serde_json::json;

    fn echo(name: &str, event_type: &'static str) -> Arc<dyn CommandHandler> {
        Arc::new(
            FnHandler::new(name, move |command| async move {
                Ok(vec![Event::for_command(&command, event_type, json!({}))])
            })
            .with_metadata(CommandMetadata::new(name).with_events([event_type])),
        )
    }

    #[tokio::test]
    async fn assigns_request_id_and_timestamp() {
        let orchestrator = Orchestrator::new(RuntimeConfig::default());
        orchestrator.register_command_handler(echo("A", "ADone")).unwrap();

        let events = orchestrator
            .send_command(Command::new("A", json!({})).with_correlation_id("c1"))
            .await
            .unwrap();

        let logged = orchestrator.message_log();
        let Message::Command(command) = &logged[0] else {
            unreachable!("first message is the command");
        };
        assert!(command.request().is_some());
        assert!(command.timestamp.is_some());
        assert_eq!(events[0].request(), command.request());
        assert_eq!(events[0].correlation(), Some("c1"));
    }

    #[tokio::test]
    async fn batch_registration_reports_rejections() {
        let orchestrator = Orchestrator::new(RuntimeConfig::default());
        let rejected = orchestrator.register_command_handlers(vec![
            echo("A", "ADone"),
            echo("A", "ADone"),
            echo("B", "BDone"),
        ]);
        assert_eq!(rejected.len(), 1);
        assert!(matches!(rejected[0], OrchestratorError::Registration(_)));
        assert_eq!(orchestrator.registry().handler_names(), vec!["A", "B"]);
    }

    #[tokio::test]
    async fn unknown_command_is_a_bus_error() {
        let orchestrator = Orchestrator::new(RuntimeConfig::default());
        let err = orchestrator
            .send_command(Command::new("Nope", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Bus(BusError::NoHandler(_))));
    }

    #[tokio::test]
    async fn wait_idle_returns_immediately_when_nothing_runs() {
        let orchestrator = Orchestrator::new(RuntimeConfig::default());
        assert!(orchestrator.wait_idle(Duration::from_millis(1)).await.is_ok());
        assert_eq!(orchestrator.in_flight(), 0);
    }
}
