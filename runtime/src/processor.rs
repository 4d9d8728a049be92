//! Event Processor: the global event subscriber.
//!
//! For every event, in order:
//!
//! 1. append to the bounded history (and the message log)
//! 2. apply the matching fold to the projection
//! 3. run every reaction rule registered for the event type
//! 4. forward the event to the Join Synchronizer
//!
//! A failing fold or reaction is logged and counted; it never stops the
//! remaining steps.
//!
//! # Locking
//!
//! Two locks are involved. The sequencer is held for the whole of one event
//! (and for each command start), so events are processed strictly one at a
//! time. The state lock guards history, projection, rules and join instances
//! and is held only while they are read or written: the fold commits under
//! it, but reaction rules and join handlers run after it is released. They
//! may therefore read [`EventProcessor::state`] or any other accessor.
//! Commands they produce are returned to the caller as
//! [`CorrelatedDispatch`] values and submitted after processing ends.

use crate::catch_panic;
use crate::config::RuntimeConfig;
use crate::join::{
    CorrelatedDispatch, JoinFiring, JoinInstanceInfo, JoinKey, JoinRegistration, JoinRun,
    JoinSynchronizer, JoinTemplateInfo, PendingJoin,
};
use crate::lock::lock;
use crate::metrics::ProcessorMetrics;
use crate::projector::StateProjector;
use crate::registration::{ReactionRule, ReactionSummary};
use crate::registry::HandlerRegistry;
use chrono::{DateTime, Utc};
use flowbus_core::environment::Clock;
use flowbus_core::event::{Command, Event, Message};
use flowbus_core::handler::HandlerError;
use flowbus_core::projection::FoldError;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// What processing one event did.
#[derive(Debug, Default)]
pub struct EventReport {
    /// The fold failed; the projection is unchanged.
    pub fold_error: Option<FoldError>,
    /// Reaction rules that failed, with the error each returned.
    pub reaction_errors: Vec<HandlerError>,
    /// Join handlers that fired.
    pub firings: Vec<JoinFiring>,
    /// Commands to submit, reactions first, then join handlers.
    pub dispatches: Vec<CorrelatedDispatch>,
}

struct ProcessorState {
    history: VecDeque<Event>,
    message_log: VecDeque<Message>,
    projector: StateProjector,
    reactions: HashMap<String, Vec<ReactionRule>>,
    reaction_order: Vec<ReactionSummary>,
    joins: JoinSynchronizer,
}

/// Drives history, projection, reactions and joins for every event.
pub struct EventProcessor {
    registry: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
    history_capacity: usize,
    message_log_capacity: usize,
    sequencer: Mutex<()>,
    state: Mutex<ProcessorState>,
}

impl EventProcessor {
    /// Create a processor with an empty projection.
    #[must_use]
    pub fn new(config: &RuntimeConfig, registry: Arc<HandlerRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self::with_projector(config, registry, clock, StateProjector::new())
    }

    /// Create a processor starting from `projector`.
    #[must_use]
    pub fn with_projector(
        config: &RuntimeConfig,
        registry: Arc<HandlerRegistry>,
        clock: Arc<dyn Clock>,
        projector: StateProjector,
    ) -> Self {
        Self {
            registry,
            clock,
            history_capacity: config.history_capacity.max(1),
            message_log_capacity: config.message_log_capacity.max(1),
            sequencer: Mutex::new(()),
            state: Mutex::new(ProcessorState {
                history: VecDeque::with_capacity(config.history_capacity.min(1024)),
                message_log: VecDeque::with_capacity(config.message_log_capacity.min(1024)),
                projector,
                reactions: HashMap::new(),
                reaction_order: Vec::new(),
                joins: JoinSynchronizer::new(config.rearm_policy),
            }),
        }
    }

    /// Add a reaction rule. Rules for the same event type run in
    /// registration order.
    pub fn add_reaction(&self, rule: ReactionRule) {
        let mut state = lock(&self.state);
        state.reaction_order.push(rule.summary());
        state
            .reactions
            .entry(rule.event_type().to_string())
            .or_default()
            .push(rule);
    }

    /// Register a join template; returns its id.
    pub fn add_join(&self, registration: JoinRegistration) -> String {
        lock(&self.state).joins.register_template(registration)
    }

    /// Note a command that is about to be handed to the bus.
    pub fn on_command_started(&self, command: &Command) {
        let now = self.clock.now();
        let _turn = lock(&self.sequencer);
        let mut state = lock(&self.state);
        push_bounded(
            &mut state.message_log,
            Message::Command(command.clone()),
            self.message_log_capacity,
        );
        state.joins.on_command_started(command, now);
    }

    /// Process one event.
    pub fn process_event(&self, event: &Event) -> EventReport {
        let _turn = lock(&self.sequencer);
        let mut report = EventReport::default();

        let rules = {
            let mut state = lock(&self.state);
            let state = &mut *state;

            push_bounded(&mut state.history, event.clone(), self.history_capacity);
            push_bounded(
                &mut state.message_log,
                Message::Event(event.clone()),
                self.message_log_capacity,
            );
            ProcessorMetrics::record_event();

            if let Err(error) = state.projector.apply_event(event, self.registry.as_ref()) {
                tracing::warn!(event_type = %event.event_type, error = %error, "Fold failed");
                ProcessorMetrics::record_fold_error();
                report.fold_error = Some(error);
            }

            state
                .reactions
                .get(&event.event_type)
                .cloned()
                .unwrap_or_default()
        };

        for rule in &rules {
            let reaction = catch_panic(|| rule.react(event))
                .unwrap_or_else(|message| Err(HandlerError::Panicked(message)));
            match reaction {
                Ok(reaction) => {
                    if let Some(action) = reaction.into_action() {
                        tracing::debug!(
                            event_type = %event.event_type,
                            kind = action.kind(),
                            "Reaction dispatching"
                        );
                        report.dispatches.push(CorrelatedDispatch {
                            correlation_id: event.correlation_id.clone(),
                            action,
                        });
                    }
                }
                Err(error) => {
                    tracing::warn!(event_type = %event.event_type, error = %error, "Reaction failed");
                    ProcessorMetrics::record_reaction_error();
                    report.reaction_errors.push(error);
                }
            }
        }

        let pending = lock(&self.state).joins.take_settled(event, &self.registry);
        if pending.is_empty() {
            return report;
        }
        let runs: Vec<JoinRun> = pending.into_iter().map(PendingJoin::run).collect();

        let mut state = lock(&self.state);
        for run in runs {
            let firing = state.joins.resolve(run, &mut report.dispatches);
            report.firings.push(firing);
        }
        drop(state);

        report
    }

    /// Event history, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<Event> {
        lock(&self.state).history.iter().cloned().collect()
    }

    /// Message log, oldest first.
    #[must_use]
    pub fn message_log(&self) -> Vec<Message> {
        lock(&self.state).message_log.iter().cloned().collect()
    }

    /// A copy of the projection.
    #[must_use]
    pub fn state(&self) -> Value {
        lock(&self.state).projector.state().clone()
    }

    /// A value inside the projection by dotted path.
    #[must_use]
    pub fn property(&self, path: &str) -> Option<Value> {
        lock(&self.state).projector.property(path).cloned()
    }

    /// Reaction summaries in registration order.
    #[must_use]
    pub fn reactions(&self) -> Vec<ReactionSummary> {
        lock(&self.state).reaction_order.clone()
    }

    /// Registered join templates.
    #[must_use]
    pub fn join_templates(&self) -> Vec<JoinTemplateInfo> {
        lock(&self.state).joins.templates()
    }

    /// Keys of live join instances.
    #[must_use]
    pub fn live_join_instances(&self) -> Vec<JoinKey> {
        lock(&self.state).joins.live_instances()
    }

    /// Diagnostics for live join instances.
    #[must_use]
    pub fn join_instance_info(&self) -> Vec<JoinInstanceInfo> {
        lock(&self.state).joins.instance_info()
    }

    /// Remove one join instance without firing it.
    pub fn evict_join_instance(&self, key: &JoinKey) -> bool {
        lock(&self.state).joins.evict(key)
    }

    /// Remove every join instance started before `cutoff`.
    pub fn evict_join_instances_before(&self, cutoff: DateTime<Utc>) -> Vec<JoinKey> {
        lock(&self.state).joins.evict_started_before(cutoff)
    }
}

impl std::fmt::Debug for EventProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventProcessor")
            .field("history_capacity", &self.history_capacity)
            .field("message_log_capacity", &self.message_log_capacity)
            .finish_non_exhaustive()
    }
}

fn push_bounded<T>(buffer: &mut VecDeque<T>, item: T, capacity: usize) {
    while buffer.len() >= capacity {
        buffer.pop_front();
    }
    buffer.push_back(item);
}
