//! Reaction rules and the registration context.
//!
//! A [`ReactionRule`] maps one event type to a [`Reaction`]. Rules run
//! synchronously inside event processing; any commands they return are
//! dispatched after processing of the current event has finished.
//!
//! [`RegistrationContext`] is what a pipeline definition is written against.
//! It collects reactions, folds and joins; the orchestrator then drains it
//! with [`RegistrationContext::capture`] and installs everything at once.

use crate::join::{JoinContext, JoinOutcome, JoinRegistration, SettledEvents};
use flowbus_core::dispatch::Reaction;
use flowbus_core::event::{Command, Event};
use flowbus_core::handler::HandlerError;
use flowbus_core::projection::{FoldError, FoldRegistration};
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;

/// A reaction: event in, commands out.
pub type ReactionFn = Arc<dyn Fn(&Event) -> Result<Reaction, HandlerError> + Send + Sync>;

/// A rule reacting to one event type.
#[derive(Clone)]
pub struct ReactionRule {
    event_type: String,
    react: ReactionFn,
    dispatches: Vec<String>,
}

impl ReactionRule {
    /// React to `event_type` with `f`.
    ///
    /// `f` may return anything convertible into a [`Reaction`]: `()`, a
    /// [`Command`], a `Vec<Command>`, an `Option<Command>`, or a
    /// [`DispatchAction`](flowbus_core::dispatch::DispatchAction).
    pub fn new<F, R>(event_type: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Event) -> Result<R, HandlerError> + Send + Sync + 'static,
        R: Into<Reaction>,
    {
        Self {
            event_type: event_type.into(),
            react: Arc::new(move |event| f(event).map(Into::into)),
            dispatches: Vec::new(),
        }
    }

    /// React to `event_type` by dispatching a `command_type` command with an
    /// empty object payload.
    pub fn dispatch(event_type: impl Into<String>, command_type: impl Into<String>) -> Self {
        let command_type = command_type.into();
        let declared = command_type.clone();
        Self::new(event_type, move |_| {
            Ok(Command::new(command_type.clone(), json!({})))
        })
        .dispatching([declared])
    }

    /// Declare which command types this rule may dispatch, for the pipeline
    /// graph.
    #[must_use]
    pub fn dispatching<I, S>(mut self, command_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dispatches = command_types.into_iter().map(Into::into).collect();
        self
    }

    /// Event type this rule reacts to.
    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Run the rule.
    ///
    /// # Errors
    ///
    /// Propagates the rule's [`HandlerError`].
    pub fn react(&self, event: &Event) -> Result<Reaction, HandlerError> {
        (self.react)(event)
    }

    /// Static description for graph building.
    #[must_use]
    pub fn summary(&self) -> ReactionSummary {
        ReactionSummary {
            event_type: self.event_type.clone(),
            dispatches: self.dispatches.clone(),
        }
    }
}

impl fmt::Debug for ReactionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactionRule")
            .field("event_type", &self.event_type)
            .field("dispatches", &self.dispatches)
            .finish_non_exhaustive()
    }
}

/// What a reaction rule is known to do without running it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionSummary {
    /// Triggering event type.
    pub event_type: String,
    /// Declared dispatched command types.
    pub dispatches: Vec<String>,
}

/// Everything a pipeline definition registered.
#[derive(Debug, Default)]
pub struct Registrations {
    /// Reaction rules, in registration order.
    pub reactions: Vec<ReactionRule>,
    /// Fold registrations, in registration order.
    pub folds: Vec<FoldRegistration>,
    /// Join registrations, in registration order.
    pub joins: Vec<JoinRegistration>,
}

impl Registrations {
    /// Whether nothing was registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reactions.is_empty() && self.folds.is_empty() && self.joins.is_empty()
    }
}

/// Collects registrations from a pipeline definition.
///
/// # Example
///
/// ```
/// use flowbus_core::event::{Command, Event};
/// use flowbus_runtime::registration::RegistrationContext;
/// use serde_json::json;
///
/// let mut ctx = RegistrationContext::new();
/// ctx.on("ChangesDetected", |_event: &Event| {
///     Ok(vec![
///         Command::new("CheckTests", json!({})),
///         Command::new("CheckLint", json!({})),
///     ])
/// })
/// .fold("TestsCheckPassed", |mut state, _event| {
///     state["tests"] = json!("passed");
///     Ok(state)
/// });
///
/// let captured = ctx.capture();
/// assert_eq!(captured.reactions.len(), 1);
/// assert_eq!(captured.folds.len(), 1);
/// assert!(ctx.capture().is_empty());
/// ```
#[derive(Debug, Default)]
pub struct RegistrationContext {
    pending: Registrations,
}

impl RegistrationContext {
    /// Create an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reaction to `event_type`.
    pub fn on<F, R>(&mut self, event_type: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&Event) -> Result<R, HandlerError> + Send + Sync + 'static,
        R: Into<Reaction>,
    {
        self.reaction(ReactionRule::new(event_type, f))
    }

    /// Register a prepared reaction rule.
    pub fn reaction(&mut self, rule: ReactionRule) -> &mut Self {
        self.pending.reactions.push(rule);
        self
    }

    /// Register a fold for `event_type`.
    pub fn fold<F>(&mut self, event_type: impl Into<String>, reduce: F) -> &mut Self
    where
        F: Fn(Value, &Event) -> Result<Value, FoldError> + Send + Sync + 'static,
    {
        self.pending
            .folds
            .push(FoldRegistration::new(event_type, reduce));
        self
    }

    /// Register a join over `command_types`.
    pub fn settled<I, S, F, O>(&mut self, command_types: I, handler: F) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&SettledEvents, &mut JoinContext) -> Result<O, HandlerError> + Send + Sync + 'static,
        O: Into<JoinOutcome>,
    {
        self.join(JoinRegistration::new(command_types, handler))
    }

    /// Register a prepared join.
    pub fn join(&mut self, registration: JoinRegistration) -> &mut Self {
        self.pending.joins.push(registration);
        self
    }

    /// Take everything registered so far, leaving the context empty.
    pub fn capture(&mut self) -> Registrations {
        std::mem::take(&mut self.pending)
    }
}
