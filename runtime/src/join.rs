//! Join Synchronizer: fire a handler exactly once after every command in a
//! declared set has completed within one correlation scope.
//!
//! # Model
//!
//! - A **template** is created per distinct set of command types (`settled`
//!   registration). Its id is the sorted list of types rendered as a JSON
//!   array, so no type name can make two different sets collide.
//! - An **instance** is created lazily per `(template, correlation)` when the
//!   first tracked command of that correlation starts. It owns one
//!   [`CommandTracker`] per declared command type.
//! - Instances live in an arena keyed by [`JoinKey`] and move through an
//!   explicit state machine:
//!
//! ```text
//!            first tracked command starts
//!                        │
//!                        ▼
//!                 ┌────────────┐  persist   ┌────────────┐
//!      ┌─────────►│  Waiting   │◄───────────│  Settled   │
//!      │          └─────┬──────┘            └─────┬──────┘
//!      │                │ all trackers complete   │ done / error / evicted
//!      │                └────────────────────────►│
//!      │                                          ▼
//!      │                                   ┌────────────┐
//!      └── (new correlation) ──────────────│  Cleaned   │
//!                                          └────────────┘
//! ```
//!
//! # Routing
//!
//! An event is routed only to live instances of its own correlation id. Within
//! an instance the producing command is resolved first by the event's
//! `requestId` (for commands the instance saw start), then by the metadata
//! index of completion events. Every routed event is appended to its tracker;
//! the tracker completes only on an event type the command declares in its
//! metadata `events`. A declared failure event therefore completes a tracker
//! just like a success event.
//!
//! The completion index is cached per registry generation, so handlers
//! registered after an instance exists are still taken into account.
//!
//! # Re-entrancy
//!
//! Join handlers never submit commands directly. They queue
//! [`DispatchAction`]s on the [`JoinContext`]; the synchronizer drains the
//! queue into the caller's sink after the handler returns, tagged with the
//! instance's correlation id.
//!
//! Settling is split in two so that handlers can run with no lock held:
//! `take_settled` marks completed instances Settled and hands out an owned
//! copy of their events, and `resolve` applies the handler's result later.
//! [`JoinSynchronizer::on_event_received`] does both in one call.

use crate::catch_panic;
use crate::config::RearmPolicy;
use crate::metrics::JoinMetrics;
use crate::registry::HandlerRegistry;
use chrono::{DateTime, Utc};
use flowbus_core::dispatch::DispatchAction;
use flowbus_core::event::{Command, Event};
use flowbus_core::handler::HandlerError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Events collected per tracked command type, handed to a join handler.
pub type SettledEvents = BTreeMap<String, Vec<Event>>;

/// A join handler.
pub type JoinFn =
    Arc<dyn Fn(&SettledEvents, &mut JoinContext) -> Result<JoinOutcome, HandlerError> + Send + Sync>;

/// What a join handler asks for after it ran.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinOutcome {
    /// Reset the trackers and keep waiting instead of cleaning up.
    #[serde(default)]
    pub persist: bool,
}

impl JoinOutcome {
    /// Clean the instance up.
    #[must_use]
    pub const fn done() -> Self {
        Self { persist: false }
    }

    /// Reset and keep the instance.
    #[must_use]
    pub const fn persist() -> Self {
        Self { persist: true }
    }
}

impl From<()> for JoinOutcome {
    fn from((): ()) -> Self {
        Self::done()
    }
}

/// Handle given to a join handler while it runs.
#[derive(Debug)]
pub struct JoinContext {
    correlation_id: String,
    queued: Vec<DispatchAction>,
}

impl JoinContext {
    fn new(correlation_id: &str) -> Self {
        Self {
            correlation_id: correlation_id.to_string(),
            queued: Vec::new(),
        }
    }

    /// Correlation scope that settled.
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Queue a dispatch action; it runs after the handler returns.
    pub fn dispatch(&mut self, action: DispatchAction) {
        self.queued.push(action);
    }

    /// Queue a single command.
    pub fn send(&mut self, command: Command) {
        self.dispatch(DispatchAction::Single(command));
    }
}

/// A dispatch action scoped to the correlation it was produced in.
#[derive(Debug, Clone)]
pub struct CorrelatedDispatch {
    /// Correlation id inherited by commands that carry none.
    pub correlation_id: Option<String>,
    /// What to submit.
    pub action: DispatchAction,
}

/// Arena key of a join instance.
///
/// Ordered by correlation first so that all instances of one correlation are
/// contiguous.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinKey {
    /// Correlation scope.
    pub correlation_id: String,
    /// Template id.
    pub template_id: String,
}

impl JoinKey {
    /// Build a key.
    #[must_use]
    pub fn new(template_id: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            template_id: template_id.into(),
        }
    }
}

impl fmt::Display for JoinKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.template_id, self.correlation_id)
    }
}

/// Lifecycle state of a join instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinState {
    /// At least one tracker is incomplete.
    Waiting,
    /// All trackers completed; the handler is running.
    Settled,
    /// Removed from the arena.
    Cleaned,
}

/// Tracking state for one command type inside an instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandTracker {
    /// Tracked command type.
    pub command_type: String,
    /// Whether a declared completion event arrived.
    pub completed: bool,
    /// Every event attributed to this command, in arrival order.
    pub events: Vec<Event>,
}

impl CommandTracker {
    fn new(command_type: &str) -> Self {
        Self {
            command_type: command_type.to_string(),
            completed: false,
            events: Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.completed = false;
        self.events.clear();
    }
}

/// A join registration: the command types to wait for and the handler.
#[derive(Clone)]
pub struct JoinRegistration {
    command_types: Vec<String>,
    handler: JoinFn,
    dispatches: Vec<String>,
}

impl JoinRegistration {
    /// Wait for every type in `command_types`, then run `handler`.
    pub fn new<I, S, F, O>(command_types: I, handler: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&SettledEvents, &mut JoinContext) -> Result<O, HandlerError> + Send + Sync + 'static,
        O: Into<JoinOutcome>,
    {
        Self {
            command_types: command_types.into_iter().map(Into::into).collect(),
            handler: Arc::new(move |events, ctx| handler(events, ctx).map(Into::into)),
            dispatches: Vec::new(),
        }
    }

    /// Declare the command types the handler dispatches, for the pipeline
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

    /// Tracked command types, as declared.
    #[must_use]
    pub fn command_types(&self) -> &[String] {
        &self.command_types
    }

    /// Declared dispatched command types.
    #[must_use]
    pub fn declared_dispatches(&self) -> &[String] {
        &self.dispatches
    }

    /// Template id: sorted, deduplicated command types as a JSON array.
    #[must_use]
    pub fn template_id(&self) -> String {
        template_id(&self.command_types)
    }
}

impl fmt::Debug for JoinRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinRegistration")
            .field("command_types", &self.command_types)
            .field("dispatches", &self.dispatches)
            .finish_non_exhaustive()
    }
}

fn template_id(command_types: &[String]) -> String {
    let sorted: BTreeSet<&str> = command_types.iter().map(String::as_str).collect();
    serde_json::Value::from(sorted.into_iter().collect::<Vec<_>>()).to_string()
}

/// A registered template.
#[derive(Clone)]
struct JoinTemplate {
    id: String,
    command_types: BTreeSet<String>,
    handler: JoinFn,
    dispatches: Vec<String>,
}

/// Read-only view of a template, for graph building and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinTemplateInfo {
    /// Template id.
    pub id: String,
    /// Tracked command types, sorted.
    pub command_types: Vec<String>,
    /// Declared dispatched command types.
    pub dispatches: Vec<String>,
}

struct JoinInstance {
    state: JoinState,
    trackers: BTreeMap<String, CommandTracker>,
    request_ids: HashMap<String, String>,
    started_at: DateTime<Utc>,
    rearm_count: u32,
}

impl JoinInstance {
    fn new(template: &JoinTemplate, started_at: DateTime<Utc>) -> Self {
        Self {
            state: JoinState::Waiting,
            trackers: template
                .command_types
                .iter()
                .map(|t| (t.clone(), CommandTracker::new(t)))
                .collect(),
            request_ids: HashMap::new(),
            started_at,
            rearm_count: 0,
        }
    }

    fn all_completed(&self) -> bool {
        self.trackers.values().all(|t| t.completed)
    }

    fn completed_count(&self) -> usize {
        self.trackers.values().filter(|t| t.completed).count()
    }

    fn rearm(&mut self) {
        for tracker in self.trackers.values_mut() {
            tracker.reset();
        }
        self.request_ids.clear();
        self.rearm_count += 1;
        self.state = JoinState::Waiting;
    }
}

/// Diagnostics for one live instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinInstanceInfo {
    /// Arena key.
    pub key: JoinKey,
    /// Current state.
    pub state: JoinState,
    /// When the first tracked command started.
    pub started_at: DateTime<Utc>,
    /// Completed trackers.
    pub completed: usize,
    /// All trackers.
    pub total: usize,
    /// How many times the instance re-armed.
    pub rearm_count: u32,
}

/// How a settled instance ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinResolution {
    /// Handler succeeded; instance removed.
    Cleaned,
    /// Handler asked to persist; trackers reset.
    Rearmed,
    /// Handler asked to persist but the re-arm policy refused; instance removed.
    RearmRefused,
    /// Handler failed; instance removed.
    Failed(HandlerError),
}

/// One handler firing.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinFiring {
    /// Which instance fired.
    pub key: JoinKey,
    /// The events handed to the handler.
    pub events: SettledEvents,
    /// What happened afterwards.
    pub resolution: JoinResolution,
}

/// A Settled instance whose handler has not run yet.
///
/// Owns a copy of the collected events, so the handler can run while nothing
/// in the synchronizer is borrowed.
pub(crate) struct PendingJoin {
    key: JoinKey,
    events: SettledEvents,
    handler: JoinFn,
}

impl PendingJoin {
    /// Run the handler, catching panics.
    pub(crate) fn run(self) -> JoinRun {
        let mut ctx = JoinContext::new(&self.key.correlation_id);
        let handler = &self.handler;
        let events = &self.events;
        let result = catch_panic(|| handler(events, &mut ctx))
            .unwrap_or_else(|message| Err(HandlerError::Panicked(message)));
        JoinRun {
            key: self.key,
            events: self.events,
            result,
            queued: ctx.queued,
        }
    }
}

impl fmt::Debug for PendingJoin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingJoin")
            .field("key", &self.key)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

/// A join handler's result, waiting to be applied to its instance.
#[derive(Debug)]
pub(crate) struct JoinRun {
    key: JoinKey,
    events: SettledEvents,
    result: Result<JoinOutcome, HandlerError>,
    queued: Vec<DispatchAction>,
}

#[derive(Default)]
struct CompletionCache {
    generation: Option<u64>,
    producers: HashMap<String, Vec<String>>,
}

impl CompletionCache {
    fn refresh(&mut self, registry: &HandlerRegistry) {
        let generation = registry.generation();
        if self.generation != Some(generation) {
            self.producers = registry.completion_index();
            self.generation = Some(generation);
            tracing::trace!(generation, "Rebuilt completion index");
        }
    }

    fn declares(&self, command_type: &str, event_type: &str) -> bool {
        self.producers
            .get(event_type)
            .is_some_and(|producers| producers.iter().any(|p| p == command_type))
    }
}

/// Tracks join instances and fires join handlers.
pub struct JoinSynchronizer {
    templates: BTreeMap<String, JoinTemplate>,
    index: HashMap<String, BTreeSet<String>>,
    instances: BTreeMap<JoinKey, JoinInstance>,
    cache: CompletionCache,
    rearm_policy: RearmPolicy,
}

impl JoinSynchronizer {
    /// Create an empty synchronizer.
    #[must_use]
    pub fn new(rearm_policy: RearmPolicy) -> Self {
        Self {
            templates: BTreeMap::new(),
            index: HashMap::new(),
            instances: BTreeMap::new(),
            cache: CompletionCache::default(),
            rearm_policy,
        }
    }

    /// Register a template and return its id.
    ///
    /// Registering the same set of command types again replaces the handler.
    pub fn register_template(&mut self, registration: JoinRegistration) -> String {
        let id = registration.template_id();
        let command_types: BTreeSet<String> = registration.command_types.into_iter().collect();

        for command_type in &command_types {
            self.index
                .entry(command_type.clone())
                .or_default()
                .insert(id.clone());
        }

        let template = JoinTemplate {
            id: id.clone(),
            command_types,
            handler: registration.handler,
            dispatches: registration.dispatches,
        };
        if self.templates.insert(id.clone(), template).is_some() {
            tracing::warn!(template = %id, "Replaced join template handler");
        } else {
            tracing::debug!(template = %id, "Registered join template");
        }
        id
    }

    /// Templates, sorted by id.
    #[must_use]
    pub fn templates(&self) -> Vec<JoinTemplateInfo> {
        self.templates
            .values()
            .map(|t| JoinTemplateInfo {
                id: t.id.clone(),
                command_types: t.command_types.iter().cloned().collect(),
                dispatches: t.dispatches.clone(),
            })
            .collect()
    }

    /// Note that `command` started.
    ///
    /// Creates a Waiting instance for every interested template that has none
    /// for this correlation yet, and records the command's request id.
    /// Commands without a correlation or request id are untrackable and
    /// ignored.
    ///
    /// Returns the number of instances created.
    pub fn on_command_started(&mut self, command: &Command, now: DateTime<Utc>) -> usize {
        let Some(template_ids) = self.index.get(&command.command_type) else {
            return 0;
        };
        let (Some(correlation_id), Some(request_id)) = (command.correlation(), command.request())
        else {
            tracing::debug!(
                command_type = %command.command_type,
                "Untrackable command: missing correlation or request id"
            );
            return 0;
        };

        let mut created = 0;
        for template_id in template_ids {
            let Some(template) = self.templates.get(template_id) else {
                continue;
            };
            let key = JoinKey::new(template_id.clone(), correlation_id);
            let instance = self.instances.entry(key).or_insert_with_key(|key| {
                created += 1;
                tracing::debug!(instance = %key, "Join instance waiting");
                JoinInstance::new(template, now)
            });
            instance
                .request_ids
                .insert(request_id.to_string(), command.command_type.clone());
        }

        if created > 0 {
            self.record_live_gauge();
        }
        created
    }

    /// Route `event` to the live instances of its correlation and run every
    /// handler it settles.
    ///
    /// Dispatch actions queued by handlers that fire are pushed into `sink`.
    /// Returns one [`JoinFiring`] per handler invocation.
    pub fn on_event_received(
        &mut self,
        event: &Event,
        registry: &HandlerRegistry,
        sink: &mut Vec<CorrelatedDispatch>,
    ) -> Vec<JoinFiring> {
        self.take_settled(event, registry)
            .into_iter()
            .map(PendingJoin::run)
            .map(|run| self.resolve(run, sink))
            .collect()
    }

    /// Route `event` to the live instances of its correlation and take the
    /// instances it completes, without running their handlers.
    ///
    /// Taken instances stay in the arena in the Settled state, where further
    /// events skip them, until [`JoinSynchronizer::resolve`] is called with
    /// the handler's result.
    pub(crate) fn take_settled(
        &mut self,
        event: &Event,
        registry: &HandlerRegistry,
    ) -> Vec<PendingJoin> {
        let Some(correlation_id) = event.correlation() else {
            tracing::trace!(event_type = %event.event_type, "Unroutable event: no correlation id");
            return Vec::new();
        };

        let keys: Vec<JoinKey> = self
            .instances
            .range(JoinKey::new("", correlation_id)..)
            .take_while(|(key, _)| key.correlation_id == correlation_id)
            .map(|(key, _)| key.clone())
            .collect();
        if keys.is_empty() {
            return Vec::new();
        }

        self.cache.refresh(registry);

        let mut settled = Vec::new();
        for key in keys {
            if self.track(&key, event) {
                if let Some(pending) = self.settle(key) {
                    settled.push(pending);
                }
            }
        }
        settled
    }

    /// Apply one event to one waiting instance; returns whether it is now
    /// complete.
    fn track(&mut self, key: &JoinKey, event: &Event) -> bool {
        let Some(instance) = self.instances.get_mut(key) else {
            return false;
        };
        if instance.state != JoinState::Waiting {
            return false;
        }

        let by_request = event
            .request()
            .and_then(|request_id| instance.request_ids.get(request_id))
            .cloned();

        let cache = &self.cache;
        for tracker in instance.trackers.values_mut().filter(|t| !t.completed) {
            let declares = cache.declares(&tracker.command_type, &event.event_type);
            let produced = by_request.as_ref().map_or(declares, |producer| {
                *producer == tracker.command_type
            });
            if !produced {
                continue;
            }
            tracker.events.push(event.clone());
            if declares {
                tracker.completed = true;
                tracing::debug!(
                    instance = %key,
                    command_type = %tracker.command_type,
                    event_type = %event.event_type,
                    "Join tracker completed"
                );
            }
        }

        instance.all_completed()
    }

    /// Mark a fully completed instance Settled and copy out its events.
    fn settle(&mut self, key: JoinKey) -> Option<PendingJoin> {
        let handler = Arc::clone(&self.templates.get(&key.template_id)?.handler);
        let instance = self.instances.get_mut(&key)?;
        instance.state = JoinState::Settled;

        let events: SettledEvents = instance
            .trackers
            .iter()
            .map(|(command_type, tracker)| (command_type.clone(), tracker.events.clone()))
            .collect();

        tracing::info!(instance = %key, "Join settled, running handler");
        JoinMetrics::record_fired();

        Some(PendingJoin {
            key,
            events,
            handler,
        })
    }

    /// Apply a handler's result to its Settled instance: clean it up, re-arm
    /// it or refuse the re-arm.
    ///
    /// Queued dispatch actions of a successful handler are pushed into `sink`.
    /// An instance evicted while its handler ran is not re-armed.
    pub(crate) fn resolve(&mut self, run: JoinRun, sink: &mut Vec<CorrelatedDispatch>) -> JoinFiring {
        let JoinRun {
            key,
            events,
            result,
            queued,
        } = run;

        let resolution = match result {
            Ok(outcome) => {
                let correlation_id = Some(key.correlation_id.clone());
                sink.extend(queued.into_iter().map(|action| CorrelatedDispatch {
                    correlation_id: correlation_id.clone(),
                    action,
                }));

                match self.instances.get_mut(&key) {
                    _ if !outcome.persist => JoinResolution::Cleaned,
                    Some(instance) if self.rearm_policy.allows(instance.rearm_count) => {
                        instance.rearm();
                        JoinResolution::Rearmed
                    }
                    Some(instance) => {
                        tracing::warn!(
                            instance = %key,
                            rearm_count = instance.rearm_count,
                            "Join re-arm limit reached, cleaning up"
                        );
                        JoinResolution::RearmRefused
                    }
                    None => {
                        tracing::debug!(instance = %key, "Join instance evicted while its handler ran");
                        JoinResolution::Cleaned
                    }
                }
            }
            Err(error) => {
                tracing::error!(instance = %key, error = %error, "Join handler failed, cleaning up");
                JoinMetrics::record_handler_error();
                JoinResolution::Failed(error)
            }
        };

        if resolution != JoinResolution::Rearmed && self.instances.remove(&key).is_some() {
            self.record_live_gauge();
            tracing::debug!(instance = %key, "Join instance cleaned");
        }

        JoinFiring {
            key,
            events,
            resolution,
        }
    }

    /// Keys of all live instances.
    #[must_use]
    pub fn live_instances(&self) -> Vec<JoinKey> {
        self.instances.keys().cloned().collect()
    }

    /// Diagnostics for all live instances.
    #[must_use]
    pub fn instance_info(&self) -> Vec<JoinInstanceInfo> {
        self.instances
            .iter()
            .map(|(key, instance)| JoinInstanceInfo {
                key: key.clone(),
                state: instance.state,
                started_at: instance.started_at,
                completed: instance.completed_count(),
                total: instance.trackers.len(),
                rearm_count: instance.rearm_count,
            })
            .collect()
    }

    /// Trackers of one live instance.
    #[must_use]
    pub fn trackers(&self, key: &JoinKey) -> Option<Vec<CommandTracker>> {
        self.instances
            .get(key)
            .map(|instance| instance.trackers.values().cloned().collect())
    }

    /// Remove one instance without firing it.
    pub fn evict(&mut self, key: &JoinKey) -> bool {
        let removed = self.instances.remove(key).is_some();
        if removed {
            tracing::info!(instance = %key, "Join instance evicted");
            self.record_live_gauge();
        }
        removed
    }

    /// Remove every instance started before `cutoff` without firing it.
    ///
    /// Returns the evicted keys.
    pub fn evict_started_before(&mut self, cutoff: DateTime<Utc>) -> Vec<JoinKey> {
        let stale: Vec<JoinKey> = self
            .instances
            .iter()
            .filter(|(_, instance)| instance.started_at < cutoff)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            self.evict(key);
        }
        stale
    }

    fn record_live_gauge(&self) {
        JoinMetrics::record_live(self.instances.len());
    }
}

impl fmt::Debug for JoinSynchronizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinSynchronizer")
            .field("templates", &self.templates.keys().collect::<Vec<_>>())
            .field("instances", &self.instances.keys().collect::<Vec<_>>())
            .field("rearm_policy", &self.rearm_policy)
            .finish()
    }
}
