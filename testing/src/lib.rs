//! # Flowbus Testing
//!
//! Testing utilities and fixtures for flowbus.
//!
//! This crate provides:
//! - Deterministic clocks
//! - Scripted command handlers and a recording event subscriber
//! - A Given-When-Then helper for folds
//! - Property-based testing strategies
//!
//! ## Example
//!
//! ```ignore
//! use flowbus_testing::{init_test_tracing, ScriptedHandler};
//!
//! #[tokio::test]
//! async fn checks_settle() {
//!     init_test_tracing();
//!     let tests = ScriptedHandler::check("CheckTests", "TestsCheckPassed", "TestsCheckFailed");
//!     orchestrator.register_command_handler(Arc::new(tests.clone()))?;
//!     // ...
//!     assert_eq!(tests.calls(), 1);
//! }
//! ```

use chrono::{DateTime, Utc};
use flowbus_core::environment::Clock;


pub use fold_test::FoldTest;

/// Mock implementations for testing.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use flowbus_core::event::{Command, Event};
    use flowbus_core::event_bus::EventSubscriber;
    use flowbus_core::handler::{CommandHandler, HandlerError, HandlerResult};
    use flowbus_core::metadata::CommandMetadata;
    use futures::future::BoxFuture;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, PoisonError};
    use std::time::Duration;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use flowbus_testing::mocks::FixedClock;
    /// use flowbus_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }

    /// A clock that only moves when told to.
    ///
    /// Clones share the same time.
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Start at `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move the clock forward.
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// A command handler that replays a fixed script.
    ///
    /// Clones share call counters and received commands, so keep a clone to
    /// inspect after handing the handler to a bus.
    ///
    /// # Example
    ///
    /// ```
    /// use flowbus_core::event::Command;
    /// use flowbus_core::handler::CommandHandler;
    /// use flowbus_testing::mocks::ScriptedHandler;
    /// use serde_json::json;
    ///
    /// # tokio_test::block_on(async {
    /// let handler = ScriptedHandler::check("CheckLint", "LintCheckPassed", "LintCheckFailed");
    /// let events = handler.handle(Command::new("CheckLint", json!({}))).await.unwrap();
    ///
    /// assert_eq!(events[0].event_type, "LintCheckPassed");
    /// assert_eq!(handler.calls(), 1);
    /// # });
    /// ```
    #[derive(Debug, Clone)]
    pub struct ScriptedHandler {
        name: String,
        metadata: Option<CommandMetadata>,
        script: Vec<(String, Value)>,
        delay: Option<Duration>,
        failure: Option<String>,
        calls: Arc<AtomicUsize>,
        received: Arc<Mutex<Vec<Command>>>,
    }

    impl ScriptedHandler {
        /// A handler for `name` that emits nothing and has no metadata.
        #[must_use]
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                name: name.into(),
                metadata: None,
                script: Vec::new(),
                delay: None,
                failure: None,
                calls: Arc::new(AtomicUsize::new(0)),
                received: Arc::new(Mutex::new(Vec::new())),
            }
        }

        /// A check-style command: declares `passed` and `failed` as
        /// completion events and emits `passed`.
        #[must_use]
        pub fn check(name: &str, passed: &str, failed: &str) -> Self {
            Self::new(name)
                .declaring([passed, failed])
                .emitting(passed, Value::Object(serde_json::Map::new()))
        }

        /// Append an event to emit on every call.
        #[must_use]
        pub fn emitting(mut self, event_type: impl Into<String>, data: Value) -> Self {
            self.script.push((event_type.into(), data));
            self
        }

        /// Attach metadata declaring `events` as completion events.
        #[must_use]
        pub fn declaring<I, S>(mut self, events: I) -> Self
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            self.metadata = Some(CommandMetadata::new(self.name.clone()).with_events(events));
            self
        }

        /// Attach explicit metadata.
        #[must_use]
        pub fn with_metadata(mut self, metadata: CommandMetadata) -> Self {
            self.metadata = Some(metadata);
            self
        }

        /// Sleep before answering.
        #[must_use]
        pub const fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        /// Fail every call with `reason` instead of emitting.
        #[must_use]
        pub fn failing(mut self, reason: impl Into<String>) -> Self {
            self.failure = Some(reason.into());
            self
        }

        /// Number of calls so far.
        #[must_use]
        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        /// Commands received so far, in call order.
        #[must_use]
        pub fn received(&self) -> Vec<Command> {
            self.received
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }
    }

    impl CommandHandler for ScriptedHandler {
        fn name(&self) -> &str {
            &self.name
        }

        fn metadata(&self) -> Option<CommandMetadata> {
            self.metadata.clone()
        }

        fn handle(&self, command: Command) -> BoxFuture<'_, HandlerResult> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.received
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(command.clone());

                if let Some(delay) = self.delay {
                    tokio::time::sleep(delay).await;
                }
                if let Some(reason) = &self.failure {
                    return Err(HandlerError::failed(reason.clone()));
                }
                Ok(self
                    .script
                    .iter()
                    .map(|(event_type, data)| Event::for_command(&command, event_type.clone(), data.clone()))
                    .collect())
            })
        }
    }

    /// Subscriber that records every event it sees.
    #[derive(Debug, Default)]
    pub struct RecordingSubscriber {
        events: Mutex<Vec<Event>>,
    }

    impl RecordingSubscriber {
        /// Create an empty recorder.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Events seen so far.
        #[must_use]
        pub fn events(&self) -> Vec<Event> {
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        /// Types of the events seen so far.
        #[must_use]
        pub fn event_types(&self) -> Vec<String> {
            self.events().into_iter().map(|e| e.event_type).collect()
        }
    }

    impl EventSubscriber for RecordingSubscriber {
        fn on_event(&self, event: Event) -> BoxFuture<'_, ()> {
            Box::pin(async move {
                self.events
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(event);
            })
        }
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use proptest::prelude::*;

    /// Every ordering of `0..n`.
    pub fn completion_order(n: usize) -> impl Strategy<Value = Vec<usize>> {
        Just((0..n).collect::<Vec<_>>()).prop_shuffle()
    }

    /// Short, non-empty correlation ids.
    pub fn correlation_id() -> impl Strategy<Value = String> {
        "[a-z]{1,4}-[0-9]{1,3}"
    }
}

/// Install a `tracing` subscriber that writes through the test harness.
///
/// Honors `RUST_LOG`; safe to call from every test.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use mocks::{FixedClock, ManualClock, RecordingSubscriber, ScriptedHandler, test_clock};
