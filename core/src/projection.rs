//! Fold functions: the pure building block of the state projection.
//!
//! A fold reduces `(state, event)` to a new state. Folds are keyed by exact
//! event type, at most one per type, and must be pure: replaying the same
//! event sequence from the same initial state always yields the same
//! terminal state.
//!
//! # Example
//!
//! ```
//! use flowbus_core::event::Event;
//! use flowbus_core::projection::FoldRegistration;
//! use serde_json::json;
//!
//! let fold = FoldRegistration::new("TestsCheckPassed", |mut state, event: &Event| {
//!     state["tests"] = event.data.clone();
//!     Ok(state)
//! });
//!
//! let next = fold
//!     .apply(json!({}), &Event::new("TestsCheckPassed", json!({ "passed": 3 })))
//!     .unwrap();
//! assert_eq!(next["tests"]["passed"], 3);
//! ```

use crate::event::Event;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Error type for fold application.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FoldError {
    /// The fold rejected the event.
    #[error("Fold for '{event_type}' failed: {reason}")]
    Failed {
        /// Event type the fold is registered for.
        event_type: String,
        /// Why it failed.
        reason: String,
    },

    /// The fold panicked.
    #[error("Fold for '{event_type}' panicked: {message}")]
    Panicked {
        /// Event type the fold is registered for.
        event_type: String,
        /// Panic message, when it was a string.
        message: String,
    },
}

impl FoldError {
    /// Shorthand for [`FoldError::Failed`].
    #[must_use]
    pub fn failed(event_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Failed {
            event_type: event_type.into(),
            reason: reason.into(),
        }
    }
}

/// A pure `(state, event) -> state` reducer.
pub type FoldFn = Arc<dyn Fn(Value, &Event) -> Result<Value, FoldError> + Send + Sync>;

/// A fold bound to the event type it reduces.
#[derive(Clone)]
pub struct FoldRegistration {
    /// Exact event type this fold handles.
    pub event_type: String,
    reduce: FoldFn,
}

impl FoldRegistration {
    /// Bind `reduce` to `event_type`.
    pub fn new<F>(event_type: impl Into<String>, reduce: F) -> Self
    where
        F: Fn(Value, &Event) -> Result<Value, FoldError> + Send + Sync + 'static,
    {
        Self {
            event_type: event_type.into(),
            reduce: Arc::new(reduce),
        }
    }

    /// Apply the fold.
    ///
    /// # Errors
    ///
    /// Returns whatever [`FoldError`] the fold produces.
    pub fn apply(&self, state: Value, event: &Event) -> Result<Value, FoldError> {
        (self.reduce)(state, event)
    }

    /// Shared handle to the reducer.
    #[must_use]
    pub fn reducer(&self) -> FoldFn {
        Arc::clone(&self.reduce)
    }
}

impl fmt::Debug for FoldRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FoldRegistration")
            .field("event_type", &self.event_type)
            .finish_non_exhaustive()
    }
}

/// Look up a dotted path (`"checks.tests.0"`) in a JSON value.
///
/// Object segments are matched by key, array segments by numeric index. An
/// empty path returns the value itself.
#[must_use]
pub fn value_at_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}
