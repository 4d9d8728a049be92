//! State Projector: one shared projection, mutated only through folds.
//!
//! The projector holds exactly one JSON value. [`StateProjector::apply_event`]
//! looks up the fold registered for the event's type and, if there is one,
//! replaces the projection with `fold(current, event)`. Events without a fold
//! are a no-op. A failing or panicking fold leaves the projection untouched.

use crate::catch_panic;
use flowbus_core::event::Event;
use flowbus_core::projection::{value_at_path, FoldError, FoldFn, FoldRegistration};
use serde_json::Value;
use std::collections::HashMap;

/// Where the projector finds the fold for an event type.
pub trait FoldSource {
    /// The fold registered for `event_type`, if any.
    fn fold_for(&self, event_type: &str) -> Option<FoldFn>;
}

impl FoldSource for HashMap<String, FoldRegistration> {
    fn fold_for(&self, event_type: &str) -> Option<FoldFn> {
        self.get(event_type).map(FoldRegistration::reducer)
    }
}

/// What happened when an event reached the projector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Projected {
    /// A fold ran and replaced the projection.
    Applied,
    /// No fold is registered for the event type.
    NoFold,
}

/// Holds the single projection value.
#[derive(Debug, Clone, PartialEq)]
pub struct StateProjector {
    state: Value,
    applied: u64,
}

impl StateProjector {
    /// A projector starting from an empty object.
    #[must_use]
    pub fn new() -> Self {
        Self::with_initial(Value::Object(serde_json::Map::new()))
    }

    /// A projector starting from `initial`.
    #[must_use]
    pub const fn with_initial(initial: Value) -> Self {
        Self {
            state: initial,
            applied: 0,
        }
    }

    /// Apply the fold registered for `event.event_type`.
    ///
    /// # Errors
    ///
    /// Returns the fold's [`FoldError`], or [`FoldError::Panicked`] if it
    /// panicked. The projection is unchanged in both cases.
    pub fn apply_event<S>(&mut self, event: &Event, folds: &S) -> Result<Projected, FoldError>
    where
        S: FoldSource + ?Sized,
    {
        let Some(fold) = folds.fold_for(&event.event_type) else {
            tracing::trace!(event_type = %event.event_type, "No fold registered");
            return Ok(Projected::NoFold);
        };

        let current = self.state.clone();
        let next = catch_panic(|| fold(current, event)).map_err(|message| {
            FoldError::Panicked {
                event_type: event.event_type.clone(),
                message,
            }
        })??;

        self.state = next;
        self.applied += 1;
        Ok(Projected::Applied)
    }

    /// The current projection.
    #[must_use]
    pub const fn state(&self) -> &Value {
        &self.state
    }

    /// A value inside the projection by dotted path (`"checks.tests.0"`).
    #[must_use]
    pub fn property(&self, path: &str) -> Option<&Value> {
        value_at_path(&self.state, path)
    }

    /// Number of folds applied so far.
    #[must_use]
    pub const fn applied(&self) -> u64 {
        self.applied
    }
}

impl Default for StateProjector {
    fn default() -> Self {
        Self::new()
    }
}
