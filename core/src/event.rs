//! Command and event wire types.
//!
//! Commands and events share one wire shape:
//!
//! ```text
//! { "type": string, "data": object, "requestId"?: string,
//!   "correlationId"?: string, "timestamp"?: RFC 3339 }
//! ```
//!
//! A [`Command`] is a request to perform one unit of work. An [`Event`] is an
//! immutable fact produced by exactly one command invocation; it carries the
//! producing command's `correlationId`/`requestId` so that join tracking can
//! route it back to the right correlation scope.
//!
//! # Example
//!
//! ```
//! use flowbus_core::event::{Command, Event};
//! use serde_json::json;
//!
//! let command = Command::new("CheckTests", json!({ "path": "./src" }))
//!     .with_request_id("req-1")
//!     .with_correlation_id("ci-42");
//!
//! let event = Event::for_command(&command, "TestsCheckPassed", json!({}));
//! assert_eq!(event.correlation_id.as_deref(), Some("ci-42"));
//! assert_eq!(event.request_id.as_deref(), Some("req-1"));
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A request to perform one unit of work.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    /// Command type, matched against registered handler names.
    #[serde(rename = "type")]
    pub command_type: String,

    /// Command payload.
    #[serde(default)]
    pub data: serde_json::Value,

    /// Unique id of this invocation within a run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    /// Groups every command and event belonging to one logical operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// When the command was issued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Command {
    /// Create a command with no ids and no timestamp.
    #[must_use]
    pub fn new(command_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            command_type: command_type.into(),
            data,
            request_id: None,
            correlation_id: None,
            timestamp: None,
        }
    }

    /// Set the request id.
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Set the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Set the timestamp.
    #[must_use]
    pub const fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// The correlation id, if present and non-empty.
    #[must_use]
    pub fn correlation(&self) -> Option<&str> {
        non_empty(self.correlation_id.as_deref())
    }

    /// The request id, if present and non-empty.
    #[must_use]
    pub fn request(&self) -> Option<&str> {
        non_empty(self.request_id.as_deref())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Command {{ type: {}, request: {}, correlation: {} }}",
            self.command_type,
            self.request().unwrap_or("-"),
            self.correlation().unwrap_or("-")
        )
    }
}

/// An immutable fact produced by exactly one command invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Event type, matched against declared completion events and fold keys.
    #[serde(rename = "type")]
    pub event_type: String,

    /// Event payload.
    #[serde(default)]
    pub data: serde_json::Value,

    /// Request id of the producing command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    /// Correlation id of the producing command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// When the event was produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Event {
    /// Create an event with no ids and no timestamp.
    #[must_use]
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            request_id: None,
            correlation_id: None,
            timestamp: None,
        }
    }

    /// Create an event produced by `command`, copying its request and
    /// correlation ids.
    #[must_use]
    pub fn for_command(
        command: &Command,
        event_type: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            request_id: command.request_id.clone(),
            correlation_id: command.correlation_id.clone(),
            timestamp: None,
        }
    }

    /// Set the request id.
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Set the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Set the timestamp.
    #[must_use]
    pub const fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// The correlation id, if present and non-empty.
    #[must_use]
    pub fn correlation(&self) -> Option<&str> {
        non_empty(self.correlation_id.as_deref())
    }

    /// The request id, if present and non-empty.
    #[must_use]
    pub fn request(&self) -> Option<&str> {
        non_empty(self.request_id.as_deref())
    }

    /// Whether the payload carries a non-null `error` marker.
    #[must_use]
    pub fn has_error_marker(&self) -> bool {
        self.data
            .get("error")
            .is_some_and(|marker| !marker.is_null())
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Event {{ type: {}, request: {}, correlation: {} }}",
            self.event_type,
            self.request().unwrap_or("-"),
            self.correlation().unwrap_or("-")
        )
    }
}

/// Either side of the bus, as recorded in a message log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "lowercase")]
pub enum Message {
    /// A submitted command.
    Command(Command),
    /// A published event.
    Event(Event),
}

impl Message {
    /// The `type` field of the wrapped message.
    #[must_use]
    pub fn message_type(&self) -> &str {
        match self {
            Self::Command(command) => &command.command_type,
            Self::Event(event) => &event.event_type,
        }
    }

    /// The request id of the wrapped message, if non-empty.
    #[must_use]
    pub fn request(&self) -> Option<&str> {
        match self {
            Self::Command(command) => command.request(),
            Self::Event(event) => event.request(),
        }
    }
}

impl From<Command> for Message {
    fn from(command: Command) -> Self {
        Self::Command(command)
    }
}

impl From<Event> for Message {
    fn from(event: Event) -> Self {
        Self::Event(event)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_for_command_copies_ids() {
        let command = Command::new("CheckLint", json!({}))
            .with_request_id("r-1")
            .with_correlation_id("c-1");
        let event = Event::for_command(&command, "LintCheckPassed", json!({ "warnings": 0 }));

        assert_eq!(event.event_type, "LintCheckPassed");
        assert_eq!(event.request(), Some("r-1"));
        assert_eq!(event.correlation(), Some("c-1"));
    }

    #[test]
    fn empty_ids_are_treated_as_missing() {
        let command = Command::new("CheckLint", json!({}))
            .with_request_id("")
            .with_correlation_id("");
        assert_eq!(command.request(), None);
        assert_eq!(command.correlation(), None);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn wire_shape_uses_camel_case_and_type_key() {
        let event = Event::new("TestsCheckPassed", json!({ "passed": 12 }))
            .with_correlation_id("c-9")
            .with_request_id("r-9");
        let wire = serde_json::to_value(&event).unwrap();

        assert_eq!(wire["type"], "TestsCheckPassed");
        assert_eq!(wire["correlationId"], "c-9");
        assert_eq!(wire["requestId"], "r-9");
        assert!(wire.get("timestamp").is_none());

        let parsed: Command =
            serde_json::from_value(json!({ "type": "CheckTypes", "data": {} })).unwrap();
        assert_eq!(parsed.command_type, "CheckTypes");
        assert_eq!(parsed.correlation_id, None);
    }

    #[test]
    fn error_marker_requires_non_null_value() {
        assert!(Event::new("XFailed", json!({ "error": "boom" })).has_error_marker());
        assert!(!Event::new("XDone", json!({ "error": null })).has_error_marker());
        assert!(!Event::new("XDone", json!({})).has_error_marker());
        assert!(!Event::new("XDone", json!("text")).has_error_marker());
    }

    #[test]
    fn display_shows_type_and_ids() {
        let command = Command::new("CheckTypes", json!({})).with_correlation_id("c-1");
        let text = format!("{command}");
        assert!(text.contains("CheckTypes"));
        assert!(text.contains("c-1"));
        assert!(text.contains("request: -"));
    }
}
