//! Declarative command metadata.
//!
//! Metadata is what the rest of the system knows about a command beyond its
//! handler: a human-facing alias and description, the package it belongs to,
//! and, most importantly, the list of **completion events** it may emit. That
//! list is the sole authority for deciding whether an event signals that a
//! command has finished (successfully or not).

use serde::{Deserialize, Serialize};

/// Package assigned to commands whose metadata does not name one.
pub const DEFAULT_PACKAGE: &str = "default";

/// Metadata exposed per registered command.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandMetadata {
    /// Command type this metadata describes.
    pub name: String,

    /// Short alias, used in canonical graph ids.
    pub alias: String,

    /// Human-readable description.
    #[serde(default)]
    pub description: String,

    /// Owning package, used in canonical graph ids.
    pub package: String,

    /// Optional grouping for UIs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,

    /// Optional icon name for UIs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,

    /// Completion event types this command may emit.
    #[serde(default)]
    pub events: Vec<String>,
}

impl CommandMetadata {
    /// Metadata with the alias defaulted to `name` and the default package.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            alias: name.clone(),
            name,
            description: String::new(),
            package: DEFAULT_PACKAGE.to_string(),
            category: None,
            icon: None,
            events: Vec::new(),
        }
    }

    /// Set the alias.
    #[must_use]
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the package.
    #[must_use]
    pub fn with_package(mut self, package: impl Into<String>) -> Self {
        self.package = package.into();
        self
    }

    /// Set the category.
    #[must_use]
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Set the icon.
    #[must_use]
    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    /// Set the completion events.
    #[must_use]
    pub fn with_events<I, S>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.events = events.into_iter().map(Into::into).collect();
        self
    }

    /// Whether `event_type` is one of this command's completion events.
    #[must_use]
    pub fn is_completion_event(&self, event_type: &str) -> bool {
        self.events.iter().any(|e| e == event_type)
    }

    /// Canonical graph id: `package/alias`.
    #[must_use]
    pub fn canonical_id(&self) -> String {
        format!("{}/{}", self.package, self.alias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_alias_and_package() {
        let meta = CommandMetadata::new("CheckTests");
        assert_eq!(meta.alias, "CheckTests");
        assert_eq!(meta.package, DEFAULT_PACKAGE);
        assert_eq!(meta.canonical_id(), "default/CheckTests");
    }

    #[test]
    fn completion_events_are_matched_exactly() {
        let meta = CommandMetadata::new("CheckTests")
            .with_alias("check:tests")
            .with_package("@ci/checks")
            .with_events(["TestsCheckPassed", "TestsCheckFailed"]);

        assert!(meta.is_completion_event("TestsCheckFailed"));
        assert!(!meta.is_completion_event("TestsCheckProgress"));
        assert_eq!(meta.canonical_id(), "@ci/checks/check:tests");
    }
}
