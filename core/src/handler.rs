//! The command handler capability.
//!
//! A command handler is anything that can name the command type it serves
//! and handle it asynchronously. Handlers may additionally describe
//! themselves through [`CommandMetadata`]; the registry validates the
//! capability at registration time and rejects malformed handlers with a
//! typed error.
//!
//! # Example
//!
//! ```
//! use flowbus_core::event::Event;
//! use flowbus_core::handler::{CommandHandler, FnHandler};
//! use flowbus_core::metadata::CommandMetadata;
//! use serde_json::json;
//!
//! let handler = FnHandler::new("CheckLint", |command| async move {
//!     Ok(vec![Event::for_command(&command, "LintCheckPassed", json!({}))])
//! })
//! .with_metadata(
//!     CommandMetadata::new("CheckLint").with_events(["LintCheckPassed", "LintCheckFailed"]),
//! );
//!
//! assert_eq!(handler.name(), "CheckLint");
//! ```

use crate::event::{Command, Event};
use crate::metadata::CommandMetadata;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Failure raised by a user-supplied handler (command handler, reaction or
/// join handler).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The handler returned an error.
    #[error("Handler failed: {0}")]
    Failed(String),

    /// The handler panicked; the payload is the panic message when it was a
    /// string.
    #[error("Handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    /// Shorthand for [`HandlerError::Failed`].
    #[must_use]
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }
}

/// Events produced by one command invocation.
pub type HandlerResult = Result<Vec<Event>, HandlerError>;

/// A handler for exactly one command type.
///
/// The bus invokes exactly one handler per command type. Events returned by
/// [`handle`](CommandHandler::handle) are published in order.
///
/// # Dyn Compatibility
///
/// `handle` returns a boxed future so handlers can be stored as
/// `Arc<dyn CommandHandler>`.
pub trait CommandHandler: Send + Sync {
    /// The command type this handler serves.
    fn name(&self) -> &str;

    /// Declarative metadata, if the handler describes itself.
    fn metadata(&self) -> Option<CommandMetadata> {
        None
    }

    /// Handle one command.
    fn handle(&self, command: Command) -> BoxFuture<'_, HandlerResult>;
}

type HandleFn = dyn Fn(Command) -> BoxFuture<'static, HandlerResult> + Send + Sync;

/// A [`CommandHandler`] built from a closure.
#[derive(Clone)]
pub struct FnHandler {
    name: String,
    metadata: Option<CommandMetadata>,
    handle: Arc<HandleFn>,
}

impl FnHandler {
    /// Wrap an async closure as a handler for `name`.
    pub fn new<F, Fut>(name: impl Into<String>, handle: F) -> Self
    where
        F: Fn(Command) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self {
            name: name.into(),
            metadata: None,
            handle: Arc::new(move |command| Box::pin(handle(command))),
        }
    }

    /// Attach metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: CommandMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

impl std::fmt::Debug for FnHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnHandler")
            .field("name", &self.name)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

impl CommandHandler for FnHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn metadata(&self) -> Option<CommandMetadata> {
        self.metadata.clone()
    }

    fn handle(&self, command: Command) -> BoxFuture<'_, HandlerResult> {
        (self.handle)(command)
    }
}
