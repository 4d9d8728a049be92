//! Command/event bus contract.
//!
//! The bus is the transport the orchestration core sits on. It routes each
//! command to exactly one registered handler and broadcasts every published
//! event to all subscribers, preserving publish order.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐
//! │   Command   │
//! └──────┬──────┘
//!        │ send_command
//!        ▼
//! ┌─────────────────┐
//! │ CommandHandler  │
//! └────────┬────────┘
//!          │ events
//!          ▼
//! ┌─────────────────┐
//! │  publish_event  │
//! └────────┬────────┘
//!          │
//!     ┌────┴────┐
//!     │         │
//!     ▼         ▼
//! ┌───────┐ ┌───────┐
//! │ Sub A │ │ Sub B │
//! └───────┘ └───────┘
//! ```
//!
//! # Dyn Compatibility
//!
//! Both traits return boxed futures so that buses and subscribers can be
//! held as `Arc<dyn CommandBus>` / `Arc<dyn EventSubscriber>`. This also
//! lets subscribers re-enter the bus (a subscriber that submits a command
//! while handling an event) without infinitely sized future types.

use crate::event::{Command, Event};
use crate::handler::{CommandHandler, HandlerError};
use futures::future::BoxFuture;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during bus operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// No handler is registered for the command type.
    #[error("No handler registered for command '{0}'")]
    NoHandler(String),

    /// A handler for the command type is already registered.
    #[error("Handler already registered for command '{0}'")]
    DuplicateHandler(String),

    /// The command handler returned an error.
    #[error("Handler for '{command_type}' failed: {source}")]
    HandlerFailed {
        /// The command type whose handler failed.
        command_type: String,
        /// The underlying handler error.
        #[source]
        source: HandlerError,
    },

    /// The bus has been shut down or dropped.
    #[error("Bus closed")]
    Closed,
}

/// Receives every event published on the bus.
pub trait EventSubscriber: Send + Sync {
    /// Called once per published event, in publish order.
    ///
    /// The returned future is awaited by the publisher before the next
    /// subscriber receives the event.
    fn on_event(&self, event: Event) -> BoxFuture<'_, ()>;
}

/// Command routing and event broadcast.
pub trait CommandBus: Send + Sync {
    /// Register the single handler for `handler.name()`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::DuplicateHandler`] if the command type already has
    /// a handler.
    fn register_command_handler(&self, handler: Arc<dyn CommandHandler>) -> Result<(), BusError>;

    /// Route a command to its handler, publish the events it produces and
    /// return them.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::NoHandler`] if nothing handles the command type,
    /// or [`BusError::HandlerFailed`] if the handler fails.
    fn send_command(&self, command: Command) -> BoxFuture<'_, Result<Vec<Event>, BusError>>;

    /// Broadcast one event to every subscriber.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Closed`] if the bus no longer accepts events.
    fn publish_event(&self, event: Event) -> BoxFuture<'_, Result<(), BusError>>;

    /// Subscribe to every event published from now on.
    fn subscribe_all(&self, subscriber: Arc<dyn EventSubscriber>);
}
