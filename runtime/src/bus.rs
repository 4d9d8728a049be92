//! In-process command bus.
//!
//! One handler per command type. `send_command` awaits the handler, stamps
//! each produced event with the command's ids (when the event carries none)
//! and a timestamp, publishes the events to every subscriber in order, and
//! returns them.
//!
//! Locks are only held while cloning the handler or subscriber list, never
//! across an await, so subscribers may re-enter the bus.

use crate::lock::{read, write};
use crate::metrics::CommandMetrics;
use flowbus_core::environment::{Clock, SystemClock};
use flowbus_core::event::{Command, Event};
use flowbus_core::event_bus::{BusError, CommandBus, EventSubscriber};
use flowbus_core::handler::{CommandHandler, HandlerError};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// A [`CommandBus`] that runs handlers in the caller's task.
pub struct InProcessBus {
    handlers: RwLock<HashMap<String, Arc<dyn CommandHandler>>>,
    subscribers: RwLock<Vec<Arc<dyn EventSubscriber>>>,
    clock: Arc<dyn Clock>,
    closed: AtomicBool,
}

impl InProcessBus {
    /// Create a bus stamping events with wall-clock time.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a bus stamping events with `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(Vec::new()),
            clock,
            closed: AtomicBool::new(false),
        }
    }

    /// Refuse all further commands and events.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        tracing::info!("Bus closed");
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        Ok(())
    }

    fn stamp(&self, command: &Command, mut event: Event) -> Event {
        if event.correlation().is_none() {
            event.correlation_id.clone_from(&command.correlation_id);
        }
        if event.request().is_none() {
            event.request_id.clone_from(&command.request_id);
        }
        if event.timestamp.is_none() {
            event.timestamp = Some(self.clock.now());
        }
        event
    }

    async fn publish(&self, event: Event) -> Result<(), BusError> {
        self.ensure_open()?;
        let subscribers = read(&self.subscribers).clone();
        tracing::trace!(
            event_type = %event.event_type,
            subscribers = subscribers.len(),
            "Publishing event"
        );
        for subscriber in subscribers {
            subscriber.on_event(event.clone()).await;
        }
        Ok(())
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InProcessBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessBus")
            .field("handlers", &read(&self.handlers).keys().collect::<Vec<_>>())
            .field("subscribers", &read(&self.subscribers).len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl CommandBus for InProcessBus {
    fn register_command_handler(&self, handler: Arc<dyn CommandHandler>) -> Result<(), BusError> {
        let name = handler.name().to_string();
        let mut handlers = write(&self.handlers);
        if handlers.contains_key(&name) {
            return Err(BusError::DuplicateHandler(name));
        }
        handlers.insert(name, handler);
        Ok(())
    }

    fn send_command(&self, command: Command) -> BoxFuture<'_, Result<Vec<Event>, BusError>> {
        Box::pin(async move {
            self.ensure_open()?;
            let handler = read(&self.handlers)
                .get(&command.command_type)
                .cloned()
                .ok_or_else(|| BusError::NoHandler(command.command_type.clone()))?;

            let started = std::time::Instant::now();
            let result = AssertUnwindSafe(handler.handle(command.clone()))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| Err(HandlerError::Panicked(crate::panic_message(&*payload))));
            CommandMetrics::record_duration(started.elapsed());

            let events = result.map_err(|source| {
                tracing::warn!(
                    command_type = %command.command_type,
                    error = %source,
                    "Command handler failed"
                );
                BusError::HandlerFailed {
                    command_type: command.command_type.clone(),
                    source,
                }
            })?;

            let events: Vec<Event> = events
                .into_iter()
                .map(|event| self.stamp(&command, event))
                .collect();
            for event in &events {
                self.publish(event.clone()).await?;
            }
            Ok(events)
        })
    }

    fn publish_event(&self, event: Event) -> BoxFuture<'_, Result<(), BusError>> {
        Box::pin(self.publish(event))
    }

    fn subscribe_all(&self, subscriber: Arc<dyn EventSubscriber>) {
        write(&self.subscribers).push(subscriber);
    }
}
