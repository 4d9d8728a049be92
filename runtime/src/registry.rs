//! Handler Registry: command handlers, their metadata, and fold registrations.
//!
//! The registry is a process-lifetime singleton shared by the bus wiring,
//! the State Projector and the Join Synchronizer. Registration validates the
//! [`CommandHandler`] capability and returns a typed [`RegistrationError`]
//! for malformed handlers; [`HandlerRegistry::register_command_handlers`]
//! registers a batch, logs each rejection and never fails as a whole.
//!
//! Every accepted handler registration bumps a generation counter. Consumers
//! that derive data from metadata (the event → producing-command index used by
//! joins) cache it per generation and rebuild only when it changes, so late
//! registrations are always observed.

use crate::lock::{read, write};
use crate::projector::FoldSource;
use flowbus_core::handler::CommandHandler;
use flowbus_core::metadata::CommandMetadata;
use flowbus_core::projection::{FoldFn, FoldRegistration};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Why a handler was refused at registration time.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    /// The handler reports an empty name.
    #[error("Handler has an empty name")]
    EmptyName,

    /// The handler's metadata describes a different command.
    #[error("Handler '{handler}' carries metadata for '{metadata}'")]
    MetadataNameMismatch {
        /// Name reported by the handler
        handler: String,
        /// Name found in its metadata
        metadata: String,
    },

    /// The metadata alias is empty.
    #[error("Handler '{0}' has an empty alias")]
    EmptyAlias(String),

    /// A declared completion event type is blank.
    #[error("Handler '{0}' declares a blank completion event")]
    BlankCompletionEvent(String),

    /// A handler for this command is already registered.
    #[error("Handler '{0}' is already registered")]
    Duplicate(String),
}

#[derive(Default)]
struct RegistryInner {
    handlers: BTreeMap<String, Arc<dyn CommandHandler>>,
    metadata: BTreeMap<String, CommandMetadata>,
    folds: HashMap<String, FoldRegistration>,
}

/// Registered command handlers, their metadata and fold registrations.
#[derive(Default)]
pub struct HandlerRegistry {
    inner: RwLock<RegistryInner>,
    generation: AtomicU64,
}

impl HandlerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register one handler.
    ///
    /// # Errors
    ///
    /// Returns a [`RegistrationError`] describing why the handler was refused.
    pub fn register(&self, handler: Arc<dyn CommandHandler>) -> Result<(), RegistrationError> {
        let name = handler.name().to_string();
        let metadata = handler.metadata();
        validate(&name, metadata.as_ref())?;

        let mut inner = write(&self.inner);
        if inner.handlers.contains_key(&name) {
            return Err(RegistrationError::Duplicate(name));
        }
        if let Some(metadata) = metadata {
            inner.metadata.insert(name.clone(), metadata);
        }
        inner.handlers.insert(name.clone(), handler);
        drop(inner);

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(command = %name, generation, "Registered command handler");
        Ok(())
    }

    /// Remove a handler and its metadata.
    ///
    /// Returns the removed handler, if one was registered.
    pub fn unregister(&self, command_type: &str) -> Option<Arc<dyn CommandHandler>> {
        let mut inner = write(&self.inner);
        let removed = inner.handlers.remove(command_type)?;
        inner.metadata.remove(command_type);
        drop(inner);

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(command = %command_type, generation, "Unregistered command handler");
        Some(removed)
    }

    /// Register a batch of handlers, skipping and logging malformed ones.
    ///
    /// Returns the rejections; an empty vector means every handler was
    /// accepted.
    pub fn register_command_handlers<I>(&self, handlers: I) -> Vec<RegistrationError>
    where
        I: IntoIterator<Item = Arc<dyn CommandHandler>>,
    {
        handlers
            .into_iter()
            .filter_map(|handler| {
                self.register(handler)
                    .map_err(|error| {
                        tracing::warn!(error = %error, "Skipping command handler");
                        error
                    })
                    .err()
            })
            .collect()
    }

    /// Register a fold, replacing any prior fold for the same event type.
    ///
    /// Returns the replaced registration, if any.
    pub fn register_fold(&self, fold: FoldRegistration) -> Option<FoldRegistration> {
        let event_type = fold.event_type.clone();
        let previous = write(&self.inner).folds.insert(event_type.clone(), fold);
        if previous.is_some() {
            tracing::debug!(event_type = %event_type, "Replaced fold registration");
        }
        previous
    }

    /// Handler for a command type.
    #[must_use]
    pub fn handler(&self, command_type: &str) -> Option<Arc<dyn CommandHandler>> {
        read(&self.inner).handlers.get(command_type).cloned()
    }

    /// Names of all registered handlers, sorted.
    #[must_use]
    pub fn handler_names(&self) -> Vec<String> {
        read(&self.inner).handlers.keys().cloned().collect()
    }

    /// Snapshot of the metadata map, keyed by command name.
    #[must_use]
    pub fn metadata(&self) -> BTreeMap<String, CommandMetadata> {
        read(&self.inner).metadata.clone()
    }

    /// Metadata for one command.
    #[must_use]
    pub fn metadata_for(&self, command_type: &str) -> Option<CommandMetadata> {
        read(&self.inner).metadata.get(command_type).cloned()
    }

    /// Snapshot of the fold map, keyed by event type.
    #[must_use]
    pub fn folds(&self) -> HashMap<String, FoldRegistration> {
        read(&self.inner).folds.clone()
    }

    /// Current registration generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Index from completion event type to the commands declaring it.
    ///
    /// Command lists are sorted by name.
    #[must_use]
    pub fn completion_index(&self) -> HashMap<String, Vec<String>> {
        let inner = read(&self.inner);
        let mut index: HashMap<String, Vec<String>> = HashMap::new();
        for (name, metadata) in &inner.metadata {
            for event_type in &metadata.events {
                let producers = index.entry(event_type.clone()).or_default();
                if !producers.contains(name) {
                    producers.push(name.clone());
                }
            }
        }
        index
    }
}

impl FoldSource for HandlerRegistry {
    fn fold_for(&self, event_type: &str) -> Option<FoldFn> {
        read(&self.inner)
            .folds
            .get(event_type)
            .map(FoldRegistration::reducer)
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = read(&self.inner);
        f.debug_struct("HandlerRegistry")
            .field("handlers", &inner.handlers.keys().collect::<Vec<_>>())
            .field("folds", &inner.folds.len())
            .field("generation", &self.generation())
            .finish()
    }
}

fn validate(name: &str, metadata: Option<&CommandMetadata>) -> Result<(), RegistrationError> {
    if name.trim().is_empty() {
        return Err(RegistrationError::EmptyName);
    }
    let Some(metadata) = metadata else {
        return Ok(());
    };
    if metadata.name != name {
        return Err(RegistrationError::MetadataNameMismatch {
            handler: name.to_string(),
            metadata: metadata.name.clone(),
        });
    }
    if metadata.alias.trim().is_empty() {
        return Err(RegistrationError::EmptyAlias(name.to_string()));
    }
    if metadata.events.iter().any(|e| e.trim().is_empty()) {
        return Err(RegistrationError::BlankCompletionEvent(name.to_string()));
    }
    Ok(())
}
