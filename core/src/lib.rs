//! # Flowbus Core
//!
//! Core message types and contracts for the flowbus command/event
//! orchestration layer.
//!
//! This crate defines the vocabulary shared by the runtime and by any outer
//! surface (HTTP transports, file sync, config loaders) that drives it:
//!
//! - **Command**: a request to perform one unit of work
//! - **Event**: an immutable fact produced by exactly one command
//! - **Command metadata**: alias, package and declared completion events
//! - **Command handler**: the capability that turns a command into events
//! - **Command bus**: routes commands, broadcasts events
//! - **Dispatch action**: commands to submit, tagged by strategy
//! - **Fold**: a pure `(state, event) -> state` reducer
//!
//! ## Data Flow
//!
//! ```text
//! submit ──► handler ──► events ──► history + projection + reactions + joins
//!    ▲                                              │
//!    └──────────────── dispatch actions ◄───────────┘
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

/// Command, event and message wire types
pub mod event;

/// Declarative command metadata
pub mod metadata;

/// The command handler capability
pub mod handler;

/// Command/event bus contract
pub mod event_bus;

/// Dispatch actions and reaction outcomes
pub mod dispatch;

/// Fold registrations and projection path lookup
pub mod projection;

pub use dispatch::{CommandFactory, DispatchAction, Reaction};
pub use event::{Command, Event, Message};
pub use event_bus::{BusError, CommandBus, EventSubscriber};
pub use handler::{CommandHandler, FnHandler, HandlerError, HandlerResult};
pub use metadata::CommandMetadata;
pub use projection::{FoldError, FoldFn, FoldRegistration};

/// Environment module - time abstraction
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```ignore
    /// // Test - fixed time for deterministic tests
    /// struct FixedClock { time: DateTime<Utc> }
    /// impl Clock for FixedClock {
    ///     fn now(&self) -> DateTime<Utc> {
    ///         self.time
    ///     }
    /// }
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
