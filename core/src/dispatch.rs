//! Dispatch actions and reaction outcomes.
//!
//! A [`DispatchAction`] describes one or more commands to submit, tagged by
//! submission strategy. Actions are values, not execution: the runtime
//! interprets them after the code that produced them has returned.
//!
//! - [`DispatchAction::Single`]: submit one command
//! - [`DispatchAction::Parallel`]: submit all commands concurrently; resolves
//!   once every submission has been accepted
//! - [`DispatchAction::Sequence`]: submit one at a time, awaiting each
//!   handler before the next
//! - [`DispatchAction::Custom`]: call a factory at dispatch time and submit
//!   what it returns

use crate::event::Command;
use std::fmt;
use std::sync::Arc;

/// Zero-argument command factory evaluated at dispatch time.
pub type CommandFactory = Arc<dyn Fn() -> Vec<Command> + Send + Sync>;

/// A description of commands to submit.
#[derive(Clone)]
pub enum DispatchAction {
    /// Submit one command.
    Single(Command),

    /// Submit all commands concurrently.
    Parallel(Vec<Command>),

    /// Submit commands one at a time, awaiting each.
    Sequence(Vec<Command>),

    /// Build commands late, then submit them in order.
    Custom(CommandFactory),
}

impl DispatchAction {
    /// Submit one command.
    #[must_use]
    pub const fn single(command: Command) -> Self {
        Self::Single(command)
    }

    /// Submit all commands concurrently.
    #[must_use]
    pub const fn parallel(commands: Vec<Command>) -> Self {
        Self::Parallel(commands)
    }

    /// Submit commands one at a time.
    #[must_use]
    pub const fn sequence(commands: Vec<Command>) -> Self {
        Self::Sequence(commands)
    }

    /// Build commands at dispatch time.
    pub fn custom<F>(factory: F) -> Self
    where
        F: Fn() -> Vec<Command> + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(factory))
    }

    /// Strategy tag, used in logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Single(_) => "single",
            Self::Parallel(_) => "parallel",
            Self::Sequence(_) => "sequence",
            Self::Custom(_) => "custom",
        }
    }

    /// Command types known without running a factory.
    #[must_use]
    pub fn static_command_types(&self) -> Vec<&str> {
        match self {
            Self::Single(command) => vec![command.command_type.as_str()],
            Self::Parallel(commands) | Self::Sequence(commands) => commands
                .iter()
                .map(|c| c.command_type.as_str())
                .collect(),
            Self::Custom(_) => Vec::new(),
        }
    }
}

impl fmt::Debug for DispatchAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(command) => f.debug_tuple("DispatchAction::Single").field(command).finish(),
            Self::Parallel(commands) => f
                .debug_tuple("DispatchAction::Parallel")
                .field(commands)
                .finish(),
            Self::Sequence(commands) => f
                .debug_tuple("DispatchAction::Sequence")
                .field(commands)
                .finish(),
            Self::Custom(_) => write!(f, "DispatchAction::Custom(<factory>)"),
        }
    }
}

/// What a reaction rule returns for one event.
#[derive(Clone, Debug, Default)]
pub enum Reaction {
    /// Nothing to do.
    #[default]
    None,

    /// Submit each command in order.
    Commands(Vec<Command>),

    /// Interpret a dispatch action.
    Dispatch(DispatchAction),
}

impl Reaction {
    /// Whether the reaction has nothing to submit.
    #[must_use]
    pub const fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Normalize into a dispatch action, if there is anything to submit.
    ///
    /// A list of commands becomes a [`DispatchAction::Sequence`], which
    /// submits each command in order.
    #[must_use]
    pub fn into_action(self) -> Option<DispatchAction> {
        match self {
            Self::None => None,
            Self::Commands(commands) if commands.is_empty() => None,
            Self::Commands(mut commands) if commands.len() == 1 => {
                commands.pop().map(DispatchAction::Single)
            }
            Self::Commands(commands) => Some(DispatchAction::Sequence(commands)),
            Self::Dispatch(action) => Some(action),
        }
    }
}

impl From<()> for Reaction {
    fn from((): ()) -> Self {
        Self::None
    }
}

impl From<Command> for Reaction {
    fn from(command: Command) -> Self {
        Self::Commands(vec![command])
    }
}

impl From<Vec<Command>> for Reaction {
    fn from(commands: Vec<Command>) -> Self {
        Self::Commands(commands)
    }
}

impl From<Option<Command>> for Reaction {
    fn from(command: Option<Command>) -> Self {
        command.map_or(Self::None, Self::from)
    }
}

impl From<DispatchAction> for Reaction {
    fn from(action: DispatchAction) -> Self {
        Self::Dispatch(action)
    }
}
