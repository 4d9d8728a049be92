//! Dependency Graph Builder: a static command-dependency graph derived from
//! registrations.
//!
//! Nodes are the command types referenced by any reaction rule or join
//! template. A node is identified as `package/alias` when the command has
//! metadata, and by its raw command type otherwise.
//!
//! Edges come from two places:
//!
//! - **Reactions**: `producer -> dispatched` for every command whose declared
//!   completion events include the rule's trigger. Without metadata the
//!   producer is unknown and no edge is emitted.
//! - **Joins**: a fan-in edge from every tracked command to every command the
//!   join declares it dispatches.
//!
//! Only dispatches declared on the registration (`dispatching([...])`) are
//! visible here; commands built inside an opaque closure are not.
//!
//! When a message history is supplied each node is annotated with the status
//! of its most recent command.

use crate::join::JoinTemplateInfo;
use crate::registration::ReactionSummary;
use flowbus_core::event::{Command, Event, Message};
use flowbus_core::metadata::{CommandMetadata, DEFAULT_PACKAGE};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Errors raised while building a graph.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// A recorded command has no request id, so its events cannot be found.
    #[error("Cannot compute status for '{command_type}': command has no request id")]
    MissingRequestId {
        /// Type of the offending command
        command_type: String,
    },
}

/// Runtime status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// No command of this type seen.
    Idle,
    /// Command seen, no completion event yet.
    Running,
    /// Completion event carries no error marker.
    Pass,
    /// Completion event carries an error marker.
    Fail,
}

/// One command in the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNode {
    /// `package/alias`, or the raw command type without metadata.
    pub id: String,
    /// Command name.
    pub title: String,
    /// Display alias.
    pub alias: String,
    /// Description, empty without metadata.
    pub description: String,
    /// Package name.
    pub package: String,
    /// Category, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Icon, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    /// Runtime status, when history was supplied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<NodeStatus>,
}

/// A dependency between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GraphEdge {
    /// Upstream node id.
    pub from: String,
    /// Downstream node id.
    pub to: String,
}

/// The exported graph. Nodes are sorted by id; edges are unique and sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineGraph {
    /// Nodes.
    pub nodes: Vec<GraphNode>,
    /// Edges.
    pub edges: Vec<GraphEdge>,
}

impl PipelineGraph {
    /// Node by id.
    #[must_use]
    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Whether the edge `from -> to` exists.
    #[must_use]
    pub fn has_edge(&self, from: &str, to: &str) -> bool {
        self.edges.iter().any(|e| e.from == from && e.to == to)
    }
}

/// Options for graph export through the orchestrator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphOptions {
    /// Annotate nodes with status from the message log.
    #[serde(default)]
    pub with_status: bool,
}

impl GraphOptions {
    /// Annotate nodes with status.
    #[must_use]
    pub const fn with_status() -> Self {
        Self { with_status: true }
    }
}

/// Builds a [`PipelineGraph`].
///
/// # Example
///
/// ```
/// use flowbus_core::metadata::CommandMetadata;
/// use flowbus_runtime::graph::DependencyGraphBuilder;
/// use flowbus_runtime::registration::ReactionRule;
/// use std::collections::BTreeMap;
///
/// let mut metadata = BTreeMap::new();
/// metadata.insert(
///     "CommandA".to_string(),
///     CommandMetadata::new("CommandA").with_events(["ADone"]),
/// );
///
/// let graph = DependencyGraphBuilder::new()
///     .with_reactions(vec![ReactionRule::dispatch("ADone", "CommandB").summary()])
///     .with_metadata(metadata)
///     .build()
///     .unwrap();
///
/// assert!(graph.has_edge("default/CommandA", "CommandB"));
/// assert_eq!(graph.edges.len(), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct DependencyGraphBuilder {
    reactions: Vec<ReactionSummary>,
    joins: Vec<JoinTemplateInfo>,
    metadata: BTreeMap<String, CommandMetadata>,
    history: Option<Vec<Message>>,
}

impl DependencyGraphBuilder {
    /// Start an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reaction rules to derive edges from.
    #[must_use]
    pub fn with_reactions(mut self, reactions: Vec<ReactionSummary>) -> Self {
        self.reactions = reactions;
        self
    }

    /// Join templates to derive fan-in edges from.
    #[must_use]
    pub fn with_joins(mut self, joins: Vec<JoinTemplateInfo>) -> Self {
        self.joins = joins;
        self
    }

    /// Command metadata, keyed by command name.
    #[must_use]
    pub fn with_metadata(mut self, metadata: BTreeMap<String, CommandMetadata>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Message history used for status annotation.
    #[must_use]
    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = Some(history);
        self
    }

    /// Build the graph.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::MissingRequestId`] if history was supplied and
    /// the most recent command of some node has no request id.
    pub fn build(&self) -> Result<PipelineGraph, GraphError> {
        let mut command_types: BTreeSet<&str> = BTreeSet::new();
        let mut edges: BTreeSet<GraphEdge> = BTreeSet::new();

        for rule in &self.reactions {
            command_types.extend(rule.dispatches.iter().map(String::as_str));
            for producer in self.producers_of(&rule.event_type) {
                command_types.insert(producer);
                for dispatched in &rule.dispatches {
                    edges.insert(self.edge(producer, dispatched));
                }
            }
        }

        for join in &self.joins {
            command_types.extend(join.command_types.iter().map(String::as_str));
            command_types.extend(join.dispatches.iter().map(String::as_str));
            for tracked in &join.command_types {
                for dispatched in &join.dispatches {
                    edges.insert(self.edge(tracked, dispatched));
                }
            }
        }

        let mut nodes = command_types
            .into_iter()
            .map(|command_type| -> Result<GraphNode, GraphError> {
                let mut node = self.node(command_type);
                if let Some(history) = &self.history {
                    node.status = Some(self.status(command_type, history)?);
                }
                Ok(node)
            })
            .collect::<Result<Vec<_>, GraphError>>()?;
        nodes.sort_by(|a, b| a.id.cmp(&b.id));

        tracing::debug!(nodes = nodes.len(), edges = edges.len(), "Built pipeline graph");

        Ok(PipelineGraph {
            nodes,
            edges: edges.into_iter().collect(),
        })
    }

    fn producers_of<'a>(&'a self, event_type: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.metadata
            .iter()
            .filter(move |(_, metadata)| metadata.is_completion_event(event_type))
            .map(|(name, _)| name.as_str())
    }

    fn node_id(&self, command_type: &str) -> String {
        self.metadata
            .get(command_type)
            .map_or_else(|| command_type.to_string(), CommandMetadata::canonical_id)
    }

    fn edge(&self, from: &str, to: &str) -> GraphEdge {
        GraphEdge {
            from: self.node_id(from),
            to: self.node_id(to),
        }
    }

    fn node(&self, command_type: &str) -> GraphNode {
        match self.metadata.get(command_type) {
            Some(metadata) => GraphNode {
                id: metadata.canonical_id(),
                title: metadata.name.clone(),
                alias: metadata.alias.clone(),
                description: metadata.description.clone(),
                package: metadata.package.clone(),
                category: metadata.category.clone(),
                icon: metadata.icon.clone(),
                status: None,
            },
            None => GraphNode {
                id: command_type.to_string(),
                title: command_type.to_string(),
                alias: command_type.to_string(),
                description: String::new(),
                package: DEFAULT_PACKAGE.to_string(),
                category: None,
                icon: None,
                status: None,
            },
        }
    }

    fn status(&self, command_type: &str, history: &[Message]) -> Result<NodeStatus, GraphError> {
        let latest = history.iter().enumerate().rev().find_map(|(i, m)| match m {
            Message::Command(c) if c.command_type == command_type => Some((i, c)),
            _ => None,
        });
        let Some((position, command)) = latest else {
            return Ok(NodeStatus::Idle);
        };
        let request_id = require_request_id(command)?;

        let declared = self
            .metadata
            .get(command_type)
            .filter(|m| !m.events.is_empty());
        let completion = history[position..]
            .iter()
            .filter_map(|m| match m {
                Message::Event(e) if e.request() == Some(request_id) => Some(e),
                _ => None,
            })
            .filter(|e| declared.is_none_or(|m| m.is_completion_event(&e.event_type)))
            .last();

        Ok(completion.map_or(NodeStatus::Running, status_of))
    }
}

fn require_request_id(command: &Command) -> Result<&str, GraphError> {
    command.request().ok_or_else(|| GraphError::MissingRequestId {
        command_type: command.command_type.clone(),
    })
}

fn status_of(event: &Event) -> NodeStatus {
    if event.has_error_marker() {
        NodeStatus::Fail
    } else {
        NodeStatus::Pass
    }
}
