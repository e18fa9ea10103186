//! Flow definitions: the design-time graph a pipeline is compiled from.
//!
//! A `Definition` is immutable once published. A new version is a new
//! `Definition` with its own id, never an in-place edit.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::DataMap;

// ---------------------------------------------------------------------------
// Definition
// ---------------------------------------------------------------------------

/// A published flow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Definition {
    pub id: Uuid,
    /// External stream id events are addressed to.
    pub stream_id: String,
    pub version: String,
    #[serde(default)]
    pub name: String,
    pub nodes: Vec<Node>,
}

impl Definition {
    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    /// The single start node, if the definition has exactly one.
    pub fn start_node(&self) -> Option<&Node> {
        let mut starts = self.nodes.iter().filter(|n| n.kind == NodeKind::Start);
        match (starts.next(), starts.next()) {
            (Some(start), None) => Some(start),
            _ => None,
        }
    }

    /// Number of subscriptions targeting `node_id`.
    pub fn incoming_count(&self, node_id: &str) -> usize {
        self.nodes
            .iter()
            .flat_map(|n| n.subscriptions.iter())
            .filter(|s| s.target == node_id)
            .count()
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// The kind of a node in a flow graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeKind {
    Start,
    Task,
    Condition,
    Join,
    End,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Start => "START",
            NodeKind::Task => "TASK",
            NodeKind::Condition => "CONDITION",
            NodeKind::Join => "JOIN",
            NodeKind::End => "END",
        }
    }
}

/// One step in a flow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub kind: NodeKind,
    /// Task to create when a context reaches this node (TASK nodes only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskDescriptor>,
    /// Aggregation policy (JOIN nodes only).
    #[serde(default)]
    pub join: JoinMode,
    /// Exception handlers invoked when processing at this node fails.
    #[serde(default)]
    pub exception_handlers: Vec<String>,
    /// Outgoing edges, in declaration order.
    #[serde(default)]
    pub subscriptions: Vec<NodeSubscription>,
}

impl Node {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind,
            task: None,
            join: JoinMode::default(),
            exception_handlers: Vec::new(),
            subscriptions: Vec::new(),
        }
    }

    /// Add an unconditional edge to `target`.
    pub fn to(mut self, target: impl Into<String>) -> Self {
        self.subscriptions.push(NodeSubscription::new(target));
        self
    }

    /// Add an edge to `target` taken when `rule` evaluates to `true`.
    pub fn when(mut self, rule: impl Into<String>, target: impl Into<String>) -> Self {
        self.subscriptions.push(NodeSubscription {
            target: target.into(),
            rule: Some(rule.into()),
        });
        self
    }

    pub fn with_task(mut self, task: TaskDescriptor) -> Self {
        self.task = Some(task);
        self
    }

    pub fn with_join(mut self, join: JoinMode) -> Self {
        self.join = join;
        self
    }

    pub fn with_exception_handler(mut self, handler_id: impl Into<String>) -> Self {
        self.exception_handlers.push(handler_id.into());
        self
    }
}

/// How a JOIN node aggregates the branches arriving for one trace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinMode {
    /// Wait for one arrival per incoming edge, then forward a merged context.
    #[default]
    AllOf,
    /// Forward the first arrival, absorb the rest.
    FirstOf,
}

/// Design-time edge from a producing node to a consuming node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSubscription {
    /// Id of the consuming node.
    pub target: String,
    /// Branch rule; only meaningful on CONDITION nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
}

impl NodeSubscription {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            rule: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Task descriptor
// ---------------------------------------------------------------------------

/// Which family of operator a task is dispatched to.
///
/// Closed on purpose: the operator table in streamflow-core matches on it
/// exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSourceType {
    /// Work item assigned to a person.
    Manual,
    /// Call into an external service.
    Service,
    /// Inline script run by a script host.
    Script,
}

/// Task created when a context batch reaches a TASK node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDescriptor {
    pub task_id: String,
    pub source_type: TaskSourceType,
    /// Name of the data converter applied before dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub converter: Option<String>,
    /// Operator-specific settings.
    #[serde(default)]
    pub properties: DataMap,
}

impl TaskDescriptor {
    pub fn new(task_id: impl Into<String>, source_type: TaskSourceType) -> Self {
        Self {
            task_id: task_id.into(),
            source_type,
            converter: None,
            properties: DataMap::new(),
        }
    }

    pub fn with_converter(mut self, converter: impl Into<String>) -> Self {
        self.converter = Some(converter.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
