//! Definition validation and pipeline construction.
//!
//! `compile` is a pure function of the definition: it validates, builds the
//! node arena, numbers nodes breadth-first from START and wires one stage per
//! node. Nothing is persisted and no context moves during compilation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use petgraph::graph::DiGraph;
use petgraph::visit::Bfs;
use thiserror::Error;

use streamflow_types::definition::{Definition, NodeKind};

use super::join::policy_for;
use super::stage::Stage;
use super::{EdgeSlot, NodeSlot, Pipeline, PipelineCore, PipelineServices};
use crate::condition::Rule;
use crate::stream::HotSource;

/// Structural problems that make a definition impossible to compile.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("definition has no START node")]
    NoStart,

    #[error("definition has more than one START node: {0:?}")]
    MultipleStarts(Vec<String>),

    #[error("definition has no END node")]
    NoEnd,

    #[error("node id '{0}' is declared twice")]
    DuplicateNode(String),

    #[error("node '{node}' subscribes to unknown node '{target}'")]
    UnknownTarget { node: String, target: String },

    #[error("START node '{0}' must have exactly one outgoing edge")]
    StartFanOut(String),

    #[error("TASK node '{0}' has no task descriptor")]
    MissingTask(String),

    #[error("CONDITION node '{0}' has more than one default edge")]
    MultipleDefaults(String),
}

/// Compile `definition` into a pipeline wired to `services`.
pub fn compile(
    definition: Arc<Definition>,
    services: PipelineServices,
) -> Result<Pipeline, CompileError> {
    validate(&definition)?;

    let timeout = services.join.straggler_timeout_secs.map(Duration::from_secs);
    let mut graph = DiGraph::with_capacity(definition.nodes.len(), definition.nodes.len());
    let mut index = HashMap::with_capacity(definition.nodes.len());

    for node in &definition.nodes {
        let join = (node.kind == NodeKind::Join).then(|| {
            services.joins.policy(definition.id, &node.id, || {
                policy_for(node.join, definition.incoming_count(&node.id), timeout)
            })
        });
        let idx = graph.add_node(NodeSlot {
            node: node.clone(),
            order: usize::MAX,
            inlet: HotSource::new(),
            join,
        });
        index.insert(node.id.clone(), idx);
    }

    for node in &definition.nodes {
        let from = index[&node.id];
        for (declared, subscription) in node.subscriptions.iter().enumerate() {
            let to = index[&subscription.target];
            let rule = subscription.rule.as_deref().map(Rule::parse);
            graph.add_edge(from, to, EdgeSlot { declared, rule });
        }
    }

    let start = definition
        .start_node()
        .map(|n| index[&n.id])
        .ok_or(CompileError::NoStart)?;
    let mut bfs = Bfs::new(&graph, start);
    let mut next = 0;
    while let Some(idx) = bfs.next(&graph) {
        graph[idx].order = next;
        next += 1;
    }
    if next < graph.node_count() {
        tracing::warn!(
            definition_id = %definition.id,
            unreachable = graph.node_count() - next,
            "definition has nodes unreachable from START"
        );
    }

    let core = Arc::new(PipelineCore {
        definition: Arc::clone(&definition),
        graph,
        index,
        failures: HotSource::new(),
        services,
    });
    for idx in core.graph.node_indices() {
        core.graph[idx].inlet.flow().subscribe(Arc::new(Stage {
            core: Arc::downgrade(&core),
            index: idx,
        }));
    }

    tracing::info!(
        definition_id = %definition.id,
        stream_id = %definition.stream_id,
        version = %definition.version,
        nodes = definition.nodes.len(),
        "pipeline compiled"
    );
    Ok(Pipeline::new(core))
}

fn validate(definition: &Definition) -> Result<(), CompileError> {
    let mut seen = HashSet::with_capacity(definition.nodes.len());
    for node in &definition.nodes {
        if !seen.insert(node.id.as_str()) {
            return Err(CompileError::DuplicateNode(node.id.clone()));
        }
    }

    let starts: Vec<String> = definition
        .nodes
        .iter()
        .filter(|n| n.kind == NodeKind::Start)
        .map(|n| n.id.clone())
        .collect();
    match starts.len() {
        0 => return Err(CompileError::NoStart),
        1 => {}
        _ => return Err(CompileError::MultipleStarts(starts)),
    }
    if !definition.nodes.iter().any(|n| n.kind == NodeKind::End) {
        return Err(CompileError::NoEnd);
    }

    for node in &definition.nodes {
        if let Some(missing) = node
            .subscriptions
            .iter()
            .find(|s| !seen.contains(s.target.as_str()))
        {
            return Err(CompileError::UnknownTarget {
                node: node.id.clone(),
                target: missing.target.clone(),
            });
        }
        match node.kind {
            NodeKind::Start if node.subscriptions.len() != 1 => {
                return Err(CompileError::StartFanOut(node.id.clone()));
            }
            NodeKind::Task if node.task.is_none() => {
                return Err(CompileError::MissingTask(node.id.clone()));
            }
            NodeKind::Condition
                if node.subscriptions.iter().filter(|s| s.rule.is_none()).count() > 1 =>
            {
                return Err(CompileError::MultipleDefaults(node.id.clone()));
            }
            _ => {}
        }
    }
    Ok(())
}
