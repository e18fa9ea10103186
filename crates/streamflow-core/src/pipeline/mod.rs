//! Compiled pipelines: a flow definition wired into stream-core objects.
//!
//! `compile` turns a `Definition` into a `Pipeline`. Every node gets an inlet
//! (`HotSource<Context>`) and a stage subscribed to it; forwarding a context
//! along an edge means emitting it into the target node's inlet. Processing
//! is synchronous on the emitting thread, or on the thread already draining
//! that inlet; each node handles one context at a time (see `stage`).
//!
//! The node graph is an arena (`petgraph::DiGraph`) with index-based
//! adjacency. Stages refer back to it through a `Weak`, so loops in a
//! definition never become ownership cycles.
//!
//! - `compiler` -- validation, graph construction, node numbering
//! - `stage` -- per-kind transition rules
//! - `join` -- aggregation policies for JOIN nodes

pub mod compiler;
pub mod join;
mod stage;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use streamflow_types::config::JoinConfig;
use streamflow_types::context::Context;
use streamflow_types::definition::{Definition, Node};
use streamflow_types::error::RepositoryError;
use streamflow_types::event::TaskEvent;

use crate::condition::{ConditionError, Rule};
use crate::lock::LockRegistry;
use crate::repository::ContextRepository;
use crate::stream::{Flow, HotSource};

pub use compiler::{CompileError, compile};
pub use join::{JoinOutcome, JoinPolicy, JoinRegistry};

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

/// Collaborators a compiled pipeline works with at runtime.
#[derive(Clone)]
pub struct PipelineServices {
    pub contexts: Arc<dyn ContextRepository>,
    pub locks: Arc<LockRegistry>,
    /// Receives one event per context parked at a TASK node.
    pub tasks: mpsc::UnboundedSender<TaskEvent>,
    /// Optional second destination for stage failures.
    pub failure_sink: Option<mpsc::UnboundedSender<StageFailure>>,
    pub join: JoinConfig,
    /// Partial join groups; shared so they survive pipeline rebuilds.
    pub joins: Arc<JoinRegistry>,
}

// ---------------------------------------------------------------------------
// Errors and failures
// ---------------------------------------------------------------------------

/// Why a stage could not move a context on.
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Condition(#[from] ConditionError),

    #[error("no branch of condition node '{0}' matched")]
    NoMatchingBranch(String),

    #[error("persisting context failed: {0}")]
    Repository(#[from] RepositoryError),

    #[error("task channel is closed")]
    TaskChannelClosed,

    #[error("join at node '{0}' expired before all branches arrived")]
    JoinExpired(String),

    #[error("node '{0}' is not part of this pipeline")]
    UnknownNode(String),
}

impl StageError {
    /// Stable classification for routing and logs.
    pub fn code(&self) -> &'static str {
        match self {
            StageError::Condition(e) => e.code(),
            StageError::NoMatchingBranch(_) => "NO_MATCHING_BRANCH",
            StageError::Repository(_) => "PERSISTENCE_ERROR",
            StageError::TaskChannelClosed => "TASK_CHANNEL_CLOSED",
            StageError::JoinExpired(_) => "JOIN_EXPIRED",
            StageError::UnknownNode(_) => "UNKNOWN_NODE",
        }
    }
}

/// A context that a stage could not move on, as published on
/// `Pipeline::failures`. The context stays at its last persisted position.
#[derive(Debug, Clone)]
pub struct StageFailure {
    pub definition_id: Uuid,
    pub stream_id: String,
    pub node_id: String,
    pub context: Context,
    pub code: &'static str,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Arena
// ---------------------------------------------------------------------------

pub(crate) struct NodeSlot {
    pub node: Node,
    /// Breadth-first number from START; diagnostics only.
    pub order: usize,
    pub inlet: Arc<HotSource<Context>>,
    pub join: Option<Arc<dyn JoinPolicy>>,
}

pub(crate) struct EdgeSlot {
    /// Position among the source node's subscriptions.
    pub declared: usize,
    /// Parsed once at compile time; a grammar error is raised when the edge
    /// is evaluated.
    pub rule: Option<Result<Rule, ConditionError>>,
}

pub(crate) struct PipelineCore {
    pub definition: Arc<Definition>,
    pub graph: DiGraph<NodeSlot, EdgeSlot>,
    pub index: HashMap<String, NodeIndex>,
    pub failures: Arc<HotSource<StageFailure>>,
    pub services: PipelineServices,
}

impl PipelineCore {
    /// Outgoing edges of `index` in declaration order.
    pub(crate) fn outgoing(&self, index: NodeIndex) -> Vec<(&EdgeSlot, NodeIndex)> {
        let mut edges: Vec<(&EdgeSlot, NodeIndex)> = self
            .graph
            .edges(index)
            .map(|edge| (edge.weight(), edge.target()))
            .collect();
        edges.sort_by_key(|(slot, _)| slot.declared);
        edges
    }

    pub(crate) fn lookup(&self, node_id: &str) -> Result<NodeIndex, StageError> {
        self.index
            .get(node_id)
            .copied()
            .ok_or_else(|| StageError::UnknownNode(node_id.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// A compiled, immutable pipeline for one definition version.
pub struct Pipeline {
    core: Arc<PipelineCore>,
}

impl Pipeline {
    pub(crate) fn new(core: Arc<PipelineCore>) -> Self {
        Self { core }
    }

    pub fn definition(&self) -> &Arc<Definition> {
        &self.core.definition
    }

    /// Id of the START node.
    pub fn start_node(&self) -> &str {
        self.core
            .graph
            .node_weights()
            .find(|slot| slot.order == 0)
            .map(|slot| slot.node.id.as_str())
            .unwrap_or_default()
    }

    /// Breadth-first number assigned to `node_id`, if the node is reachable
    /// from START.
    pub fn order(&self, node_id: &str) -> Option<usize> {
        let index = self.core.index.get(node_id)?;
        let order = self.core.graph[*index].order;
        (order != usize::MAX).then_some(order)
    }

    /// `(node id, number)` for every reachable node, sorted by number.
    pub fn numbering(&self) -> Vec<(String, usize)> {
        let mut numbering: Vec<(String, usize)> = self
            .core
            .graph
            .node_weights()
            .filter(|slot| slot.order != usize::MAX)
            .map(|slot| (slot.node.id.clone(), slot.order))
            .collect();
        numbering.sort_by_key(|(_, order)| *order);
        numbering
    }

    /// Hand `contexts` to the stage of `node_id`, as if they had just arrived
    /// along an edge. Used for new runs (at START) and for resuming persisted
    /// contexts at their position.
    pub fn inject(&self, node_id: &str, contexts: Vec<Context>) -> Result<usize, StageError> {
        let index = self.core.lookup(node_id)?;
        let inlet = &self.core.graph[index].inlet;
        Ok(contexts
            .into_iter()
            .map(|context| inlet.emit(context))
            .filter(|delivered| *delivered > 0)
            .count())
    }

    /// Move `contexts` on from `node_id` along its outgoing edges, without
    /// running that node's own stage. Used when a task completes.
    pub fn forward_from(&self, node_id: &str, contexts: Vec<Context>) -> Result<(), StageError> {
        let index = self.core.lookup(node_id)?;
        for context in contexts {
            let _guard = self.core.services.locks.acquire(context.id, node_id);
            self.core.forward(index, context)?;
        }
        Ok(())
    }

    /// Contexts arriving at `node_id`. Subscribe with unbounded demand to see
    /// every arrival.
    pub fn arrivals(&self, node_id: &str) -> Option<Flow<Context>> {
        let index = self.core.index.get(node_id)?;
        Some(self.core.graph[*index].inlet.flow())
    }

    /// Stage failures of this pipeline.
    pub fn failures(&self) -> Flow<StageFailure> {
        self.core.failures.flow()
    }

    /// Expire partial join groups older than the straggler timeout. Each
    /// expired context is reported as a failure. Returns how many expired.
    pub fn sweep_joins(&self, now: Instant) -> usize {
        let mut expired = 0;
        for slot in self.core.graph.node_weights() {
            let Some(policy) = &slot.join else {
                continue;
            };
            for context in policy.sweep(now) {
                tracing::warn!(
                    node_id = %slot.node.id,
                    context_id = %context.id,
                    trace_id = %context.trace_id,
                    "join group expired"
                );
                self.core.report(
                    &slot.node.id,
                    context,
                    StageError::JoinExpired(slot.node.id.clone()),
                );
                expired += 1;
            }
        }
        expired
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("definition_id", &self.core.definition.id)
            .field("stream_id", &self.core.definition.stream_id)
            .field("nodes", &self.core.graph.node_count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use dashmap::DashMap;
    use serde_json::json;
    use streamflow_types::DataMap;
    use streamflow_types::context::ContextStatus;
    use streamflow_types::definition::{JoinMode, NodeKind, TaskDescriptor, TaskSourceType};

    use crate::stream::{Recorder, UNBOUNDED};

    /// Context store for pipeline tests.
    #[derive(Default)]
    pub(crate) struct MemoryContexts {
        pub records: DashMap<Uuid, Context>,
    }

    impl ContextRepository for MemoryContexts {
        fn get_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Context>, RepositoryError> {
            Ok(ids
                .iter()
                .filter_map(|id| self.records.get(id).map(|c| c.clone()))
                .collect())
        }

        fn save(&self, contexts: &[Context]) -> Result<(), RepositoryError> {
            for context in contexts {
                self.records.insert(context.id, context.clone());
            }
            Ok(())
        }
    }

    pub(crate) struct Harness {
        pub contexts: Arc<MemoryContexts>,
        pub tasks: mpsc::UnboundedReceiver<TaskEvent>,
        pub services: PipelineServices,
    }

    pub(crate) fn harness() -> Harness {
        let contexts = Arc::new(MemoryContexts::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let services = PipelineServices {
            contexts: contexts.clone(),
            locks: LockRegistry::new(),
            tasks: tx,
            failure_sink: None,
            join: JoinConfig::default(),
            joins: JoinRegistry::new(),
        };
        Harness {
            contexts,
            tasks: rx,
            services,
        }
    }

    fn definition(nodes: Vec<Node>) -> Arc<Definition> {
        Arc::new(Definition {
            id: Uuid::now_v7(),
            stream_id: "orders".into(),
            version: "1".into(),
            name: "orders".into(),
            nodes,
        })
    }

    fn data(value: serde_json::Value) -> DataMap {
        value.as_object().cloned().unwrap()
    }

    fn start(pipeline: &Pipeline, business: serde_json::Value) -> Context {
        let context = Context::new(
            "orders",
            pipeline.definition().id,
            pipeline.start_node(),
            data(business),
        );
        pipeline
            .inject(pipeline.start_node(), vec![context.clone()])
            .unwrap();
        context
    }

    fn watch(pipeline: &Pipeline, node_id: &str) -> Arc<Recorder<Context>> {
        let recorder = Recorder::<Context>::new(UNBOUNDED);
        pipeline.arrivals(node_id).unwrap().subscribe(recorder.clone());
        recorder
    }

    fn branching() -> Arc<Definition> {
        definition(vec![
            Node::new("start", NodeKind::Start).to("check"),
            Node::new("check", NodeKind::Condition)
                .when("businessData.flag", "a")
                .when("!businessData.flag", "b"),
            Node::new("a", NodeKind::End),
            Node::new("b", NodeKind::End),
        ])
    }

    #[test]
    fn condition_routes_to_matching_branch_only() {
        let h = harness();
        let pipeline = compile(branching(), h.services.clone()).unwrap();
        let a = watch(&pipeline, "a");
        let b = watch(&pipeline, "b");

        let ctx = start(&pipeline, json!({"flag": true}));

        assert_eq!(a.values().len(), 1);
        assert_eq!(a.values()[0].id, ctx.id);
        assert!(b.values().is_empty());

        let stored = h.contexts.records.get(&ctx.id).unwrap().clone();
        assert_eq!(stored.position_id, "a");
        assert_eq!(stored.status, ContextStatus::Completed);
    }

    #[test]
    fn condition_error_is_published_and_context_stays_put() {
        let h = harness();
        let pipeline = compile(branching(), h.services.clone()).unwrap();
        let failures = Recorder::<StageFailure>::unbounded();
        pipeline.failures().subscribe(failures.clone());
        let a = watch(&pipeline, "a");
        let b = watch(&pipeline, "b");

        let ctx = start(&pipeline, json!({"flag": 1}));

        assert!(a.values().is_empty());
        assert!(b.values().is_empty());
        let recorded = failures.values();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].node_id, "check");
        assert_eq!(recorded[0].code, "TYPE_CONVERSION_ERROR");

        let stored = h.contexts.records.get(&ctx.id).unwrap().clone();
        assert_eq!(stored.position_id, "check");
        assert_eq!(stored.status, ContextStatus::Ready);
    }

    #[test]
    fn no_matching_branch_without_default_is_a_failure() {
        let h = harness();
        let def = definition(vec![
            Node::new("start", NodeKind::Start).to("check"),
            Node::new("check", NodeKind::Condition).when("businessData.n > 10", "big"),
            Node::new("big", NodeKind::End),
        ]);
        let pipeline = compile(def, h.services.clone()).unwrap();
        let failures = Recorder::<StageFailure>::unbounded();
        pipeline.failures().subscribe(failures.clone());

        start(&pipeline, json!({"n": 3}));

        assert_eq!(failures.values()[0].code, "NO_MATCHING_BRANCH");
    }

    #[test]
    fn rule_less_edge_is_the_default_branch() {
        let h = harness();
        let def = definition(vec![
            Node::new("start", NodeKind::Start).to("check"),
            Node::new("check", NodeKind::Condition)
                .to("small")
                .when("businessData.n > 10", "big"),
            Node::new("big", NodeKind::End),
            Node::new("small", NodeKind::End),
        ]);
        let pipeline = compile(def, h.services.clone()).unwrap();
        let big = watch(&pipeline, "big");
        let small = watch(&pipeline, "small");

        start(&pipeline, json!({"n": 30}));
        start(&pipeline, json!({"n": 3}));

        assert_eq!(big.values().len(), 1);
        assert_eq!(small.values().len(), 1);
    }

    #[test]
    fn task_node_parks_context_and_raises_event() {
        let mut h = harness();
        let def = definition(vec![
            Node::new("start", NodeKind::Start).to("review"),
            Node::new("review", NodeKind::Task)
                .with_task(TaskDescriptor::new("review", TaskSourceType::Manual))
                .to("end"),
            Node::new("end", NodeKind::End),
        ]);
        let pipeline = compile(def, h.services.clone()).unwrap();
        let end = watch(&pipeline, "end");

        let ctx = start(&pipeline, json!({}));

        let event = h.tasks.try_recv().unwrap();
        assert_eq!(event, TaskEvent::new("orders", "review", vec![ctx.id]));
        assert!(end.values().is_empty());
        let parked = h.contexts.records.get(&ctx.id).unwrap().clone();
        assert_eq!(parked.status, ContextStatus::Pending);

        pipeline.forward_from("review", vec![parked]).unwrap();
        assert_eq!(end.values().len(), 1);
        let done = h.contexts.records.get(&ctx.id).unwrap().clone();
        assert_eq!(done.status, ContextStatus::Completed);
    }

    #[test]
    fn fan_out_forks_and_join_merges() {
        let h = harness();
        let def = definition(vec![
            Node::new("start", NodeKind::Start).to("split"),
            Node::new("split", NodeKind::Task)
                .with_task(TaskDescriptor::new("split", TaskSourceType::Script))
                .to("left")
                .to("right"),
            Node::new("left", NodeKind::Task)
                .with_task(TaskDescriptor::new("left", TaskSourceType::Service))
                .to("join"),
            Node::new("right", NodeKind::Task)
                .with_task(TaskDescriptor::new("right", TaskSourceType::Service))
                .to("join"),
            Node::new("join", NodeKind::Join).to("end"),
            Node::new("end", NodeKind::End),
        ]);
        let pipeline = compile(def, h.services.clone()).unwrap();
        let end = watch(&pipeline, "end");

        let ctx = start(&pipeline, json!({"order": 7}));
        pipeline.forward_from("split", vec![ctx.clone()]).unwrap();

        let left = h.contexts.records.iter().find(|c| c.position_id == "left").unwrap().clone();
        let right = h.contexts.records.iter().find(|c| c.position_id == "right").unwrap().clone();
        assert_eq!(left.id, ctx.id);
        assert_ne!(right.id, ctx.id);
        assert_eq!(right.trace_id, ctx.trace_id);

        let mut left = left;
        left.merge_business_data(data(json!({"left": true})));
        let mut right = right;
        right.merge_business_data(data(json!({"right": true})));

        pipeline.forward_from("left", vec![left]).unwrap();
        assert!(end.values().is_empty());
        pipeline.forward_from("right", vec![right.clone()]).unwrap();

        let arrived = end.values();
        assert_eq!(arrived.len(), 1);
        assert_eq!(
            serde_json::Value::Object(arrived[0].business_data.clone()),
            json!({"order": 7, "left": true, "right": true})
        );
        let absorbed = h.contexts.records.get(&right.id).unwrap().clone();
        assert_eq!(absorbed.status, ContextStatus::Completed);
        assert_eq!(absorbed.position_id, "join");
    }

    #[test]
    fn first_of_join_forwards_once_per_trace() {
        let h = harness();
        let def = definition(vec![
            Node::new("start", NodeKind::Start).to("fork"),
            Node::new("fork", NodeKind::Join).with_join(JoinMode::FirstOf).to("x").to("y"),
            Node::new("x", NodeKind::Join).with_join(JoinMode::FirstOf).to("race"),
            Node::new("y", NodeKind::Join).with_join(JoinMode::FirstOf).to("race"),
            Node::new("race", NodeKind::Join).with_join(JoinMode::FirstOf).to("end"),
            Node::new("end", NodeKind::End),
        ]);
        let pipeline = compile(def, h.services.clone()).unwrap();
        let end = watch(&pipeline, "end");

        start(&pipeline, json!({}));

        assert_eq!(end.values().len(), 1);
    }

    #[test]
    fn expired_join_groups_are_reported() {
        let mut h = harness();
        h.services.join.straggler_timeout_secs = Some(5);
        let def = definition(vec![
            Node::new("start", NodeKind::Start).to("split"),
            Node::new("split", NodeKind::Task)
                .with_task(TaskDescriptor::new("split", TaskSourceType::Script))
                .to("join")
                .to("slow"),
            Node::new("slow", NodeKind::Task)
                .with_task(TaskDescriptor::new("slow", TaskSourceType::Service))
                .to("join"),
            Node::new("join", NodeKind::Join).to("end"),
            Node::new("end", NodeKind::End),
        ]);
        let pipeline = compile(def, h.services.clone()).unwrap();
        let failures = Recorder::<StageFailure>::unbounded();
        pipeline.failures().subscribe(failures.clone());

        let ctx = start(&pipeline, json!({}));
        pipeline.forward_from("split", vec![ctx]).unwrap();

        let later = Instant::now() + std::time::Duration::from_secs(6);
        assert_eq!(pipeline.sweep_joins(later), 1);
        assert_eq!(failures.values()[0].code, "JOIN_EXPIRED");
    }

    #[test]
    fn concurrent_injections_are_all_processed() {
        let h = harness();
        let def = definition(vec![
            Node::new("start", NodeKind::Start).to("check"),
            Node::new("check", NodeKind::Condition)
                .when("businessData.n > 50", "high")
                .to("low"),
            Node::new("high", NodeKind::End),
            Node::new("low", NodeKind::End),
        ]);
        let pipeline = Arc::new(compile(def, h.services.clone()).unwrap());
        let high = watch(&pipeline, "high");
        let low = watch(&pipeline, "low");

        let threads: Vec<_> = (0..4)
            .map(|t| {
                let pipeline = Arc::clone(&pipeline);
                std::thread::spawn(move || {
                    (0..25)
                        .map(|i| start(&pipeline, json!({"n": t * 25 + i})).id)
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let ids: Vec<Uuid> = threads
            .into_iter()
            .flat_map(|t| t.join().unwrap())
            .collect();

        assert_eq!(ids.len(), 100);
        assert_eq!(high.values().len(), 49);
        assert_eq!(low.values().len(), 51);
        for id in ids {
            let stored = h.contexts.records.get(&id).unwrap().clone();
            assert_eq!(stored.status, ContextStatus::Completed);
        }
    }

    #[test]
    fn unknown_node_is_rejected() {
        let h = harness();
        let pipeline = compile(branching(), h.services.clone()).unwrap();
        let err = pipeline.inject("nope", Vec::new()).unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_NODE");
        assert!(pipeline.arrivals("nope").is_none());
    }

    #[test]
    fn failures_reach_the_sink() {
        let mut h = harness();
        let (tx, mut rx) = mpsc::unbounded_channel();
        h.services.failure_sink = Some(tx);
        let pipeline = compile(branching(), h.services.clone()).unwrap();

        start(&pipeline, json!({}));

        let failure = rx.try_recv().unwrap();
        assert_eq!(failure.node_id, "check");
        assert_eq!(failure.stream_id, "orders");
    }
}
