//! Per-kind transition rules.
//!
//! A `Stage` is the subscriber on a node's inlet. Each arrival is processed
//! under the (context, node) lock, persisted after every transition, and
//! forwarded by emitting into the next node's inlet.
//!
//! Delivery into a stage is serial. Each inlet reaches its stage through one
//! `Emitter`, so a node processes one context at a time across all traces
//! and threads. A thread that emits while another thread is draining the
//! same inlet only queues its context; the draining thread runs it before
//! returning. Independent traces crossing one node therefore share that
//! node's throughput, and an `emit` or `inject` that returns may not have run
//! its context yet if another thread was mid-drain. Parallelism comes from
//! different nodes and different pipelines.

use std::sync::{Arc, Weak};
use std::time::Instant;

use petgraph::graph::NodeIndex;

use streamflow_types::context::{Context, ContextStatus};
use streamflow_types::definition::NodeKind;
use streamflow_types::event::TaskEvent;

use super::join::JoinOutcome;
use super::{PipelineCore, StageError, StageFailure};
use crate::stream::{StreamError, Subscriber, Subscription, UNBOUNDED};

pub(crate) struct Stage {
    pub core: Weak<PipelineCore>,
    pub index: NodeIndex,
}

impl Subscriber<Context> for Stage {
    fn on_subscribed(&self, subscription: Arc<dyn Subscription>) {
        subscription.request(UNBOUNDED);
    }

    fn consume(&self, context: Context) -> Result<(), StreamError> {
        // A dropped pipeline has nothing left to run.
        if let Some(core) = self.core.upgrade() {
            core.process(self.index, context);
        }
        Ok(())
    }

    fn complete(&self) {}

    fn fail(&self, error: StreamError) {
        tracing::warn!(error = %error, "stage inlet failed");
    }
}

impl PipelineCore {
    pub(crate) fn process(&self, index: NodeIndex, context: Context) {
        let node = &self.graph[index].node;
        let _guard = self.services.locks.acquire(context.id, &node.id);
        tracing::debug!(
            stream_id = %context.stream_id,
            node_id = %node.id,
            context_id = %context.id,
            kind = node.kind.as_str(),
            "processing context"
        );

        let failed = context.clone();
        let result = match node.kind {
            NodeKind::Start => self.forward(index, context),
            NodeKind::Condition => self.branch(index, context),
            NodeKind::Task => self.park(index, context),
            NodeKind::Join => self.join(index, context),
            NodeKind::End => self.finish(index, context),
        };
        if let Err(error) = result {
            self.report(&node.id, failed, error);
        }
    }

    /// Send `context` along every outgoing edge of `index`. The first edge
    /// carries the context itself, later edges carry forks of it.
    pub(crate) fn forward(&self, index: NodeIndex, context: Context) -> Result<(), StageError> {
        let targets = self.outgoing(index);
        let mut branches: Vec<Context> = (1..targets.len()).map(|_| context.fork()).collect();
        branches.insert(0, context);
        for ((_, target), branch) in targets.into_iter().zip(branches) {
            self.send(target, branch)?;
        }
        Ok(())
    }

    /// Persist `context` at `target` as ready, then hand it to that node.
    fn send(&self, target: NodeIndex, mut context: Context) -> Result<(), StageError> {
        let slot = &self.graph[target];
        context.move_to(&slot.node.id, ContextStatus::Ready);
        self.services.contexts.save(std::slice::from_ref(&context))?;
        if slot.inlet.emit(context) == 0 {
            tracing::warn!(node_id = %slot.node.id, "no stage accepted the context");
        }
        Ok(())
    }

    fn branch(&self, index: NodeIndex, context: Context) -> Result<(), StageError> {
        let mut fallback = None;
        for (edge, target) in self.outgoing(index) {
            match &edge.rule {
                None => {
                    fallback.get_or_insert(target);
                }
                Some(Err(error)) => return Err(error.clone().into()),
                Some(Ok(rule)) => {
                    if rule.evaluate(&context.business_data, &context.pass_data)? {
                        tracing::debug!(
                            context_id = %context.id,
                            rule = rule.source(),
                            "branch taken"
                        );
                        return self.send(target, context);
                    }
                }
            }
        }
        match fallback {
            Some(target) => self.send(target, context),
            None => Err(StageError::NoMatchingBranch(self.graph[index].node.id.clone())),
        }
    }

    /// Park at a TASK node and raise a task event. The task handler forwards
    /// once the task completes.
    fn park(&self, index: NodeIndex, mut context: Context) -> Result<(), StageError> {
        let node_id = &self.graph[index].node.id;
        context.move_to(node_id, ContextStatus::Pending);
        self.services.contexts.save(std::slice::from_ref(&context))?;
        self.services
            .tasks
            .send(TaskEvent::new(&context.stream_id, node_id, vec![context.id]))
            .map_err(|_| StageError::TaskChannelClosed)
    }

    fn join(&self, index: NodeIndex, context: Context) -> Result<(), StageError> {
        let slot = &self.graph[index];
        let Some(policy) = &slot.join else {
            return self.forward(index, context);
        };
        match policy.offer(context, Instant::now()) {
            JoinOutcome::Pending => Ok(()),
            JoinOutcome::Release { merged, absorbed } => {
                self.absorb(&slot.node.id, absorbed)?;
                tracing::debug!(
                    node_id = %slot.node.id,
                    trace_id = %merged.trace_id,
                    "join released"
                );
                self.forward(index, merged)
            }
            JoinOutcome::Absorbed(context) => self.absorb(&slot.node.id, vec![context]),
        }
    }

    fn absorb(&self, node_id: &str, mut contexts: Vec<Context>) -> Result<(), StageError> {
        if contexts.is_empty() {
            return Ok(());
        }
        for context in &mut contexts {
            context.move_to(node_id, ContextStatus::Completed);
        }
        self.services.contexts.save(&contexts)?;
        Ok(())
    }

    fn finish(&self, index: NodeIndex, mut context: Context) -> Result<(), StageError> {
        context.move_to(&self.graph[index].node.id, ContextStatus::Completed);
        self.services.contexts.save(std::slice::from_ref(&context))?;
        tracing::debug!(context_id = %context.id, node_id = %context.position_id, "context completed");
        Ok(())
    }

    pub(crate) fn report(&self, node_id: &str, context: Context, error: StageError) {
        tracing::warn!(
            stream_id = %context.stream_id,
            node_id,
            context_id = %context.id,
            code = error.code(),
            error = %error,
            "stage failed"
        );
        let failure = StageFailure {
            definition_id: self.definition.id,
            stream_id: context.stream_id.clone(),
            node_id: node_id.to_string(),
            context,
            code: error.code(),
            message: error.to_string(),
        };
        if let Some(sink) = &self.services.failure_sink {
            let _ = sink.send(failure.clone());
        }
        self.failures.emit(failure);
    }
}
