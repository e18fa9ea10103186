//! `FlowEngine`: the entry point tying caches, pipelines and task handling
//! together.
//!
//! The engine owns two background workers:
//! - the task worker receives `TaskEvent`s from every pipeline and runs each
//!   one on its own tokio task, so pipeline producers never wait on operators
//! - the failure worker routes stage failures to the exception handlers of
//!   the node where they happened
//!
//! With a straggler timeout configured, a third worker sweeps join groups.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use streamflow_types::DataMap;
use streamflow_types::config::EngineConfig;
use streamflow_types::context::{Context, ContextStatus};
use streamflow_types::error::RepositoryError;
use streamflow_types::event::TaskEvent;

use crate::cache::{CacheError, PipelineCache};
use crate::lock::LockRegistry;
use crate::pipeline::{JoinRegistry, PipelineServices, StageError, StageFailure};
use crate::repository::{ContextRepository, DefinitionRepository};
use crate::task::{
    BoxExceptionRouter, ConverterRegistry, TaskEventHandler, TaskOperators,
};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Stage(#[from] StageError),

    #[error("context {context_id} belongs to stream '{actual}', not '{expected}'")]
    StreamMismatch {
        context_id: Uuid,
        expected: String,
        actual: String,
    },

    #[error("blocking section failed: {0}")]
    Blocking(String),
}

/// External collaborators the engine is built from.
pub struct EngineDeps<R> {
    pub definitions: Arc<R>,
    pub contexts: Arc<dyn ContextRepository>,
    pub converters: ConverterRegistry,
    pub operators: TaskOperators,
    pub exceptions: BoxExceptionRouter,
}

pub struct FlowEngine<R> {
    cache: Arc<PipelineCache<R>>,
    contexts: Arc<dyn ContextRepository>,
    locks: Arc<LockRegistry>,
    handler: Arc<TaskEventHandler<R>>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<R: DefinitionRepository + 'static> FlowEngine<R> {
    /// Build the engine and start its workers. Must be called from within a
    /// tokio runtime.
    pub fn start(config: &EngineConfig, deps: EngineDeps<R>) -> Self {
        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();
        let locks = LockRegistry::new();
        let services = PipelineServices {
            contexts: Arc::clone(&deps.contexts),
            locks: Arc::clone(&locks),
            tasks: task_tx,
            failure_sink: Some(failure_tx),
            join: config.join.clone(),
            joins: JoinRegistry::new(),
        };
        let cache = Arc::new(PipelineCache::new(deps.definitions, services, &config.cache));
        let handler = Arc::new(TaskEventHandler::new(
            Arc::clone(&cache),
            Arc::clone(&deps.contexts),
            Arc::clone(&locks),
            Arc::new(deps.converters),
            Arc::new(deps.operators),
            Arc::new(deps.exceptions),
            Duration::from_secs(config.task.operator_timeout_secs),
        ));
        let cancel = CancellationToken::new();

        let mut workers = vec![
            tokio::spawn(task_worker(Arc::clone(&handler), task_rx, cancel.clone())),
            tokio::spawn(failure_worker(Arc::clone(&handler), failure_rx, cancel.clone())),
        ];
        if let Some(secs) = config.join.straggler_timeout_secs {
            let period = Duration::from_secs(secs.max(2) / 2);
            workers.push(tokio::spawn(sweep_worker(Arc::clone(&cache), period, cancel.clone())));
        }
        tracing::info!(
            max_entries = config.cache.max_entries,
            idle_ttl_secs = config.cache.idle_ttl_secs,
            "flow engine started"
        );

        Self {
            cache,
            contexts: deps.contexts,
            locks,
            handler,
            cancel,
            workers: Mutex::new(workers),
        }
    }

    pub fn cache(&self) -> &Arc<PipelineCache<R>> {
        &self.cache
    }

    pub fn task_handler(&self) -> &Arc<TaskEventHandler<R>> {
        &self.handler
    }

    /// Start a new run of the flow published for `stream_id`. Returns the new
    /// context's id once the pipeline has processed it as far as it goes
    /// synchronously.
    pub async fn offer(&self, stream_id: &str, business_data: DataMap) -> Result<Uuid, EngineError> {
        let flow = self.cache.by_stream_id(stream_id).await?;
        let start = flow.pipeline.start_node().to_string();
        let context = Context::new(stream_id, flow.definition.id, &start, business_data);
        let id = context.id;
        tracing::debug!(stream_id, context_id = %id, "offering new context");

        let contexts = Arc::clone(&self.contexts);
        tokio::task::spawn_blocking(move || -> Result<usize, EngineError> {
            contexts.save(std::slice::from_ref(&context))?;
            Ok(flow.pipeline.inject(&start, vec![context])?)
        })
        .await
        .map_err(|e| EngineError::Blocking(e.to_string()))??;
        Ok(id)
    }

    /// Re-inject persisted contexts at their recorded position, for example
    /// after a crash. Completed contexts are skipped. Each context resumes on
    /// the definition version it started with. Returns how many resumed.
    pub async fn resume(&self, stream_id: &str, context_ids: &[Uuid]) -> Result<usize, EngineError> {
        let contexts = self.load(context_ids).await?;
        let mut by_definition: HashMap<Uuid, Vec<Context>> = HashMap::new();
        for context in contexts {
            if context.stream_id != stream_id {
                return Err(EngineError::StreamMismatch {
                    context_id: context.id,
                    expected: stream_id.to_string(),
                    actual: context.stream_id,
                });
            }
            if context.status.is_terminal() {
                tracing::debug!(context_id = %context.id, "skipping completed context");
                continue;
            }
            by_definition
                .entry(context.definition_id)
                .or_default()
                .push(context);
        }

        let mut resumed = 0;
        for (definition_id, contexts) in by_definition {
            let flow = self.cache.by_definition_id(definition_id).await?;
            resumed += contexts.len();
            tokio::task::spawn_blocking(move || -> Result<(), StageError> {
                for context in contexts {
                    let position = context.position_id.clone();
                    flow.pipeline.inject(&position, vec![context])?;
                }
                Ok(())
            })
            .await
            .map_err(|e| EngineError::Blocking(e.to_string()))??;
        }
        tracing::info!(stream_id, resumed, "contexts resumed");
        Ok(resumed)
    }

    /// Report that an operator finished a task it had accepted. `output` is
    /// merged into each context's business data before the contexts move on
    /// from `node_id`. Contexts not parked at `node_id` are ignored. Returns
    /// how many moved on.
    ///
    /// Waits while the task handler still holds the batch, so an operator
    /// that finishes inside `dispatch` must return `TaskOutcome::Completed`
    /// rather than call this.
    pub async fn complete_task(
        &self,
        node_id: &str,
        context_ids: &[Uuid],
        output: DataMap,
    ) -> Result<usize, EngineError> {
        let _hold = self.locks.hold_all(context_ids, node_id).await;
        let contexts = self.load(context_ids).await?;
        let mut by_definition: HashMap<Uuid, Vec<Context>> = HashMap::new();
        for mut context in contexts {
            if context.position_id != node_id || context.status != ContextStatus::Pending {
                tracing::warn!(
                    context_id = %context.id,
                    node_id,
                    position = %context.position_id,
                    status = context.status.as_str(),
                    "context is not waiting on this task"
                );
                continue;
            }
            context.merge_business_data(output.clone());
            by_definition
                .entry(context.definition_id)
                .or_default()
                .push(context);
        }

        let mut completed = 0;
        for (definition_id, contexts) in by_definition {
            let flow = self.cache.by_definition_id(definition_id).await?;
            completed += contexts.len();
            let node_id = node_id.to_string();
            tokio::task::spawn_blocking(move || flow.pipeline.forward_from(&node_id, contexts))
                .await
                .map_err(|e| EngineError::Blocking(e.to_string()))??;
        }
        Ok(completed)
    }

    /// Drop every cached pipeline.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn invalidate_stream(&self, stream_id: &str) -> bool {
        self.cache.invalidate_stream(stream_id)
    }

    pub fn invalidate_definition(&self, definition_id: Uuid) -> bool {
        self.cache.invalidate_definition(definition_id)
    }

    /// Expire overdue join groups in every cached pipeline now.
    pub fn sweep_joins(&self) -> usize {
        sweep(&self.cache, Instant::now())
    }

    /// Stop the workers and wait for them to exit. Task events still queued
    /// are dropped.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let workers = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(_) => Vec::new(),
        };
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "engine worker ended abnormally");
            }
        }
        tracing::info!("flow engine stopped");
    }

    async fn load(&self, ids: &[Uuid]) -> Result<Vec<Context>, EngineError> {
        let repository = Arc::clone(&self.contexts);
        let ids = ids.to_vec();
        let contexts = tokio::task::spawn_blocking(move || repository.get_by_ids(&ids))
            .await
            .map_err(|e| EngineError::Blocking(e.to_string()))??;
        Ok(contexts)
    }
}

impl<R> Drop for FlowEngine<R> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn sweep<R: DefinitionRepository>(cache: &PipelineCache<R>, now: Instant) -> usize {
    cache
        .flows()
        .iter()
        .map(|flow| flow.pipeline.sweep_joins(now))
        .sum()
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

async fn task_worker<R: DefinitionRepository + 'static>(
    handler: Arc<TaskEventHandler<R>>,
    mut events: mpsc::UnboundedReceiver<TaskEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    // Failures are logged and routed inside the handler.
                    let _ = handler.handle(event).await;
                });
            }
        }
    }
    tracing::debug!("task worker stopped");
}

async fn failure_worker<R: DefinitionRepository + 'static>(
    handler: Arc<TaskEventHandler<R>>,
    mut failures: mpsc::UnboundedReceiver<StageFailure>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            failure = failures.recv() => {
                let Some(failure) = failure else { break };
                if let Err(e) = handler.report_stage_failure(&failure).await {
                    tracing::error!(
                        node_id = %failure.node_id,
                        context_id = %failure.context.id,
                        error = %e,
                        "could not route stage failure"
                    );
                }
            }
        }
    }
    tracing::debug!("failure worker stopped");
}

async fn sweep_worker<R: DefinitionRepository + 'static>(
    cache: Arc<PipelineCache<R>>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let expired = sweep(&cache, Instant::now());
                if expired > 0 {
                    tracing::warn!(expired, "expired join groups swept");
                }
            }
        }
    }
}
