//! Task event handler.
//!
//! For each `TaskEvent`, holding the batch's (context, node) pairs throughout:
//! 1. load the batch's contexts and keep those still pending at the node
//! 2. resolve the compiled flow for their definition version
//! 3. find the task node and its descriptor
//! 4. run the node's converter over every context (merge, never replace)
//! 5. persist the converted contexts, under their (context, node) locks
//! 6. dispatch the batch to the operator for the task's source type
//! 7. forward right away if the operator completed the task
//!
//! A failed dispatch goes to every exception handler configured on the node
//! and is logged. Nothing is retried here; retry means redelivering the ids.
//! A redelivery that overlaps a running one waits for it, then only sees
//! the contexts that are still pending.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use streamflow_types::context::{Context, ContextStatus};
use streamflow_types::event::TaskEvent;

use super::converter::ConverterRegistry;
use super::exception::BoxExceptionRouter;
use super::operator::{TaskOperators, TaskOutcome};
use super::TaskError;
use crate::cache::PipelineCache;
use crate::lock::LockRegistry;
use crate::pipeline::StageFailure;
use crate::repository::{ContextRepository, DefinitionRepository};

/// Handles task events for every pipeline of one engine.
pub struct TaskEventHandler<R> {
    cache: Arc<PipelineCache<R>>,
    contexts: Arc<dyn ContextRepository>,
    locks: Arc<LockRegistry>,
    converters: Arc<ConverterRegistry>,
    operators: Arc<TaskOperators>,
    exceptions: Arc<BoxExceptionRouter>,
    dispatch_timeout: Duration,
}

impl<R: DefinitionRepository + 'static> TaskEventHandler<R> {
    pub fn new(
        cache: Arc<PipelineCache<R>>,
        contexts: Arc<dyn ContextRepository>,
        locks: Arc<LockRegistry>,
        converters: Arc<ConverterRegistry>,
        operators: Arc<TaskOperators>,
        exceptions: Arc<BoxExceptionRouter>,
        dispatch_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            contexts,
            locks,
            converters,
            operators,
            exceptions,
            dispatch_timeout,
        }
    }

    /// Run one task event to the point where the operator has it.
    pub async fn handle(&self, event: TaskEvent) -> Result<TaskOutcome, TaskError> {
        let result = self.run(&event).await;
        match &result {
            Err(TaskError::NothingWaiting(_)) => tracing::debug!(
                stream_id = %event.stream_id,
                node_id = %event.node_id,
                "task event already handled"
            ),
            Err(e) => tracing::error!(
                stream_id = %event.stream_id,
                node_id = %event.node_id,
                context_ids = ?event.context_ids,
                error = %e,
                "task event failed"
            ),
            Ok(_) => {}
        }
        result
    }

    async fn run(&self, event: &TaskEvent) -> Result<TaskOutcome, TaskError> {
        let _hold = self.locks.hold_all(&event.context_ids, &event.node_id).await;

        let loaded = self.load(&event.context_ids).await?;
        let Some(definition_id) = loaded.first().map(|c| c.definition_id) else {
            return Err(TaskError::ContextsNotFound(event.context_ids.clone()));
        };
        let flow = self.cache.by_definition_id(definition_id).await?;
        let node = flow
            .definition
            .node(&event.node_id)
            .ok_or_else(|| TaskError::NodeNotFound(event.node_id.clone()))?;
        let task = node
            .task
            .as_ref()
            .ok_or_else(|| TaskError::NotATask(event.node_id.clone()))?;

        let mut contexts = waiting_at(&event.node_id, loaded);
        if contexts.is_empty() {
            return Err(TaskError::NothingWaiting(event.node_id.clone()));
        }

        self.converters.apply(&mut contexts, task)?;
        self.persist(&event.node_id, contexts.clone()).await?;

        tracing::info!(
            stream_id = %event.stream_id,
            node_id = %event.node_id,
            task_id = %task.task_id,
            source = ?task.source_type,
            batch = contexts.len(),
            "dispatching task"
        );
        let operator = self.operators.for_source(task.source_type);
        let outcome = match tokio::time::timeout(
            self.dispatch_timeout,
            operator.dispatch(&contexts, task),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TaskError::Timeout(self.dispatch_timeout)),
        };

        match outcome {
            Ok(TaskOutcome::Completed(done)) => {
                let node_id = event.node_id.clone();
                let forwarded = done.clone();
                let flow = Arc::clone(&flow);
                tokio::task::spawn_blocking(move || flow.pipeline.forward_from(&node_id, forwarded))
                    .await
                    .map_err(|e| TaskError::Blocking(e.to_string()))??;
                Ok(TaskOutcome::Completed(done))
            }
            Ok(TaskOutcome::Accepted) => Ok(TaskOutcome::Accepted),
            Err(error) => {
                let routed = self
                    .exceptions
                    .route_all(
                        &node.exception_handlers,
                        &event.node_id,
                        &contexts,
                        &error.to_string(),
                    )
                    .await;
                tracing::debug!(node_id = %event.node_id, routed, "dispatch failure routed");
                Err(error)
            }
        }
    }

    /// Route a pipeline stage failure to the exception handlers of the node
    /// it happened at.
    pub async fn report_stage_failure(&self, failure: &StageFailure) -> Result<usize, TaskError> {
        let flow = self.cache.by_definition_id(failure.definition_id).await?;
        let handlers = flow
            .definition
            .node(&failure.node_id)
            .map(|n| n.exception_handlers.clone())
            .unwrap_or_default();
        Ok(self
            .exceptions
            .route_all(
                &handlers,
                &failure.node_id,
                std::slice::from_ref(&failure.context),
                &failure.message,
            )
            .await)
    }

    async fn load(&self, ids: &[Uuid]) -> Result<Vec<Context>, TaskError> {
        let repository = Arc::clone(&self.contexts);
        let ids_owned = ids.to_vec();
        let contexts = tokio::task::spawn_blocking(move || repository.get_by_ids(&ids_owned))
            .await
            .map_err(|e| TaskError::Blocking(e.to_string()))??;
        if contexts.is_empty() {
            return Err(TaskError::ContextsNotFound(ids.to_vec()));
        }
        if contexts.len() < ids.len() {
            tracing::warn!(
                requested = ids.len(),
                found = contexts.len(),
                "some task contexts are missing"
            );
        }
        Ok(contexts)
    }

    async fn persist(&self, node_id: &str, contexts: Vec<Context>) -> Result<(), TaskError> {
        let repository = Arc::clone(&self.contexts);
        let locks = Arc::clone(&self.locks);
        let node_id = node_id.to_string();
        tokio::task::spawn_blocking(move || {
            let ids: Vec<Uuid> = contexts.iter().map(|c| c.id).collect();
            let _guards = locks.acquire_all(&ids, &node_id);
            repository.save(&contexts)
        })
        .await
        .map_err(|e| TaskError::Blocking(e.to_string()))??;
        Ok(())
    }
}

/// Keep the contexts parked at `node_id`. Anything else has moved on since
/// the event was raised.
fn waiting_at(node_id: &str, contexts: Vec<Context>) -> Vec<Context> {
    let total = contexts.len();
    let waiting: Vec<Context> = contexts
        .into_iter()
        .filter(|c| c.position_id == node_id && c.status == ContextStatus::Pending)
        .collect();
    if waiting.len() < total {
        tracing::warn!(
            node_id,
            skipped = total - waiting.len(),
            "contexts no longer pending at the task node"
        );
    }
    waiting
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use dashmap::DashMap;
    use serde_json::json;
    use streamflow_types::DataMap;
    use streamflow_types::config::CacheConfig;
    use streamflow_types::definition::{
        Definition, Node, NodeKind, TaskDescriptor, TaskSourceType,
    };
    use streamflow_types::error::RepositoryError;

    use crate::pipeline::tests::{MemoryContexts, harness};
    use crate::task::exception::{ExceptionReport, ExceptionRouter};
    use crate::task::operator::{BoxTaskOperator, TaskOperator};

    #[derive(Default)]
    struct Definitions(DashMap<Uuid, Definition>);

    impl DefinitionRepository for Definitions {
        async fn find_by_stream_id(
            &self,
            stream_id: &str,
        ) -> Result<Option<Definition>, RepositoryError> {
            Ok(self
                .0
                .iter()
                .find(|d| d.stream_id == stream_id)
                .map(|d| d.clone()))
        }

        async fn find(&self, id: &Uuid) -> Result<Option<Definition>, RepositoryError> {
            Ok(self.0.get(id).map(|d| d.clone()))
        }
    }

    enum Behaviour {
        Accept,
        Complete,
        Fail,
        Hang,
        /// Completes after a short delay.
        Slow,
    }

    #[derive(Clone, Default)]
    struct Gauge {
        calls: Arc<AtomicUsize>,
        inside: Arc<AtomicUsize>,
        max_inside: Arc<AtomicUsize>,
    }

    struct Scripted {
        behaviour: Behaviour,
        gauge: Gauge,
    }

    impl TaskOperator for Scripted {
        async fn dispatch(
            &self,
            contexts: &[Context],
            _task: &TaskDescriptor,
        ) -> Result<TaskOutcome, TaskError> {
            self.gauge.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.gauge.inside.fetch_add(1, Ordering::SeqCst) + 1;
            self.gauge.max_inside.fetch_max(now, Ordering::SeqCst);
            let outcome = match self.behaviour {
                Behaviour::Accept => Ok(TaskOutcome::Accepted),
                Behaviour::Complete => Ok(TaskOutcome::Completed(contexts.to_vec())),
                Behaviour::Fail => Err(TaskError::Dispatch("service unavailable".into())),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(TaskOutcome::Accepted)
                }
                Behaviour::Slow => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(TaskOutcome::Completed(contexts.to_vec()))
                }
            };
            self.gauge.inside.fetch_sub(1, Ordering::SeqCst);
            outcome
        }
    }

    #[derive(Clone, Default)]
    struct Reports(Arc<Mutex<Vec<ExceptionReport>>>);

    impl ExceptionRouter for Reports {
        async fn route(&self, report: &ExceptionReport) -> Result<(), TaskError> {
            self.0.lock().unwrap().push(report.clone());
            Ok(())
        }
    }

    struct Fixture {
        handler: TaskEventHandler<Definitions>,
        contexts: Arc<MemoryContexts>,
        reports: Reports,
        calls: Arc<AtomicUsize>,
        gauge: Gauge,
        definition: Definition,
    }

    fn fixture(behaviour: Behaviour) -> Fixture {
        let definition = Definition {
            id: Uuid::now_v7(),
            stream_id: "orders".into(),
            version: "1".into(),
            name: String::new(),
            nodes: vec![
                Node::new("start", NodeKind::Start).to("enrich"),
                Node::new("enrich", NodeKind::Task)
                    .with_task(
                        TaskDescriptor::new("enrich", TaskSourceType::Service)
                            .with_converter("add-x"),
                    )
                    .with_exception_handler("alert")
                    .with_exception_handler("audit")
                    .to("end"),
                Node::new("end", NodeKind::End),
            ],
        };
        let definitions = Definitions::default();
        definitions.0.insert(definition.id, definition.clone());

        let h = harness();
        let contexts = Arc::clone(&h.contexts);
        let cache = Arc::new(PipelineCache::new(
            Arc::new(definitions),
            h.services.clone(),
            &CacheConfig::default(),
        ));

        let converters = ConverterRegistry::new();
        converters.register("add-x", |_: &Context, _: &TaskDescriptor| -> Result<DataMap, TaskError> {
            Ok(json!({"x": 42}).as_object().cloned().unwrap_or_default())
        });

        let gauge = Gauge::default();
        let calls = Arc::clone(&gauge.calls);
        let operator = |gauge: &Gauge, behaviour| {
            BoxTaskOperator::new(Scripted {
                behaviour,
                gauge: gauge.clone(),
            })
        };
        let operators = TaskOperators::new(
            operator(&gauge, Behaviour::Fail),
            operator(&gauge, behaviour),
            operator(&gauge, Behaviour::Fail),
        );
        let reports = Reports::default();

        let handler = TaskEventHandler::new(
            cache,
            contexts.clone(),
            Arc::clone(&h.services.locks),
            Arc::new(converters),
            Arc::new(operators),
            Arc::new(BoxExceptionRouter::new(reports.clone())),
            Duration::from_secs(5),
        );
        Fixture {
            handler,
            contexts,
            reports,
            calls,
            gauge,
            definition,
        }
    }

    fn park(fixture: &Fixture, n: usize) -> Vec<Uuid> {
        (0..n)
            .map(|i| {
                let mut ctx = Context::new(
                    "orders",
                    fixture.definition.id,
                    "start",
                    json!({"keep": i, "name": "n"}).as_object().cloned().unwrap(),
                );
                ctx.move_to("enrich", ContextStatus::Pending);
                fixture.contexts.save(&[ctx.clone()]).unwrap();
                ctx.id
            })
            .collect()
    }

    fn event(ids: Vec<Uuid>) -> TaskEvent {
        TaskEvent::new("orders", "enrich", ids)
    }

    #[tokio::test]
    async fn converter_output_is_merged_and_persisted() {
        let f = fixture(Behaviour::Accept);
        let ids = park(&f, 3);

        let outcome = f.handler.handle(event(ids.clone())).await.unwrap();

        assert_eq!(outcome, TaskOutcome::Accepted);
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
        for (i, id) in ids.iter().enumerate() {
            let stored = f.contexts.records.get(id).unwrap().clone();
            assert_eq!(stored.business_data["x"], json!(42));
            assert_eq!(stored.business_data["keep"], json!(i));
            assert_eq!(stored.business_data["name"], json!("n"));
            assert_eq!(stored.status, ContextStatus::Pending);
        }
    }

    #[tokio::test]
    async fn completed_tasks_move_on() {
        let f = fixture(Behaviour::Complete);
        let ids = park(&f, 2);

        f.handler.handle(event(ids.clone())).await.unwrap();

        for id in &ids {
            let stored = f.contexts.records.get(id).unwrap().clone();
            assert_eq!(stored.position_id, "end");
            assert_eq!(stored.status, ContextStatus::Completed);
            assert_eq!(stored.business_data["x"], json!(42));
        }
    }

    #[tokio::test]
    async fn dispatch_failure_reaches_every_handler() {
        let f = fixture(Behaviour::Fail);
        let ids = park(&f, 2);

        let err = f.handler.handle(event(ids.clone())).await.unwrap_err();

        assert!(matches!(err, TaskError::Dispatch(_)));
        let reports = f.reports.0.lock().unwrap();
        let handlers: Vec<&str> = reports.iter().map(|r| r.handler_id.as_str()).collect();
        assert_eq!(handlers, vec!["alert", "audit"]);
        assert_eq!(reports[0].node_id, "enrich");
        assert_eq!(reports[0].context_ids, ids);
        assert!(reports[0].message.contains("service unavailable"));
        assert_eq!(reports[0].business_data[0]["x"], json!(42));
        drop(reports);

        let stored = f.contexts.records.get(&ids[0]).unwrap().clone();
        assert_eq!(stored.position_id, "enrich");
        assert_eq!(f.calls.load(Ordering::SeqCst), 1, "no retry");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_operator_times_out() {
        let f = fixture(Behaviour::Hang);
        let ids = park(&f, 1);

        let err = f.handler.handle(event(ids)).await.unwrap_err();

        assert!(matches!(err, TaskError::Timeout(_)));
        assert_eq!(f.reports.0.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unknown_ids_fail_before_dispatch() {
        let f = fixture(Behaviour::Accept);

        let err = f.handler.handle(event(vec![Uuid::now_v7()])).await.unwrap_err();

        assert!(matches!(err, TaskError::ContextsNotFound(_)));
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
        assert!(f.reports.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn wrong_node_fails_before_dispatch() {
        let f = fixture(Behaviour::Accept);
        let ids = park(&f, 1);

        let err = f
            .handler
            .handle(TaskEvent::new("orders", "end", ids))
            .await
            .unwrap_err();

        assert!(matches!(err, TaskError::NotATask(node) if node == "end"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_redelivery_dispatches_once() {
        let f = Arc::new(fixture(Behaviour::Slow));
        let ids = park(&f, 2);

        let first = {
            let f = Arc::clone(&f);
            let ids = ids.clone();
            tokio::spawn(async move { f.handler.handle(event(ids)).await })
        };
        let second = {
            let f = Arc::clone(&f);
            let ids = ids.clone();
            tokio::spawn(async move { f.handler.handle(event(ids)).await })
        };
        let results = [first.await.unwrap(), second.await.unwrap()];

        assert_eq!(f.gauge.max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Ok(TaskOutcome::Completed(_))))
                .count(),
            1
        );
        assert!(
            results
                .iter()
                .any(|r| matches!(r, Err(TaskError::NothingWaiting(node)) if node == "enrich"))
        );
        for id in &ids {
            let stored = f.contexts.records.get(id).unwrap().clone();
            assert_eq!(stored.position_id, "end");
        }
    }

    #[tokio::test]
    async fn late_redelivery_skips_contexts_that_moved_on() {
        let f = fixture(Behaviour::Complete);
        let ids = park(&f, 1);
        f.handler.handle(event(ids.clone())).await.unwrap();

        let err = f.handler.handle(event(ids.clone())).await.unwrap_err();
        assert!(matches!(err, TaskError::NothingWaiting(_)));

        let fresh = park(&f, 1);
        let mixed = vec![ids[0], fresh[0]];
        let outcome = f.handler.handle(event(mixed)).await.unwrap();
        let TaskOutcome::Completed(done) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].id, fresh[0]);
        assert_eq!(f.calls.load(Ordering::SeqCst), 2);
    }
}
