//! End-to-end runs through `FlowEngine` with the in-memory adapters.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use streamflow_core::engine::{EngineDeps, FlowEngine};
use streamflow_core::repository::ContextRepository;
use streamflow_core::stream::{Recorder, UNBOUNDED};
use streamflow_core::task::{
    BoxExceptionRouter, BoxTaskOperator, ConverterRegistry, ExceptionReport, ExceptionRouter,
    TaskError, TaskOperator, TaskOperators, TaskOutcome,
};
use streamflow_infra::memory::{MemoryContextRepository, MemoryDefinitionRepository};
use streamflow_infra::operator::LoggingOperator;
use streamflow_types::DataMap;
use streamflow_types::config::EngineConfig;
use streamflow_types::context::{Context, ContextStatus};
use streamflow_types::definition::{Definition, Node, NodeKind, TaskDescriptor, TaskSourceType};
use streamflow_types::event::TaskEvent;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct Reports(Arc<Mutex<Vec<ExceptionReport>>>);

impl ExceptionRouter for Reports {
    async fn route(&self, report: &ExceptionReport) -> Result<(), TaskError> {
        self.0.lock().unwrap().push(report.clone());
        Ok(())
    }
}

/// Accepts every batch and tells the test about it.
struct Signalling(mpsc::UnboundedSender<Vec<Uuid>>);

impl TaskOperator for Signalling {
    async fn dispatch(
        &self,
        contexts: &[Context],
        _task: &TaskDescriptor,
    ) -> Result<TaskOutcome, TaskError> {
        let _ = self.0.send(contexts.iter().map(|c| c.id).collect());
        Ok(TaskOutcome::Accepted)
    }
}

struct Setup {
    engine: FlowEngine<MemoryDefinitionRepository>,
    contexts: Arc<MemoryContextRepository>,
    reports: Reports,
    dispatched: mpsc::UnboundedReceiver<Vec<Uuid>>,
}

fn data(value: serde_json::Value) -> DataMap {
    value.as_object().cloned().unwrap()
}

fn definition(stream_id: &str, nodes: Vec<Node>) -> Definition {
    Definition {
        id: Uuid::now_v7(),
        stream_id: stream_id.into(),
        version: "1".into(),
        name: stream_id.into(),
        nodes,
    }
}

fn branching() -> Definition {
    definition(
        "branching",
        vec![
            Node::new("start", NodeKind::Start).to("check"),
            Node::new("check", NodeKind::Condition)
                .with_exception_handler("routing-alerts")
                .when("businessData.flag", "a")
                .when("businessData.flag == false", "b"),
            Node::new("a", NodeKind::End),
            Node::new("b", NodeKind::End),
        ],
    )
}

fn review() -> Definition {
    definition(
        "review",
        vec![
            Node::new("start", NodeKind::Start).to("enrich"),
            Node::new("enrich", NodeKind::Task)
                .with_task(
                    TaskDescriptor::new("enrich", TaskSourceType::Service).with_converter("add-x"),
                )
                .to("end"),
            Node::new("end", NodeKind::End),
        ],
    )
}

fn setup(definitions: Vec<Definition>) -> Setup {
    let repo = MemoryDefinitionRepository::new();
    for def in definitions {
        repo.publish(def).unwrap();
    }
    let contexts = Arc::new(MemoryContextRepository::new());

    let converters = ConverterRegistry::new();
    converters.register(
        "add-x",
        |_: &Context, _: &TaskDescriptor| -> Result<DataMap, TaskError> {
            Ok(data(json!({"x": "converted"})))
        },
    );

    let (tx, dispatched) = mpsc::unbounded_channel();
    let reports = Reports::default();
    let engine = FlowEngine::start(
        &EngineConfig::default(),
        EngineDeps {
            definitions: Arc::new(repo),
            contexts: contexts.clone(),
            converters,
            operators: TaskOperators::new(
                BoxTaskOperator::new(LoggingOperator),
                BoxTaskOperator::new(Signalling(tx)),
                BoxTaskOperator::new(LoggingOperator),
            ),
            exceptions: BoxExceptionRouter::new(reports.clone()),
        },
    );
    Setup {
        engine,
        contexts,
        reports,
        dispatched,
    }
}

fn stored(setup: &Setup, id: Uuid) -> Context {
    setup.contexts.get_by_ids(&[id]).unwrap().remove(0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn true_flag_reaches_only_branch_a() {
    let setup = setup(vec![branching()]);
    let flow = setup.engine.cache().by_stream_id("branching").await.unwrap();
    let a = Recorder::<Context>::new(UNBOUNDED);
    let b = Recorder::<Context>::new(UNBOUNDED);
    flow.pipeline.arrivals("a").unwrap().subscribe(a.clone());
    flow.pipeline.arrivals("b").unwrap().subscribe(b.clone());

    let id = setup
        .engine
        .offer("branching", data(json!({"flag": true})))
        .await
        .unwrap();

    assert_eq!(a.values().len(), 1);
    assert_eq!(a.values()[0].id, id);
    assert!(b.values().is_empty());
    let ctx = stored(&setup, id);
    assert_eq!(ctx.position_id, "a");
    assert_eq!(ctx.status, ContextStatus::Completed);

    setup.engine.shutdown().await;
}

#[tokio::test]
async fn converter_output_lands_on_every_context_of_a_batch() {
    let setup = setup(vec![review()]);
    let flow = setup.engine.cache().by_stream_id("review").await.unwrap();

    let ids: Vec<Uuid> = (0..3)
        .map(|i| {
            let mut ctx = Context::new(
                "review",
                flow.definition.id,
                "start",
                data(json!({"order": i, "customer": "acme"})),
            );
            ctx.move_to("enrich", ContextStatus::Pending);
            setup.contexts.save(&[ctx.clone()]).unwrap();
            ctx.id
        })
        .collect();

    let outcome = setup
        .engine
        .task_handler()
        .handle(TaskEvent::new("review", "enrich", ids.clone()))
        .await
        .unwrap();

    assert_eq!(outcome, TaskOutcome::Accepted);
    for (i, id) in ids.iter().enumerate() {
        let ctx = stored(&setup, *id);
        assert_eq!(ctx.business_data["x"], json!("converted"));
        assert_eq!(ctx.business_data["order"], json!(i));
        assert_eq!(ctx.business_data["customer"], json!("acme"));
    }

    setup.engine.shutdown().await;
}

#[tokio::test]
async fn accepted_task_completes_later() {
    let mut setup = setup(vec![review()]);

    let id = setup
        .engine
        .offer("review", data(json!({"order": 1})))
        .await
        .unwrap();
    let batch = tokio::time::timeout(Duration::from_secs(5), setup.dispatched.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(batch, vec![id]);
    assert_eq!(stored(&setup, id).status, ContextStatus::Pending);

    let moved = setup
        .engine
        .complete_task("enrich", &[id], data(json!({"approved": true})))
        .await
        .unwrap();

    assert_eq!(moved, 1);
    let ctx = stored(&setup, id);
    assert_eq!(ctx.position_id, "end");
    assert_eq!(ctx.status, ContextStatus::Completed);
    assert_eq!(ctx.business_data["approved"], json!(true));
    assert_eq!(ctx.business_data["x"], json!("converted"));

    let again = setup
        .engine
        .complete_task("enrich", &[id], DataMap::new())
        .await
        .unwrap();
    assert_eq!(again, 0, "completed contexts do not move twice");

    setup.engine.shutdown().await;
}

#[tokio::test]
async fn condition_errors_reach_the_node_exception_handlers() {
    let setup = setup(vec![branching()]);

    let id = setup
        .engine
        .offer("branching", data(json!({"flag": "yes"})))
        .await
        .unwrap();

    let reports = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let reports = setup.reports.0.lock().unwrap().clone();
            if !reports.is_empty() {
                return reports;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].handler_id, "routing-alerts");
    assert_eq!(reports[0].node_id, "check");
    assert_eq!(reports[0].context_ids, vec![id]);
    let ctx = stored(&setup, id);
    assert_eq!(ctx.position_id, "check");
    assert_eq!(ctx.status, ContextStatus::Ready);

    setup.engine.shutdown().await;
}

#[tokio::test]
async fn resume_reinjects_at_the_persisted_position() -> anyhow::Result<()> {
    let setup = setup(vec![branching()]);
    let flow = setup.engine.cache().by_stream_id("branching").await?;

    let mut waiting = Context::new(
        "branching",
        flow.definition.id,
        "start",
        data(json!({"flag": false})),
    );
    waiting.move_to("check", ContextStatus::Ready);
    let mut done = Context::new("branching", flow.definition.id, "start", DataMap::new());
    done.move_to("a", ContextStatus::Completed);
    setup.contexts.save(&[waiting.clone(), done.clone()])?;

    let resumed = setup
        .engine
        .resume("branching", &[waiting.id, done.id])
        .await?;

    assert_eq!(resumed, 1);
    let ctx = stored(&setup, waiting.id);
    assert_eq!(ctx.position_id, "b");
    assert_eq!(ctx.status, ContextStatus::Completed);

    let err = setup.engine.resume("other", &[waiting.id]).await.unwrap_err();
    assert!(err.to_string().contains("belongs to stream"));

    setup.engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn invalidation_drops_cached_pipelines() {
    let setup = setup(vec![branching()]);
    let first = setup.engine.cache().by_stream_id("branching").await.unwrap();
    assert_eq!(setup.engine.cache().entry_counts(), (1, 1));

    assert!(setup.engine.invalidate_stream("branching"));
    assert!(!setup.engine.invalidate_stream("branching"));
    assert!(setup.engine.invalidate_definition(first.definition.id));
    assert_eq!(setup.engine.cache().entry_counts(), (0, 0));

    let again = setup.engine.cache().by_stream_id("branching").await.unwrap();
    assert_eq!(again.definition.id, first.definition.id);
    assert!(!Arc::ptr_eq(&first, &again));
    setup.engine.clear_cache();
    assert_eq!(setup.engine.cache().entry_counts(), (0, 0));

    setup.engine.shutdown().await;
}
