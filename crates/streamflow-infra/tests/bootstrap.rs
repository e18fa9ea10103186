//! Start-up through `bootstrap::start_engine`. Kept in its own test binary
//! because it installs the process-wide tracing subscriber.

use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;
use uuid::Uuid;

use streamflow_core::engine::EngineDeps;
use streamflow_core::repository::ContextRepository;
use streamflow_core::task::{BoxExceptionRouter, BoxTaskOperator, ConverterRegistry, TaskOperators};
use streamflow_infra::bootstrap::start_engine;
use streamflow_infra::config::CONFIG_FILE;
use streamflow_infra::exception::LoggingExceptionRouter;
use streamflow_infra::memory::{MemoryContextRepository, MemoryDefinitionRepository};
use streamflow_infra::operator::LoggingOperator;
use streamflow_observe::tracing_setup::init_tracing;
use streamflow_types::context::ContextStatus;
use streamflow_types::definition::{Definition, Node, NodeKind};

#[tokio::test]
async fn start_engine_installs_tracing_and_runs_flows() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    tokio::fs::write(
        tmp.path().join(CONFIG_FILE),
        "[cache]\nmax_entries = 4\n",
    )
    .await?;

    let definitions = MemoryDefinitionRepository::new();
    definitions.publish(Definition {
        id: Uuid::now_v7(),
        stream_id: "orders".into(),
        version: "1".into(),
        name: "orders".into(),
        nodes: vec![
            Node::new("start", NodeKind::Start).to("end"),
            Node::new("end", NodeKind::End),
        ],
    })?;
    let contexts = Arc::new(MemoryContextRepository::new());
    let deps = EngineDeps {
        definitions: Arc::new(definitions),
        contexts: contexts.clone(),
        converters: ConverterRegistry::new(),
        operators: TaskOperators::new(
            BoxTaskOperator::new(LoggingOperator),
            BoxTaskOperator::new(LoggingOperator),
            BoxTaskOperator::new(LoggingOperator),
        ),
        exceptions: BoxExceptionRouter::new(LoggingExceptionRouter::new(8)),
    };

    let engine = start_engine(tmp.path(), true, deps).await;
    assert!(init_tracing(false).is_err(), "subscriber already installed");

    let id = engine
        .offer("orders", json!({"n": 1}).as_object().cloned().unwrap_or_default())
        .await?;
    let stored = contexts.get_by_ids(&[id])?.remove(0);
    assert_eq!(stored.position_id, "end");
    assert_eq!(stored.status, ContextStatus::Completed);

    engine.shutdown().await;
    Ok(())
}
