//! Operator that logs and accepts every batch.
//!
//! Stands in for source types that have no external system yet. Accepted
//! contexts stay parked until `FlowEngine::complete_task` is called.

use streamflow_core::task::{TaskError, TaskOperator, TaskOutcome};
use streamflow_types::context::Context;
use streamflow_types::definition::TaskDescriptor;

#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingOperator;

impl TaskOperator for LoggingOperator {
    async fn dispatch(
        &self,
        contexts: &[Context],
        task: &TaskDescriptor,
    ) -> Result<TaskOutcome, TaskError> {
        tracing::info!(
            task_id = %task.task_id,
            source = ?task.source_type,
            batch = contexts.len(),
            "task accepted"
        );
        Ok(TaskOutcome::Accepted)
    }
}
