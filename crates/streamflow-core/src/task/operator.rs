//! Task operators: where a task batch is actually sent.
//!
//! `TaskOperator` uses native async fn in traits, so it cannot be a trait
//! object directly. The boxed form follows the usual blanket-impl pattern:
//! 1. `TaskOperatorDyn` is object safe and returns boxed futures
//! 2. every `T: TaskOperator` implements it
//! 3. `BoxTaskOperator` wraps `Box<dyn TaskOperatorDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use streamflow_types::context::Context;
use streamflow_types::definition::{TaskDescriptor, TaskSourceType};

use super::TaskError;

/// What an operator did with a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Accepted for asynchronous work. The contexts stay parked until
    /// `FlowEngine::complete_task` is called for them.
    Accepted,
    /// Done already. The returned contexts continue downstream right away.
    Completed(Vec<Context>),
}

/// External system that carries out tasks of one source type.
pub trait TaskOperator: Send + Sync {
    fn dispatch(
        &self,
        contexts: &[Context],
        task: &TaskDescriptor,
    ) -> impl Future<Output = Result<TaskOutcome, TaskError>> + Send;
}

/// Object-safe version of [`TaskOperator`] with boxed futures.
pub trait TaskOperatorDyn: Send + Sync {
    fn dispatch_boxed<'a>(
        &'a self,
        contexts: &'a [Context],
        task: &'a TaskDescriptor,
    ) -> Pin<Box<dyn Future<Output = Result<TaskOutcome, TaskError>> + Send + 'a>>;
}

impl<T: TaskOperator> TaskOperatorDyn for T {
    fn dispatch_boxed<'a>(
        &'a self,
        contexts: &'a [Context],
        task: &'a TaskDescriptor,
    ) -> Pin<Box<dyn Future<Output = Result<TaskOutcome, TaskError>> + Send + 'a>> {
        Box::pin(self.dispatch(contexts, task))
    }
}

/// Type-erased task operator.
pub struct BoxTaskOperator {
    inner: Box<dyn TaskOperatorDyn + Send + Sync>,
}

impl BoxTaskOperator {
    pub fn new<T: TaskOperator + 'static>(operator: T) -> Self {
        Self {
            inner: Box::new(operator),
        }
    }

    pub async fn dispatch(
        &self,
        contexts: &[Context],
        task: &TaskDescriptor,
    ) -> Result<TaskOutcome, TaskError> {
        self.inner.dispatch_boxed(contexts, task).await
    }
}

/// One operator per source type. Lookup is a total match, so a source type
/// without an operator cannot exist.
pub struct TaskOperators {
    manual: BoxTaskOperator,
    service: BoxTaskOperator,
    script: BoxTaskOperator,
}

impl TaskOperators {
    pub fn new(manual: BoxTaskOperator, service: BoxTaskOperator, script: BoxTaskOperator) -> Self {
        Self {
            manual,
            service,
            script,
        }
    }

    pub fn for_source(&self, source: TaskSourceType) -> &BoxTaskOperator {
        match source {
            TaskSourceType::Manual => &self.manual,
            TaskSourceType::Service => &self.service,
            TaskSourceType::Script => &self.script,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    struct Named(&'static str);

    impl TaskOperator for Named {
        async fn dispatch(
            &self,
            _contexts: &[Context],
            task: &TaskDescriptor,
        ) -> Result<TaskOutcome, TaskError> {
            if task.task_id == "boom" {
                return Err(TaskError::Dispatch(self.0.to_string()));
            }
            Ok(TaskOutcome::Accepted)
        }
    }

    fn operators() -> TaskOperators {
        TaskOperators::new(
            BoxTaskOperator::new(Named("manual")),
            BoxTaskOperator::new(Named("service")),
            BoxTaskOperator::new(Named("script")),
        )
    }

    #[tokio::test]
    async fn each_source_type_has_its_operator() {
        let operators = operators();
        let contexts = vec![Context::new("s", Uuid::nil(), "t", Default::default())];
        for (source, name) in [
            (TaskSourceType::Manual, "manual"),
            (TaskSourceType::Service, "service"),
            (TaskSourceType::Script, "script"),
        ] {
            let task = TaskDescriptor::new("boom", source);
            let err = operators
                .for_source(source)
                .dispatch(&contexts, &task)
                .await
                .unwrap_err();
            assert!(matches!(err, TaskError::Dispatch(n) if n == name));
        }
    }

    #[tokio::test]
    async fn boxed_operator_delegates() {
        let operator = BoxTaskOperator::new(Named("service"));
        let task = TaskDescriptor::new("ok", TaskSourceType::Service);
        assert_eq!(operator.dispatch(&[], &task).await.unwrap(), TaskOutcome::Accepted);
    }
}
