//! Exception routing for failed tasks and stage failures.

use std::future::Future;
use std::pin::Pin;

use serde::Serialize;
use uuid::Uuid;

use streamflow_types::DataMap;
use streamflow_types::context::Context;

use super::TaskError;

/// What an exception handler receives about one failed batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionReport {
    pub handler_id: String,
    pub node_id: String,
    pub stream_id: String,
    pub context_ids: Vec<Uuid>,
    pub business_data: Vec<DataMap>,
    pub context_data: Vec<DataMap>,
    pub pass_data: Vec<DataMap>,
    pub message: String,
}

impl ExceptionReport {
    pub fn for_batch(
        handler_id: impl Into<String>,
        node_id: impl Into<String>,
        contexts: &[Context],
        message: impl Into<String>,
    ) -> Self {
        Self {
            handler_id: handler_id.into(),
            node_id: node_id.into(),
            stream_id: contexts
                .first()
                .map(|c| c.stream_id.clone())
                .unwrap_or_default(),
            context_ids: contexts.iter().map(|c| c.id).collect(),
            business_data: contexts.iter().map(|c| c.business_data.clone()).collect(),
            context_data: contexts.iter().map(|c| c.context_data.clone()).collect(),
            pass_data: contexts.iter().map(|c| c.pass_data.clone()).collect(),
            message: message.into(),
        }
    }
}

/// Delivers exception reports to the handler they name.
pub trait ExceptionRouter: Send + Sync {
    fn route(
        &self,
        report: &ExceptionReport,
    ) -> impl Future<Output = Result<(), TaskError>> + Send;
}

/// Object-safe version of [`ExceptionRouter`] with boxed futures.
pub trait ExceptionRouterDyn: Send + Sync {
    fn route_boxed<'a>(
        &'a self,
        report: &'a ExceptionReport,
    ) -> Pin<Box<dyn Future<Output = Result<(), TaskError>> + Send + 'a>>;
}

impl<T: ExceptionRouter> ExceptionRouterDyn for T {
    fn route_boxed<'a>(
        &'a self,
        report: &'a ExceptionReport,
    ) -> Pin<Box<dyn Future<Output = Result<(), TaskError>> + Send + 'a>> {
        Box::pin(self.route(report))
    }
}

/// Type-erased exception router.
pub struct BoxExceptionRouter {
    inner: Box<dyn ExceptionRouterDyn + Send + Sync>,
}

impl BoxExceptionRouter {
    pub fn new<T: ExceptionRouter + 'static>(router: T) -> Self {
        Self {
            inner: Box::new(router),
        }
    }

    pub async fn route(&self, report: &ExceptionReport) -> Result<(), TaskError> {
        self.inner.route_boxed(report).await
    }

    /// Send one report per handler id. A handler that fails is logged and
    /// the others still run. Returns how many handlers accepted the report.
    pub async fn route_all(
        &self,
        handler_ids: &[String],
        node_id: &str,
        contexts: &[Context],
        message: &str,
    ) -> usize {
        let mut routed = 0;
        for handler_id in handler_ids {
            let report = ExceptionReport::for_batch(handler_id, node_id, contexts, message);
            match self.route(&report).await {
                Ok(()) => routed += 1,
                Err(e) => tracing::error!(
                    handler_id = %handler_id,
                    node_id,
                    error = %e,
                    "exception handler failed"
                ),
            }
        }
        routed
    }
}
