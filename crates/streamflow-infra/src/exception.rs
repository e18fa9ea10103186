//! Exception router that writes reports to the log.
//!
//! Useful where no external incident system is wired in: every report still
//! ends up somewhere an operator can find it.

use std::sync::Mutex;

use streamflow_core::task::{ExceptionReport, ExceptionRouter, TaskError};

/// Logs each report at `error` level and keeps the most recent ones.
pub struct LoggingExceptionRouter {
    recent: Mutex<Vec<ExceptionReport>>,
    keep: usize,
}

impl LoggingExceptionRouter {
    pub fn new(keep: usize) -> Self {
        Self {
            recent: Mutex::new(Vec::new()),
            keep,
        }
    }

    /// Reports received so far, oldest first, at most `keep` of them.
    pub fn recent(&self) -> Vec<ExceptionReport> {
        self.recent.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl Default for LoggingExceptionRouter {
    fn default() -> Self {
        Self::new(100)
    }
}

impl ExceptionRouter for LoggingExceptionRouter {
    async fn route(&self, report: &ExceptionReport) -> Result<(), TaskError> {
        let payload = serde_json::to_string(report)
            .map_err(|e| TaskError::Routing(format!("cannot encode report: {e}")))?;
        tracing::error!(
            handler_id = %report.handler_id,
            node_id = %report.node_id,
            stream_id = %report.stream_id,
            contexts = report.context_ids.len(),
            message = %report.message,
            payload = %payload,
            "exception reported"
        );
        let mut recent = self
            .recent
            .lock()
            .map_err(|_| TaskError::Routing("report buffer poisoned".into()))?;
        recent.push(report.clone());
        if recent.len() > self.keep {
            let overflow = recent.len() - self.keep;
            recent.drain(..overflow);
        }
        Ok(())
    }
}
