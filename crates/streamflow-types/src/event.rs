//! Events exchanged between the compiled pipeline and task handling.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A node produced a task for a batch of persisted contexts.
///
/// One task instance is always backed by exactly one such batch; grouping
/// happens upstream, before the event is raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Persisted context ids making up the batch.
    pub context_ids: Vec<Uuid>,
    /// External stream id owning the contexts.
    pub stream_id: String,
    /// Task node the batch is waiting at.
    pub node_id: String,
}

impl TaskEvent {
    pub fn new(stream_id: impl Into<String>, node_id: impl Into<String>, context_ids: Vec<Uuid>) -> Self {
        Self {
            context_ids,
            stream_id: stream_id.into(),
            node_id: node_id.into(),
        }
    }
}
