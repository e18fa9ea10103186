//! Context tokens: the unit of work carried through a compiled pipeline.
//!
//! A context is created when an external trigger reaches a start node and is
//! mutated at every node transition. After each transition it is persisted so
//! that a run can resume from its last position after a crash.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::DataMap;

// ---------------------------------------------------------------------------
// ContextStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a context token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStatus {
    /// Created by a trigger, not yet accepted by the start node.
    New,
    /// Sitting at `position_id`, ready to be processed by that node.
    Ready,
    /// Handed to a task operator; waiting for the task to complete.
    Pending,
    /// Reached an end node.
    Completed,
}

impl ContextStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextStatus::New => "new",
            ContextStatus::Ready => "ready",
            ContextStatus::Pending => "pending",
            ContextStatus::Completed => "completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ContextStatus::Completed)
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Persisted context record.
///
/// `root_id` and `trace_id` link every token of one run: forks share them,
/// joins aggregate on `trace_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Context {
    pub id: Uuid,
    pub root_id: Uuid,
    pub trace_id: Uuid,
    /// External stream id this context runs in.
    pub stream_id: String,
    /// Definition version the context is bound to for its whole life.
    pub definition_id: Uuid,
    /// Node the context currently sits at.
    pub position_id: String,
    #[serde(default)]
    pub business_data: DataMap,
    /// Engine-internal carry-over between nodes.
    #[serde(default)]
    pub pass_data: DataMap,
    #[serde(default)]
    pub context_data: DataMap,
    pub status: ContextStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Context {
    /// Create a fresh context at a start node. The new context is its own root.
    pub fn new(
        stream_id: impl Into<String>,
        definition_id: Uuid,
        start_node: impl Into<String>,
        business_data: DataMap,
    ) -> Self {
        let id = Uuid::now_v7();
        let now = Utc::now();
        Self {
            id,
            root_id: id,
            trace_id: Uuid::now_v7(),
            stream_id: stream_id.into(),
            definition_id,
            position_id: start_node.into(),
            business_data,
            pass_data: DataMap::new(),
            context_data: DataMap::new(),
            status: ContextStatus::New,
            created_at: now,
            updated_at: now,
        }
    }

    /// Copy this context onto a parallel branch: new id, same root and trace.
    pub fn fork(&self) -> Self {
        let mut forked = self.clone();
        forked.id = Uuid::now_v7();
        forked.updated_at = Utc::now();
        forked
    }

    /// Record a transition to `node_id` with the given status.
    pub fn move_to(&mut self, node_id: &str, status: ContextStatus) {
        self.position_id = node_id.to_string();
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Merge `fields` into the business data. Existing keys not present in
    /// `fields` are kept; keys present in both take the new value.
    pub fn merge_business_data(&mut self, fields: DataMap) {
        for (key, value) in fields {
            self.business_data.insert(key, value);
        }
        self.updated_at = Utc::now();
    }

    /// Merge `fields` into the pass data, with the same rules as
    /// [`Context::merge_business_data`].
    pub fn merge_pass_data(&mut self, fields: DataMap) {
        for (key, value) in fields {
            self.pass_data.insert(key, value);
        }
        self.updated_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
