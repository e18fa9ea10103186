//! Shared domain types for the streamflow engine.
//!
//! Contexts, flow definitions, task events and engine configuration, plus the
//! repository error used by the port traits in `streamflow-core`.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod context;
pub mod definition;
pub mod error;
pub mod event;

/// Free-form data map carried by a context (`businessData`, `passData`, ...).
pub type DataMap = serde_json::Map<String, serde_json::Value>;
