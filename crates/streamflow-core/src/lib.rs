//! Workflow execution core for streamflow.
//!
//! Contains the reactive stream primitives, the condition language, the
//! compiler from flow definitions to pipelines, the pipeline caches and
//! per-context locks, and task event handling. Storage is reached only
//! through the repository traits in `repository`; `streamflow-infra`
//! provides implementations.

pub mod cache;
pub mod condition;
pub mod engine;
pub mod lock;
pub mod pipeline;
pub mod repository;
pub mod stream;
pub mod task;
