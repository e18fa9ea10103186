//! Task event handling.
//!
//! When a context batch parks at a TASK node the pipeline raises a
//! `TaskEvent`. The handler turns that event into a call on the operator
//! selected by the task's source type, off the pipeline's thread.
//!
//! - `converter` -- named data converters applied before dispatch
//! - `operator` -- operator trait, its boxed form and the per-source table
//! - `exception` -- exception routing for failed dispatches
//! - `handler` -- the load / convert / persist / dispatch sequence

pub mod converter;
pub mod exception;
pub mod handler;
pub mod operator;

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use streamflow_types::error::RepositoryError;

use crate::cache::CacheError;
use crate::pipeline::StageError;

pub use converter::{ConverterRegistry, DataConverter};
pub use exception::{BoxExceptionRouter, ExceptionReport, ExceptionRouter};
pub use handler::TaskEventHandler;
pub use operator::{BoxTaskOperator, TaskOperator, TaskOperators, TaskOutcome};

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("no persisted contexts for ids {0:?}")]
    ContextsNotFound(Vec<Uuid>),

    #[error("no context of the batch is waiting at node '{0}'")]
    NothingWaiting(String),

    #[error("pipeline unavailable: {0}")]
    Cache(#[from] CacheError),

    #[error("node '{0}' not found in definition")]
    NodeNotFound(String),

    #[error("node '{0}' has no task descriptor")]
    NotATask(String),

    #[error("converter '{0}' is not registered")]
    UnknownConverter(String),

    #[error("conversion failed: {0}")]
    Conversion(String),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("dispatch failed: {0}")]
    Dispatch(String),

    #[error("dispatch timed out after {0:?}")]
    Timeout(Duration),

    #[error("forwarding completed contexts failed: {0}")]
    Forward(#[from] StageError),

    #[error("exception routing failed: {0}")]
    Routing(String),

    #[error("blocking section failed: {0}")]
    Blocking(String),
}
