//! Observability setup for streamflow.

pub mod tracing_setup;
