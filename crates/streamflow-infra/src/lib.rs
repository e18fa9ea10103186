//! Infrastructure layer for streamflow.
//!
//! Contains implementations of the ports defined in `streamflow-core`:
//! in-memory definition and context repositories, a logging exception
//! router and operator, the engine configuration loader and process
//! start-up.

pub mod bootstrap;
pub mod config;
pub mod exception;
pub mod memory;
pub mod operator;
