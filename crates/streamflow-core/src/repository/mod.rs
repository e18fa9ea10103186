//! Repository trait definitions (ports).
//!
//! The infrastructure layer (streamflow-infra) implements these. The core
//! crate never depends on a specific storage technology.

pub mod context;
pub mod definition;

pub use context::ContextRepository;
pub use definition::DefinitionRepository;
