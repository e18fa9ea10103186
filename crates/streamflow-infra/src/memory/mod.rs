//! In-memory storage.
//!
//! Records are kept as JSON documents, the same layout a persistent store
//! would hold, so anything that cannot round-trip through serde fails here
//! too.

pub mod context;
pub mod definition;

pub use context::MemoryContextRepository;
pub use definition::MemoryDefinitionRepository;
