//! Context repository trait.

use streamflow_types::context::Context;
use streamflow_types::error::RepositoryError;
use uuid::Uuid;

/// Persistence for context tokens.
///
/// Synchronous: pipeline stages persist from inside `consume`, which runs on
/// the emitting thread. Async callers go through `spawn_blocking`.
pub trait ContextRepository: Send + Sync {
    /// Load contexts by id. Unknown ids are skipped; the result keeps the
    /// order of `ids`.
    fn get_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Context>, RepositoryError>;

    /// Insert or replace each context by id.
    fn save(&self, contexts: &[Context]) -> Result<(), RepositoryError>;
}
