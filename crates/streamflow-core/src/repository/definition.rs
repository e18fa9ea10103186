//! Definition repository trait.

use streamflow_types::definition::Definition;
use streamflow_types::error::RepositoryError;
use uuid::Uuid;

/// Read access to published flow definitions.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait DefinitionRepository: Send + Sync {
    /// The definition currently published for an external stream id.
    fn find_by_stream_id(
        &self,
        stream_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<Definition>, RepositoryError>> + Send;

    /// A definition by its own id. Old versions stay reachable here so
    /// in-flight contexts keep running on the version they started with.
    fn find(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Definition>, RepositoryError>> + Send;
}
