//! Compiled pipeline caches.
//!
//! Two independent caches hold compiled flows: one keyed by external stream
//! id, one by definition id. A stream-id miss loads the published definition
//! and then goes through the definition-id cache, so both keys share a single
//! compiled pipeline. Every miss is single-flight, failed ones included:
//! concurrent callers share one repository load and one error.

pub mod ttl;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use streamflow_types::config::CacheConfig;
use streamflow_types::definition::Definition;
use streamflow_types::error::RepositoryError;

use crate::pipeline::{CompileError, Pipeline, PipelineServices, compile};
use crate::repository::DefinitionRepository;

pub use ttl::BoundedTtlCache;

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("no definition is published for stream '{0}'")]
    StreamNotFound(String),

    #[error("definition '{0}' not found")]
    DefinitionNotFound(Uuid),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("compile error: {0}")]
    Compile(#[from] CompileError),
}

/// A definition together with the pipeline compiled from it. Never mutated;
/// a changed definition means invalidating and rebuilding.
#[derive(Debug)]
pub struct CompiledFlow {
    pub definition: Arc<Definition>,
    pub pipeline: Pipeline,
}

/// The two pipeline caches and what they need to fill themselves.
pub struct PipelineCache<R> {
    definitions: Arc<R>,
    services: PipelineServices,
    by_stream: BoundedTtlCache<String, Arc<CompiledFlow>, CacheError>,
    by_definition: BoundedTtlCache<Uuid, Arc<CompiledFlow>, CacheError>,
}

impl<R: DefinitionRepository> PipelineCache<R> {
    pub fn new(definitions: Arc<R>, services: PipelineServices, config: &CacheConfig) -> Self {
        let ttl = Duration::from_secs(config.idle_ttl_secs);
        Self {
            definitions,
            services,
            by_stream: BoundedTtlCache::new(config.max_entries, ttl),
            by_definition: BoundedTtlCache::new(config.max_entries, ttl),
        }
    }

    /// The flow currently published for `stream_id`.
    pub async fn by_stream_id(&self, stream_id: &str) -> Result<Arc<CompiledFlow>, CacheError> {
        self.by_stream
            .get_or_try_build(stream_id.to_string(), || async {
                tracing::debug!(stream_id, "pipeline cache miss (stream)");
                let definition = self
                    .definitions
                    .find_by_stream_id(stream_id)
                    .await?
                    .ok_or_else(|| CacheError::StreamNotFound(stream_id.to_string()))?;
                let id = definition.id;
                self.by_definition
                    .get_or_try_build(id, || async { self.compile(definition) })
                    .await
            })
            .await
    }

    /// The flow for one definition version, whether or not it is still the
    /// published one.
    pub async fn by_definition_id(&self, id: Uuid) -> Result<Arc<CompiledFlow>, CacheError> {
        self.by_definition
            .get_or_try_build(id, || async {
                tracing::debug!(definition_id = %id, "pipeline cache miss (definition)");
                let definition = self
                    .definitions
                    .find(&id)
                    .await?
                    .ok_or(CacheError::DefinitionNotFound(id))?;
                self.compile(definition)
            })
            .await
    }

    /// Drop both caches entirely.
    pub fn clear(&self) {
        self.by_stream.clear();
        self.by_definition.clear();
        tracing::info!("pipeline caches cleared");
    }

    /// Forget the flow cached for `stream_id`. The definition-id entry stays
    /// so contexts already running on that version are unaffected.
    pub fn invalidate_stream(&self, stream_id: &str) -> bool {
        let removed = self.by_stream.invalidate(&stream_id.to_string());
        tracing::info!(stream_id, removed, "stream pipeline invalidated");
        removed
    }

    /// Forget one definition version under both keys.
    pub fn invalidate_definition(&self, id: Uuid) -> bool {
        let removed = self.by_definition.invalidate(&id);
        let streams = self
            .by_stream
            .invalidate_if(|_, flow| flow.definition.id == id);
        tracing::info!(definition_id = %id, removed, streams, "definition pipeline invalidated");
        removed || streams > 0
    }

    /// Every compiled flow currently cached.
    pub fn flows(&self) -> Vec<Arc<CompiledFlow>> {
        self.by_definition.values()
    }

    /// Drop entries idle past the TTL from both caches.
    pub fn purge_expired(&self) -> usize {
        self.by_stream.purge_expired() + self.by_definition.purge_expired()
    }

    pub fn entry_counts(&self) -> (usize, usize) {
        (self.by_stream.len(), self.by_definition.len())
    }

    fn compile(&self, definition: Definition) -> Result<Arc<CompiledFlow>, CacheError> {
        let definition = Arc::new(definition);
        let pipeline = compile(Arc::clone(&definition), self.services.clone())?;
        Ok(Arc::new(CompiledFlow {
            definition,
            pipeline,
        }))
    }
}
