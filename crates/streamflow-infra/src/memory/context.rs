//! In-memory context repository.

use dashmap::DashMap;
use uuid::Uuid;

use streamflow_core::repository::ContextRepository;
use streamflow_types::context::Context;
use streamflow_types::error::RepositoryError;

/// `ContextRepository` over a concurrent map of JSON records.
#[derive(Default)]
pub struct MemoryContextRepository {
    records: DashMap<Uuid, serde_json::Value>,
}

impl MemoryContextRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The stored JSON record for `id`.
    pub fn record(&self, id: &Uuid) -> Option<serde_json::Value> {
        self.records.get(id).map(|r| r.value().clone())
    }

    /// Every stored context, in no particular order.
    pub fn all(&self) -> Result<Vec<Context>, RepositoryError> {
        self.records.iter().map(|r| decode(r.value())).collect()
    }
}

impl ContextRepository for MemoryContextRepository {
    fn get_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Context>, RepositoryError> {
        ids.iter()
            .filter_map(|id| self.records.get(id))
            .map(|r| decode(r.value()))
            .collect()
    }

    fn save(&self, contexts: &[Context]) -> Result<(), RepositoryError> {
        for context in contexts {
            let record = serde_json::to_value(context)
                .map_err(|e| RepositoryError::Query(format!("cannot encode context: {e}")))?;
            self.records.insert(context.id, record);
        }
        Ok(())
    }
}

fn decode(record: &serde_json::Value) -> Result<Context, RepositoryError> {
    serde_json::from_value(record.clone())
        .map_err(|e| RepositoryError::Query(format!("invalid context record: {e}")))
}
