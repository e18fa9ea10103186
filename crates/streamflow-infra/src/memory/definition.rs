//! In-memory definition repository.
//!
//! Every version ever published stays reachable by id. Publishing a new
//! version for a stream moves that stream's pointer; it never edits the old
//! definition.

use dashmap::DashMap;
use uuid::Uuid;

use streamflow_core::repository::DefinitionRepository;
use streamflow_types::definition::Definition;
use streamflow_types::error::RepositoryError;

#[derive(Default)]
pub struct MemoryDefinitionRepository {
    by_id: DashMap<Uuid, Definition>,
    published: DashMap<String, Uuid>,
}

impl MemoryDefinitionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `definition` and make it the published version of its stream.
    /// Re-publishing an existing id is a conflict.
    pub fn publish(&self, definition: Definition) -> Result<Uuid, RepositoryError> {
        let id = definition.id;
        if self.by_id.contains_key(&id) {
            return Err(RepositoryError::Conflict(format!("definition {id} already exists")));
        }
        let stream_id = definition.stream_id.clone();
        self.by_id.insert(id, definition);
        self.published.insert(stream_id.clone(), id);
        tracing::info!(definition_id = %id, stream_id = %stream_id, "definition published");
        Ok(id)
    }

    /// Parse a JSON definition document and publish it.
    pub fn publish_json(&self, document: &str) -> Result<Uuid, RepositoryError> {
        let definition: Definition = serde_json::from_str(document)
            .map_err(|e| RepositoryError::Query(format!("invalid definition JSON: {e}")))?;
        self.publish(definition)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl DefinitionRepository for MemoryDefinitionRepository {
    async fn find_by_stream_id(
        &self,
        stream_id: &str,
    ) -> Result<Option<Definition>, RepositoryError> {
        let Some(id) = self.published.get(stream_id).map(|r| *r.value()) else {
            return Ok(None);
        };
        Ok(self.by_id.get(&id).map(|d| d.value().clone()))
    }

    async fn find(&self, id: &Uuid) -> Result<Option<Definition>, RepositoryError> {
        Ok(self.by_id.get(id).map(|d| d.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamflow_types::definition::{Node, NodeKind};

    fn version(stream_id: &str, version: &str) -> Definition {
        Definition {
            id: Uuid::now_v7(),
            stream_id: stream_id.into(),
            version: version.into(),
            name: String::new(),
            nodes: vec![
                Node::new("start", NodeKind::Start).to("end"),
                Node::new("end", NodeKind::End),
            ],
        }
    }

    #[tokio::test]
    async fn new_version_moves_the_stream_pointer_only() {
        let repo = MemoryDefinitionRepository::new();
        let v1 = repo.publish(version("orders", "1")).unwrap();
        let v2 = repo.publish(version("orders", "2")).unwrap();

        let current = repo.find_by_stream_id("orders").await.unwrap().unwrap();
        assert_eq!(current.id, v2);
        let old = repo.find(&v1).await.unwrap().unwrap();
        assert_eq!(old.version, "1");
        assert!(repo.find_by_stream_id("other").await.unwrap().is_none());
    }

    #[test]
    fn duplicate_id_is_a_conflict() {
        let repo = MemoryDefinitionRepository::new();
        let def = version("orders", "1");
        repo.publish(def.clone()).unwrap();
        assert!(matches!(repo.publish(def), Err(RepositoryError::Conflict(_))));
    }

    #[tokio::test]
    async fn publish_from_json_document() {
        let repo = MemoryDefinitionRepository::new();
        let id = repo
            .publish_json(
                r#"{
                    "id": "0191e0a0-0000-7000-8000-000000000001",
                    "streamId": "orders",
                    "version": "3",
                    "nodes": [
                        {"id": "start", "kind": "START", "subscriptions": [{"target": "check"}]},
                        {"id": "check", "kind": "CONDITION", "subscriptions": [
                            {"target": "end", "rule": "businessData.ok"}
                        ]},
                        {"id": "end", "kind": "END"}
                    ]
                }"#,
            )
            .unwrap();
        let def = repo.find(&id).await.unwrap().unwrap();
        assert_eq!(def.nodes.len(), 3);
        assert_eq!(def.nodes[1].subscriptions[0].rule.as_deref(), Some("businessData.ok"));

        assert!(matches!(
            repo.publish_json("{not json"),
            Err(RepositoryError::Query(_))
        ));
    }
}
