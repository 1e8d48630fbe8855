use super::{DocId, EntityKey, EntityRecord, RelationshipKey, RelationshipRecord};
use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;

/// Every query the core issues against the graph store.
///
/// Serialized with an `op` tag so a query can be persisted in a DLQ entry and
/// replayed later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum GraphQuery {
    /// Entities whose `source_documents` contains the document.
    EntitiesForDocument { document_id: DocId },
    /// Full records for the given entities (missing keys are skipped).
    SnapshotEntities { entities: Vec<EntityKey> },
    /// Relationships with either endpoint in the given set.
    RelationshipsTouching { entities: Vec<EntityKey> },
    /// Returns one record `{"count": n}`: entities still tagged with the document.
    CountDocumentReferences { document_id: DocId },
    DeleteRelationship { relationship: RelationshipKey },
    DeleteEntity { entity: EntityKey },
    SetSourceDocuments {
        entity: EntityKey,
        source_documents: BTreeSet<DocId>,
    },
    /// Create-or-replace keyed on the business key.
    CreateEntity { entity: EntityRecord },
    /// Create-if-absent keyed on `(source, rel_type, target)`.
    CreateRelationship { relationship: RelationshipRecord },
}

impl GraphQuery {
    pub fn op_name(&self) -> &'static str {
        match self {
            GraphQuery::EntitiesForDocument { .. } => "entities_for_document",
            GraphQuery::SnapshotEntities { .. } => "snapshot_entities",
            GraphQuery::RelationshipsTouching { .. } => "relationships_touching",
            GraphQuery::CountDocumentReferences { .. } => "count_document_references",
            GraphQuery::DeleteRelationship { .. } => "delete_relationship",
            GraphQuery::DeleteEntity { .. } => "delete_entity",
            GraphQuery::SetSourceDocuments { .. } => "set_source_documents",
            GraphQuery::CreateEntity { .. } => "create_entity",
            GraphQuery::CreateRelationship { .. } => "create_relationship",
        }
    }

    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            GraphQuery::DeleteRelationship { .. }
                | GraphQuery::DeleteEntity { .. }
                | GraphQuery::SetSourceDocuments { .. }
                | GraphQuery::CreateEntity { .. }
                | GraphQuery::CreateRelationship { .. }
        )
    }

    /// Render as a Cypher statement plus parameters for Neo4j-style adapters.
    ///
    /// Fails only when a relationship type to be created is not a plain
    /// identifier, since it is written into the statement text.
    pub fn cypher(&self) -> Result<(String, Value)> {
        let rendered = match self {
            GraphQuery::EntitiesForDocument { document_id } => (
                "MATCH (e:Entity) WHERE $document_id IN e.source_documents \
                 RETURN elementId(e) AS node_id, e.name AS name, e.type AS type, \
                 e.description AS description, e.source_documents AS source_documents"
                    .to_string(),
                json!({ "document_id": document_id }),
            ),
            GraphQuery::SnapshotEntities { entities } => (
                "UNWIND $keys AS k MATCH (e:Entity {name: k.name, type: k.type}) \
                 RETURN elementId(e) AS node_id, e.name AS name, e.type AS type, \
                 e.description AS description, e.source_documents AS source_documents, \
                 properties(e) AS properties"
                    .to_string(),
                json!({ "keys": entities }),
            ),
            GraphQuery::RelationshipsTouching { entities } => (
                "UNWIND $keys AS k MATCH (e:Entity {name: k.name, type: k.type})-[r]-(o:Entity) \
                 WITH DISTINCT r, startNode(r) AS s, endNode(r) AS t \
                 RETURN {name: s.name, type: s.type} AS source, type(r) AS rel_type, \
                 {name: t.name, type: t.type} AS target, r.description AS description, \
                 properties(r) AS properties"
                    .to_string(),
                json!({ "keys": entities }),
            ),
            GraphQuery::CountDocumentReferences { document_id } => (
                "MATCH (e:Entity) WHERE $document_id IN e.source_documents RETURN count(e) AS count"
                    .to_string(),
                json!({ "document_id": document_id }),
            ),
            GraphQuery::DeleteRelationship { relationship } => (
                "MATCH (s:Entity {name: $source.name, type: $source.type})\
                 -[r]->(t:Entity {name: $target.name, type: $target.type}) \
                 WHERE type(r) = $rel_type DELETE r RETURN count(r) AS affected"
                    .to_string(),
                json!({
                    "source": relationship.source,
                    "rel_type": relationship.rel_type,
                    "target": relationship.target,
                }),
            ),
            GraphQuery::DeleteEntity { entity } => (
                "MATCH (e:Entity {name: $name, type: $type}) DETACH DELETE e RETURN count(e) AS affected"
                    .to_string(),
                json!({ "name": entity.name, "type": entity.entity_type }),
            ),
            GraphQuery::SetSourceDocuments {
                entity,
                source_documents,
            } => (
                "MATCH (e:Entity {name: $name, type: $type}) \
                 SET e.source_documents = $source_documents RETURN count(e) AS affected"
                    .to_string(),
                json!({
                    "name": entity.name,
                    "type": entity.entity_type,
                    "source_documents": source_documents,
                }),
            ),
            GraphQuery::CreateEntity { entity } => (
                "MERGE (e:Entity {name: $name, type: $type}) \
                 SET e += $properties, e.description = $description, \
                 e.source_documents = $source_documents RETURN count(e) AS affected"
                    .to_string(),
                json!({
                    "name": entity.key.name,
                    "type": entity.key.entity_type,
                    "description": entity.description,
                    "source_documents": entity.source_documents,
                    "properties": entity.properties,
                }),
            ),
            // Cypher cannot parameterize a relationship type in MERGE.
            GraphQuery::CreateRelationship { relationship } => {
                let rel_type = &relationship.key.rel_type;
                if !is_valid_rel_type(rel_type) {
                    return Err(CoreError::Validation(format!(
                        "relationship type '{rel_type}' must be letters, digits and underscores"
                    )));
                }
                (
                    format!(
                        "MATCH (s:Entity {{name: $source.name, type: $source.type}}), \
                         (t:Entity {{name: $target.name, type: $target.type}}) \
                         MERGE (s)-[r:`{rel_type}`]->(t) SET r += $properties, \
                         r.description = $description RETURN count(r) AS affected"
                    ),
                    json!({
                        "source": relationship.key.source,
                        "target": relationship.key.target,
                        "description": relationship.description,
                        "properties": relationship.properties,
                    }),
                )
            }
        };
        Ok(rendered)
    }
}

/// Relationship types are written into Cypher text, so only plain
/// identifiers are accepted.
pub fn is_valid_rel_type(rel_type: &str) -> bool {
    !rel_type.is_empty() && rel_type.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
