use crate::graph::{EntityKey, EntityRecord, EntityReference, RelationshipRecord};
use serde::Serialize;
use std::collections::BTreeSet;

/// How deleting one document partitions the entities that mention it.
///
/// Derived from a fresh analysis under lock and discarded afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeletionPlan {
    pub document_id: String,
    /// Referenced by the target document only.
    pub entities_to_remove: Vec<EntityReference>,
    /// Still referenced by at least one other document.
    pub entities_to_preserve: Vec<EntityReference>,
    /// Every relationship with an endpoint in `entities_to_remove`.
    pub relationships_to_remove: Vec<RelationshipRecord>,
}

impl DeletionPlan {
    pub fn build(
        document_id: &str,
        entities: &[EntityRecord],
        relationships: &[RelationshipRecord],
    ) -> Self {
        let mut plan = DeletionPlan {
            document_id: document_id.to_string(),
            ..Default::default()
        };
        for e in entities {
            if !e.source_documents.contains(document_id) {
                continue;
            }
            let reference = e.reference();
            if e.source_documents.iter().all(|d| d == document_id) {
                plan.entities_to_remove.push(reference);
            } else {
                plan.entities_to_preserve.push(reference);
            }
        }
        plan.entities_to_remove.sort_by(|a, b| a.key().cmp(&b.key()));
        plan.entities_to_preserve.sort_by(|a, b| a.key().cmp(&b.key()));

        let removed = plan.removed_keys();
        let mut rels: Vec<RelationshipRecord> = relationships
            .iter()
            .filter(|r| removed.contains(&r.key.source) || removed.contains(&r.key.target))
            .cloned()
            .collect();
        rels.sort_by(|a, b| a.key.cmp(&b.key));
        rels.dedup_by(|a, b| a.key == b.key);
        plan.relationships_to_remove = rels;
        plan
    }

    pub fn removed_keys(&self) -> BTreeSet<EntityKey> {
        self.entities_to_remove.iter().map(EntityReference::key).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entities_to_remove.is_empty() && self.entities_to_preserve.is_empty()
    }
}
