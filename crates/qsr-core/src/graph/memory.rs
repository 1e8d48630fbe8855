//! In-process graph store.
//!
//! Implements every [`GraphQuery`] over ordered maps and supports failure
//! injection, artificial latency, and a mutation journal. Used by the test
//! suites and by `qsrctl` when no external store is configured.

use super::{
    EntityKey, EntityRecord, GraphQuery, GraphStore, QueryResult, RelationshipKey,
    RelationshipRecord,
};
use crate::error::ErrorKind;
use async_trait::async_trait;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Makes matching queries fail with `kind`.
#[derive(Debug, Clone)]
pub struct FailureRule {
    /// [`GraphQuery::op_name`] to match.
    pub op: &'static str,
    /// Only match mutations touching this entity name (any endpoint for relationships).
    pub entity_name: Option<String>,
    pub kind: ErrorKind,
    /// `None` fails forever; `Some(n)` fails the next `n` matches.
    pub remaining: Option<u32>,
}

impl FailureRule {
    pub fn always(op: &'static str, kind: ErrorKind) -> Self {
        Self {
            op,
            entity_name: None,
            kind,
            remaining: None,
        }
    }

    pub fn times(op: &'static str, kind: ErrorKind, n: u32) -> Self {
        Self {
            op,
            entity_name: None,
            kind,
            remaining: Some(n),
        }
    }

    pub fn for_entity(mut self, name: impl Into<String>) -> Self {
        self.entity_name = Some(name.into());
        self
    }

    fn matches(&self, query: &GraphQuery) -> bool {
        if self.op != query.op_name() || self.remaining == Some(0) {
            return false;
        }
        let Some(name) = &self.entity_name else {
            return true;
        };
        match query {
            GraphQuery::DeleteEntity { entity } | GraphQuery::SetSourceDocuments { entity, .. } => {
                &entity.name == name
            }
            GraphQuery::CreateEntity { entity } => &entity.key.name == name,
            GraphQuery::DeleteRelationship { relationship } => {
                &relationship.source.name == name || &relationship.target.name == name
            }
            GraphQuery::CreateRelationship { relationship } => {
                &relationship.key.source.name == name || &relationship.key.target.name == name
            }
            _ => true,
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    entities: BTreeMap<EntityKey, EntityRecord>,
    relationships: BTreeMap<RelationshipKey, RelationshipRecord>,
    next_node: u64,
    failures: Vec<FailureRule>,
    offline: bool,
    latency: Duration,
    journal: Vec<GraphQuery>,
}

#[derive(Debug, Default)]
pub struct InMemoryGraph {
    state: Mutex<MemoryState>,
}

impl InMemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    // -----------------------------------------------------------------------
    // Seeding and inspection
    // -----------------------------------------------------------------------

    /// Insert or replace an entity directly, bypassing failure injection.
    pub fn put_entity(&self, mut record: EntityRecord) {
        let mut state = self.lock();
        state.next_node += 1;
        record.node_id = Some(format!("n{}", state.next_node));
        state.entities.insert(record.key.clone(), record);
    }

    pub fn put_relationship(&self, record: RelationshipRecord) {
        self.lock().relationships.insert(record.key.clone(), record);
    }

    pub fn entity(&self, key: &EntityKey) -> Option<EntityRecord> {
        self.lock().entities.get(key).cloned()
    }

    pub fn entity_names(&self) -> Vec<String> {
        self.lock().entities.keys().map(|k| k.name.clone()).collect()
    }

    pub fn relationships(&self) -> Vec<RelationshipRecord> {
        self.lock().relationships.values().cloned().collect()
    }

    /// Mutations applied so far, in order.
    pub fn journal(&self) -> Vec<GraphQuery> {
        self.lock().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.lock().journal.clear();
    }

    // -----------------------------------------------------------------------
    // Fault injection
    // -----------------------------------------------------------------------

    pub fn inject_failure(&self, rule: FailureRule) {
        self.lock().failures.push(rule);
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// While offline every query fails with a connection error.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    // -----------------------------------------------------------------------
    // Query evaluation
    // -----------------------------------------------------------------------

    fn apply(state: &mut MemoryState, query: &GraphQuery) -> QueryResult {
        match query {
            GraphQuery::EntitiesForDocument { document_id } => QueryResult::ok(
                state
                    .entities
                    .values()
                    .filter(|e| e.source_documents.contains(document_id))
                    .map(to_value)
                    .collect(),
            ),
            GraphQuery::SnapshotEntities { entities } => QueryResult::ok(
                entities
                    .iter()
                    .filter_map(|k| state.entities.get(k))
                    .map(to_value)
                    .collect(),
            ),
            GraphQuery::RelationshipsTouching { entities } => QueryResult::ok(
                state
                    .relationships
                    .values()
                    .filter(|r| entities.iter().any(|k| r.key.touches(k)))
                    .map(to_value)
                    .collect(),
            ),
            GraphQuery::CountDocumentReferences { document_id } => {
                let count = state
                    .entities
                    .values()
                    .filter(|e| e.source_documents.contains(document_id))
                    .count();
                QueryResult::ok(vec![json!({ "count": count })])
            }
            GraphQuery::DeleteRelationship { relationship } => {
                let affected = usize::from(state.relationships.remove(relationship).is_some());
                affected_result(affected)
            }
            GraphQuery::DeleteEntity { entity } => {
                let affected = usize::from(state.entities.remove(entity).is_some());
                // DETACH semantics.
                state.relationships.retain(|k, _| !k.touches(entity));
                affected_result(affected)
            }
            GraphQuery::SetSourceDocuments {
                entity,
                source_documents,
            } => match state.entities.get_mut(entity) {
                Some(record) => {
                    record.source_documents = source_documents.clone();
                    affected_result(1)
                }
                None => affected_result(0),
            },
            GraphQuery::CreateEntity { entity } => {
                state.next_node += 1;
                let mut record = entity.clone();
                // A recreated node gets a fresh internal id; identity is the key.
                record.node_id = Some(format!("n{}", state.next_node));
                state.entities.insert(record.key.clone(), record);
                affected_result(1)
            }
            GraphQuery::CreateRelationship { relationship } => {
                let key = &relationship.key;
                if !state.entities.contains_key(&key.source)
                    || !state.entities.contains_key(&key.target)
                {
                    return QueryResult::failed(
                        ErrorKind::Validation,
                        format!("relationship endpoint missing for {key}"),
                    );
                }
                state
                    .relationships
                    .entry(key.clone())
                    .or_insert_with(|| relationship.clone());
                affected_result(1)
            }
        }
    }
}

fn to_value<T: serde::Serialize>(v: &T) -> serde_json::Value {
    serde_json::to_value(v).unwrap_or(serde_json::Value::Null)
}

fn affected_result(n: usize) -> QueryResult {
    QueryResult::ok(vec![json!({ "affected": n })])
}

#[async_trait]
impl GraphStore for InMemoryGraph {
    async fn execute_query(&self, query: &GraphQuery) -> QueryResult {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.lock();
        if state.offline {
            return QueryResult::failed(ErrorKind::Connection, "graph store unreachable");
        }
        if let Some(rule) = state.failures.iter_mut().find(|r| r.matches(query)) {
            if let Some(n) = rule.remaining.as_mut() {
                *n -= 1;
            }
            return QueryResult::failed(rule.kind, format!("injected {} failure", rule.kind));
        }

        let result = Self::apply(&mut state, query);
        if result.success && query.is_mutation() {
            state.journal.push(query.clone());
        }
        result
    }
}
